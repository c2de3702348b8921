//! Device-side real-time audio transport.
//!
//! A session is bootstrapped over HTTP, negotiated over a publish/subscribe
//! signaling channel and carried over an encrypted UDP media plane. The
//! wire formats and bookkeeping live in [`voxcore`]; this crate runs them on
//! tokio.

pub use voxcore::{crypto, jitter, packet, sequence, session, state};

pub mod audio;
pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod media;
pub mod signaling;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bootstrap::{BootstrapResult, ConfigBootstrapper};
pub use config::{Cli, ClientConfig};
pub use controller::{CloseReason, ControllerHandle, SessionController};
pub use error::{BootstrapError, MediaError, SessionError, SignalingError};
