//! Runtime-agnostic core of the voxlink device transport: wire formats,
//! packet crypto, sequence and jitter bookkeeping, and the traits the
//! client plugs its HTTP and signaling implementations into.

pub mod bootstrap;
pub mod codec;
pub mod crypto;
pub mod identity;
pub mod jitter;
pub mod net;
pub mod packet;
pub mod sequence;
pub mod session;
pub mod signaling;
pub mod state;

pub use crypto::{DecodedPacket, MediaKey, PacketError, SecureDatagramTransport};
pub use identity::DeviceIdentity;
pub use jitter::{JitterBuffer, JitterBufferConfig, PlaybackMode};
pub use packet::{HEADER_LEN, PacketHeader, PacketType};
pub use sequence::{SequenceGap, SequenceStats, SequenceSummary, SequenceTracker};
pub use session::{AudioParams, SessionDescriptor, UdpGrant};
pub use signaling::{ClientMessage, ServerMessage, TtsState};
pub use state::{SessionState, SessionTransition};
