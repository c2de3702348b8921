use std::time::Duration;

use thiserror::Error;
use voxcore::bootstrap::CredentialError;
use voxcore::session::GrantError;
use voxcore::state::InvalidTransition;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("bootstrap request failed: {0}")]
    Http(#[from] anyhow::Error),
    #[error("bootstrap request returned status {0}")]
    Status(u16),
    #[error("bootstrap response could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("bootstrap request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid signaling credentials: {0}")]
    Credentials(#[from] CredentialError),
    #[error("device not activated after {attempts} attempts (code {code})")]
    ActivationTimeout { attempts: u32, code: String },
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling connect failed: {0}")]
    Connect(anyhow::Error),
    #[error("signaling publish failed: {0}")]
    Publish(anyhow::Error),
    #[error("signaling publish timed out after {0:?}")]
    PublishTimeout(Duration),
    #[error("no hello reply within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("signaling channel closed")]
    Closed,
    #[error("malformed session grant: {0}")]
    Grant(#[from] GrantError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("packet error: {0}")]
    Packet(#[from] voxcore::crypto::PacketError),
    #[error("codec error: {0}")]
    Codec(#[from] voxcore::codec::CodecError),
    #[error("no media for {0:?}")]
    Timeout(Duration),
}

/// Aggregate error for the session controller and the binary.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("invalid session state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),
    #[error("no active media session")]
    NotStreaming,
    #[error("session controller has stopped")]
    Stopped,
}
