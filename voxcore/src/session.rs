//! Media session negotiation.
//!
//! A `hello` reply from the server carries a UDP grant; [`SessionDescriptor`]
//! is the validated, immutable form of that grant.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{MediaKey, PacketError, SecureDatagramTransport};
use crate::packet::connection_id_from_template;

/// Audio format negotiated for both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frame duration in milliseconds.
    #[serde(alias = "frame_duration_ms")]
    pub frame_duration: u32,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "opus".to_string()
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_duration: 20,
            format: default_format(),
        }
    }
}

impl AudioParams {
    /// Samples per channel in one frame.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration as usize) / 1000
    }

    /// Interleaved samples in one frame.
    pub fn frame_samples(&self) -> usize {
        self.samples_per_frame() * self.channels as usize
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.frame_duration))
    }
}

/// The `udp` block of a `hello` reply.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpGrant {
    pub server: String,
    pub port: u16,
    #[serde(default)]
    pub encryption: Option<String>,
    /// Hex-encoded symmetric key.
    pub key: String,
    /// Hex-encoded header template.
    pub nonce: String,
}

impl std::fmt::Debug for UdpGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpGrant")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("encryption", &self.encryption)
            .field("key", &"[REDACTED]")
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// Errors turning a grant into a descriptor.
#[derive(Debug, thiserror::Error)]
pub enum GrantError {
    #[error("hello reply has no udp grant")]
    MissingGrant,
    #[error("hello reply has no session id")]
    MissingSessionId,
    #[error("invalid media key: {0}")]
    InvalidKey(#[from] PacketError),
    #[error("invalid nonce template: {0}")]
    InvalidNonce(String),
    #[error("unsupported encryption mode: {0}")]
    UnsupportedEncryption(String),
    #[error("invalid audio parameters: {0}")]
    InvalidAudioParams(String),
}

/// Negotiated parameters for one media session.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub audio: AudioParams,
    pub key: MediaKey,
    pub nonce_template: Vec<u8>,
    pub server_host: String,
    pub server_port: u16,
    pub connection_id: u32,
}

impl SessionDescriptor {
    /// Validate a grant.
    ///
    /// `audio` falls back to the default parameters when the server did not
    /// echo any.
    pub fn from_grant(
        session_id: &str,
        audio: Option<AudioParams>,
        grant: &UdpGrant,
    ) -> Result<Self, GrantError> {
        if session_id.is_empty() {
            return Err(GrantError::MissingSessionId);
        }

        if let Some(mode) = grant.encryption.as_deref()
            && !mode.is_empty()
            && !mode.eq_ignore_ascii_case("aes-128-ctr")
            && !mode.eq_ignore_ascii_case("aes-256-ctr")
        {
            return Err(GrantError::UnsupportedEncryption(mode.to_string()));
        }

        let key = MediaKey::from_hex(&grant.key)?;
        let nonce_template =
            hex::decode(grant.nonce.trim()).map_err(|e| GrantError::InvalidNonce(e.to_string()))?;
        let connection_id = connection_id_from_template(&nonce_template).ok_or_else(|| {
            GrantError::InvalidNonce(format!("{} bytes, need at least 8", nonce_template.len()))
        })?;

        let audio = audio.unwrap_or_default();
        if audio.sample_rate == 0 || audio.channels == 0 || audio.frame_duration == 0 {
            return Err(GrantError::InvalidAudioParams(format!("{audio:?}")));
        }

        Ok(Self {
            session_id: session_id.to_string(),
            audio,
            key,
            nonce_template,
            server_host: grant.server.clone(),
            server_port: grant.port,
            connection_id,
        })
    }

    /// Media server address as `host:port`.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// Packet codec bound to this session's key and connection id.
    pub fn transport(&self) -> SecureDatagramTransport {
        SecureDatagramTransport::new(self.key.clone(), self.connection_id)
    }

    /// Payload of the reachability probe.
    pub fn probe_payload(&self) -> Vec<u8> {
        format!("ping:{}", self.session_id).into_bytes()
    }

    /// Payload of the turn-start keepalive.
    pub fn keepalive_payload(&self) -> Vec<u8> {
        format!("keepalive:{}", self.session_id).into_bytes()
    }
}
