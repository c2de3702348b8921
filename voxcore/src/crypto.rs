//! Media packet encryption.
//!
//! Payloads are encrypted with AES in counter mode. The 16-byte packet header
//! is used verbatim as the initial counter block, so every packet gets a
//! fresh keystream as long as `(timestamp, sequence)` never repeats under a
//! key.
//!
//! There is no authentication tag. A packet whose header was damaged in
//! transit decrypts to garbage rather than failing; the gateway on the other
//! end works the same way and the wire format has no room for a tag.

use aes::cipher::{KeyIvInit, StreamCipher};

use crate::packet::{HEADER_LEN, MAX_PAYLOAD_LEN, PacketHeader};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Symmetric key for the media plane.
#[derive(Clone, PartialEq, Eq)]
pub enum MediaKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

impl std::fmt::Debug for MediaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Aes128(_) => "Aes128",
            Self::Aes256(_) => "Aes256",
        };
        f.debug_tuple(name).field(&"[REDACTED]").finish()
    }
}

impl MediaKey {
    /// Build a key from raw bytes; 16 bytes select AES-128, 32 bytes AES-256.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        match bytes.len() {
            16 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(bytes);
                Ok(Self::Aes128(key))
            }
            32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(bytes);
                Ok(Self::Aes256(key))
            }
            n => Err(PacketError::InvalidKeyLength(n)),
        }
    }

    /// Parse a hex-encoded key as carried in the session grant.
    pub fn from_hex(hex_key: &str) -> Result<Self, PacketError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| PacketError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Cipher name in the gateway's vocabulary.
    pub fn cipher_name(&self) -> &'static str {
        match self {
            Self::Aes128(_) => "aes-128-ctr",
            Self::Aes256(_) => "aes-256-ctr",
        }
    }

    /// XOR the keystream derived from `counter_block` into `data`.
    fn apply_keystream(&self, counter_block: &[u8; HEADER_LEN], data: &mut [u8]) {
        match self {
            Self::Aes128(key) => {
                let mut cipher = Aes128Ctr::new(key.as_slice().into(), counter_block.as_slice().into());
                cipher.apply_keystream(data);
            }
            Self::Aes256(key) => {
                let mut cipher = Aes256Ctr::new(key.as_slice().into(), counter_block.as_slice().into());
                cipher.apply_keystream(data);
            }
        }
    }
}

/// A decrypted media packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

/// Errors from packet encode/decode.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("truncated payload: header declares {declared} bytes, {available} present")]
    Truncated { declared: usize, available: usize },
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("invalid key length: {0} bytes")]
    InvalidKeyLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

/// Stateless encoder/decoder for one media session.
///
/// Holds no sequence state: the sender owns its counter and passes the next
/// value in on every call.
#[derive(Debug, Clone)]
pub struct SecureDatagramTransport {
    key: MediaKey,
    connection_id: u32,
}

impl SecureDatagramTransport {
    pub fn new(key: MediaKey, connection_id: u32) -> Self {
        Self { key, connection_id }
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn key(&self) -> &MediaKey {
        &self.key
    }

    /// Encode `payload` with the current wall-clock second as timestamp.
    pub fn encode(&self, sequence: u32, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
        let timestamp = chrono::Utc::now().timestamp() as u32;
        self.encode_at(sequence, timestamp, payload)
    }

    /// Encode `payload` with an explicit timestamp.
    pub fn encode_at(
        &self,
        sequence: u32,
        timestamp: u32,
        payload: &[u8],
    ) -> Result<Vec<u8>, PacketError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }

        let header =
            PacketHeader::audio(payload.len() as u16, self.connection_id, timestamp, sequence);
        let counter_block = header.to_bytes();

        let mut output = Vec::with_capacity(HEADER_LEN + payload.len());
        output.extend_from_slice(&counter_block);
        output.extend_from_slice(payload);
        self.key.apply_keystream(&counter_block, &mut output[HEADER_LEN..]);

        Ok(output)
    }

    /// Decode a packet received on this session.
    pub fn decode(&self, packet: &[u8]) -> Result<DecodedPacket, PacketError> {
        decode_packet(&self.key, packet)
    }
}

/// Split `packet` into header and plaintext.
///
/// Exactly `payload_len` bytes are decrypted; anything after them is ignored.
pub fn decode_packet(key: &MediaKey, packet: &[u8]) -> Result<DecodedPacket, PacketError> {
    if packet.len() < HEADER_LEN {
        return Err(PacketError::TooShort(packet.len()));
    }

    let header = PacketHeader::decode(packet).map_err(|_| PacketError::TooShort(packet.len()))?;
    let declared = header.payload_len as usize;
    let available = packet.len() - HEADER_LEN;
    if available < declared {
        return Err(PacketError::Truncated {
            declared,
            available,
        });
    }

    let mut counter_block = [0u8; HEADER_LEN];
    counter_block.copy_from_slice(&packet[..HEADER_LEN]);

    let mut payload = packet[HEADER_LEN..HEADER_LEN + declared].to_vec();
    key.apply_keystream(&counter_block, &mut payload);

    Ok(DecodedPacket { header, payload })
}
