//! Media packet header.
//!
//! Every datagram on the media plane starts with a fixed 16-byte header:
//!
//! ```text
//! 0        1        2                 4                 8                12               16
//! +--------+--------+-----------------+-----------------+-----------------+-----------------+
//! |  type  | flags  | payload_len BE  | connection_id   | timestamp (s)   | sequence        |
//! +--------+--------+-----------------+-----------------+-----------------+-----------------+
//! ```
//!
//! The encoded header doubles as the AES-CTR counter block for the payload
//! that follows it.

use std::io;

/// Encoded header length in bytes.
pub const HEADER_LEN: usize = 16;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Packet types carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Compressed audio, or a control marker such as `ping:` on the same path.
    Audio = 0x01,
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Audio),
            _ => Err(value),
        }
    }
}

/// Media packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw packet type byte. Unknown values are preserved so that a corrupted
    /// header still decrypts (to garbage) instead of being rejected.
    pub packet_type: u8,
    pub flags: u8,
    pub payload_len: u16,
    pub connection_id: u32,
    /// Seconds since the Unix epoch, truncated to 32 bits.
    pub timestamp: u32,
    pub sequence: u32,
}

impl PacketHeader {
    /// Create an audio header.
    pub fn audio(payload_len: u16, connection_id: u32, timestamp: u32, sequence: u32) -> Self {
        Self {
            packet_type: PacketType::Audio as u8,
            flags: 0,
            payload_len,
            connection_id,
            timestamp,
            sequence,
        }
    }

    /// Typed packet type, if known.
    pub fn kind(&self) -> Option<PacketType> {
        PacketType::try_from(self.packet_type).ok()
    }

    /// Encode to the fixed 16-byte layout.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.packet_type;
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[4..8].copy_from_slice(&self.connection_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[12..16].copy_from_slice(&self.sequence.to_be_bytes());
        buf
    }

    /// Decode from the first 16 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, io::Error> {
        if buf.len() < HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("buffer too small for packet header: {} bytes", buf.len()),
            ));
        }

        Ok(Self {
            packet_type: buf[0],
            flags: buf[1],
            payload_len: u16::from_be_bytes([buf[2], buf[3]]),
            connection_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            timestamp: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            sequence: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

/// Extract the connection id from a hex-decoded nonce template.
///
/// The gateway hands out the header it would generate for `(len=0, ts=0,
/// seq=0)`; bytes 4..8 hold the connection id.
pub fn connection_id_from_template(template: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = template.get(4..8)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}
