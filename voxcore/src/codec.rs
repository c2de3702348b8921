//! Audio codec capability.
//!
//! The media pipeline only sees these traits. Samples are interleaved
//! signed 16-bit PCM.

/// Errors from encoding or decoding a single frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported codec format: {0}")]
    Unsupported(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("codec failure: {0}")]
    Backend(String),
}

/// Compresses one PCM frame.
pub trait AudioEncoder: Send {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError>;
}

/// Decompresses one frame into at most `expected_samples` interleaved samples.
pub trait AudioDecoder: Send {
    fn decode(&mut self, frame: &[u8], expected_samples: usize) -> Result<Vec<i16>, CodecError>;
}

/// Uncompressed s16le pass-through.
///
/// Short frames are zero-padded to the configured frame size on encode.
#[derive(Debug, Clone)]
pub struct PcmCodec {
    frame_samples: usize,
}

impl PcmCodec {
    pub fn new(frame_samples: usize) -> Self {
        Self { frame_samples }
    }
}

impl AudioEncoder for PcmCodec {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
        let mut bytes = samples_to_bytes(pcm);
        if pcm.len() < self.frame_samples {
            bytes.resize(self.frame_samples * 2, 0);
        }
        Ok(bytes)
    }
}

impl AudioDecoder for PcmCodec {
    fn decode(&mut self, frame: &[u8], expected_samples: usize) -> Result<Vec<i16>, CodecError> {
        if frame.len() % 2 != 0 {
            return Err(CodecError::InvalidFrame(format!(
                "odd pcm frame length {}",
                frame.len()
            )));
        }
        let mut samples = bytes_to_samples(frame);
        if samples.len() > expected_samples {
            samples.truncate(expected_samples);
        }
        Ok(samples)
    }
}

/// Little-endian byte form of `samples`.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Parse little-endian samples; a trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}
