//! Codec selection for a negotiated session.

use voxcore::codec::{AudioDecoder, AudioEncoder, CodecError, PcmCodec};
use voxcore::session::AudioParams;

fn is_pcm(format: &str) -> bool {
    matches!(format.to_ascii_lowercase().as_str(), "pcm" | "raw" | "s16le")
}

/// Encoder for the negotiated `format`.
pub fn encoder_for(params: &AudioParams) -> Result<Box<dyn AudioEncoder>, CodecError> {
    if is_pcm(&params.format) {
        return Ok(Box::new(PcmCodec::new(params.frame_samples())));
    }
    #[cfg(feature = "opus")]
    if params.format.eq_ignore_ascii_case("opus") {
        return Ok(Box::new(opus_codec::OpusCodec::new(params)?));
    }
    Err(CodecError::Unsupported(params.format.clone()))
}

/// Decoder for the negotiated `format`.
pub fn decoder_for(params: &AudioParams) -> Result<Box<dyn AudioDecoder>, CodecError> {
    if is_pcm(&params.format) {
        return Ok(Box::new(PcmCodec::new(params.frame_samples())));
    }
    #[cfg(feature = "opus")]
    if params.format.eq_ignore_ascii_case("opus") {
        return Ok(Box::new(opus_codec::OpusCodec::new(params)?));
    }
    Err(CodecError::Unsupported(params.format.clone()))
}

#[cfg(feature = "opus")]
mod opus_codec {
    use voxcore::codec::{AudioDecoder, AudioEncoder, CodecError};
    use voxcore::session::AudioParams;

    const MAX_PACKET: usize = 4000;

    pub struct OpusCodec {
        encoder: opus::Encoder,
        decoder: opus::Decoder,
        frame_samples: usize,
        channels: usize,
    }

    fn backend(e: opus::Error) -> CodecError {
        CodecError::Backend(e.to_string())
    }

    impl OpusCodec {
        pub fn new(params: &AudioParams) -> Result<Self, CodecError> {
            let channels = match params.channels {
                1 => opus::Channels::Mono,
                2 => opus::Channels::Stereo,
                n => return Err(CodecError::Unsupported(format!("opus with {n} channels"))),
            };
            Ok(Self {
                encoder: opus::Encoder::new(params.sample_rate, channels, opus::Application::Voip)
                    .map_err(backend)?,
                decoder: opus::Decoder::new(params.sample_rate, channels).map_err(backend)?,
                frame_samples: params.frame_samples(),
                channels: usize::from(params.channels),
            })
        }
    }

    impl AudioEncoder for OpusCodec {
        fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, CodecError> {
            let mut frame = pcm.to_vec();
            frame.resize(self.frame_samples, 0);
            let mut out = vec![0u8; MAX_PACKET];
            let n = self.encoder.encode(&frame, &mut out).map_err(backend)?;
            out.truncate(n);
            Ok(out)
        }
    }

    impl AudioDecoder for OpusCodec {
        fn decode(&mut self, frame: &[u8], expected_samples: usize) -> Result<Vec<i16>, CodecError> {
            let mut out = vec![0i16; expected_samples.max(self.frame_samples)];
            let per_channel = self.decoder.decode(frame, &mut out, false).map_err(backend)?;
            out.truncate((per_channel * self.channels).min(expected_samples));
            Ok(out)
        }
    }
}
