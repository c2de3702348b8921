//! Local audio endpoints.
//!
//! Capture reads from an [`AudioSource`], playback writes to an
//! [`AudioSink`]. Device backends plug in here; the bundled endpoints work
//! on raw s16le files so the client runs headless.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use voxcore::codec::{bytes_to_samples, samples_to_bytes};

/// Produces interleaved PCM frames.
#[async_trait]
pub trait AudioSource: Send {
    /// Read up to `samples` interleaved samples. `None` means end of input.
    async fn read_frame(&mut self, samples: usize) -> Result<Option<Vec<i16>>>;
}

/// Consumes interleaved PCM frames.
#[async_trait]
pub trait AudioSink: Send {
    async fn write_frame(&mut self, pcm: &[i16]) -> Result<()>;

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Endless digital silence.
#[derive(Debug, Default, Clone)]
pub struct SilenceSource;

#[async_trait]
impl AudioSource for SilenceSource {
    async fn read_frame(&mut self, samples: usize) -> Result<Option<Vec<i16>>> {
        Ok(Some(vec![0; samples]))
    }
}

/// Raw little-endian 16-bit PCM file.
pub struct RawFileSource {
    reader: BufReader<File>,
}

impl RawFileSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }
}

#[async_trait]
impl AudioSource for RawFileSource {
    async fn read_frame(&mut self, samples: usize) -> Result<Option<Vec<i16>>> {
        let mut buf = vec![0u8; samples * 2];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < 2 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(bytes_to_samples(&buf)))
    }
}

/// Discards everything, counting frames.
#[derive(Debug, Default)]
pub struct NullSink {
    pub frames_written: u64,
}

#[async_trait]
impl AudioSink for NullSink {
    async fn write_frame(&mut self, _pcm: &[i16]) -> Result<()> {
        self.frames_written += 1;
        Ok(())
    }
}

/// Appends raw little-endian 16-bit PCM to a file.
pub struct RawFileSink {
    writer: BufWriter<File>,
}

impl RawFileSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path).await?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub async fn append(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

#[async_trait]
impl AudioSink for RawFileSink {
    async fn write_frame(&mut self, pcm: &[i16]) -> Result<()> {
        self.writer.write_all(&samples_to_bytes(pcm)).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }
}

/// Opens the endpoints for each media session.
///
/// A session re-grant restarts the media tasks, so this may be called more
/// than once per process.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    async fn open_source(&self) -> Result<Box<dyn AudioSource>>;
    async fn open_sink(&self) -> Result<Box<dyn AudioSink>>;
}

/// Raw-file endpoints, falling back to silence in and discard out.
#[derive(Debug, Default)]
pub struct FileAudioBackend {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    sink_opened: AtomicBool,
}

impl FileAudioBackend {
    pub fn new(input: Option<PathBuf>, output: Option<PathBuf>) -> Self {
        Self {
            input,
            output,
            sink_opened: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl AudioBackend for FileAudioBackend {
    async fn open_source(&self) -> Result<Box<dyn AudioSource>> {
        match &self.input {
            Some(path) => Ok(Box::new(RawFileSource::open(path).await?)),
            None => Ok(Box::new(SilenceSource)),
        }
    }

    async fn open_sink(&self) -> Result<Box<dyn AudioSink>> {
        let Some(path) = &self.output else {
            return Ok(Box::new(NullSink::default()));
        };
        // Later sessions keep appending to the same recording.
        if self.sink_opened.swap(true, Ordering::SeqCst) {
            Ok(Box::new(RawFileSink::append(path).await?))
        } else {
            Ok(Box::new(RawFileSink::create(path).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_raw_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.raw");

        let mut sink = RawFileSink::create(&path).await.unwrap();
        sink.write_frame(&[1, 2, 3, 4]).await.unwrap();
        sink.write_frame(&[5, 6, 7]).await.unwrap();
        sink.flush().await.unwrap();

        let mut source = RawFileSource::open(&path).await.unwrap();
        assert_eq!(source.read_frame(4).await.unwrap(), Some(vec![1, 2, 3, 4]));
        // Short final frame is returned as-is; the encoder pads it.
        assert_eq!(source.read_frame(4).await.unwrap(), Some(vec![5, 6, 7]));
        assert_eq!(source.read_frame(4).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_backend_appends_after_first_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let backend = FileAudioBackend::new(None, Some(path.clone()));

        for value in [7, 8] {
            let mut sink = backend.open_sink().await.unwrap();
            sink.write_frame(&[value]).await.unwrap();
            sink.flush().await.unwrap();
        }

        let mut source = RawFileSource::open(&path).await.unwrap();
        assert_eq!(source.read_frame(4).await.unwrap(), Some(vec![7, 8]));

        let mut silence = backend.open_source().await.unwrap();
        assert_eq!(silence.read_frame(2).await.unwrap(), Some(vec![0, 0]));
    }

    #[tokio::test]
    async fn test_silence_and_null() {
        let mut source = SilenceSource;
        assert_eq!(source.read_frame(3).await.unwrap(), Some(vec![0, 0, 0]));

        let mut sink = NullSink::default();
        sink.write_frame(&[1]).await.unwrap();
        assert_eq!(sink.frames_written, 1);
    }
}
