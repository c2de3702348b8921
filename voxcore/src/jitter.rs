//! Watermark jitter buffer for decoded playback frames.
//!
//! The receive path pushes frames in arrival order; the playback path pulls
//! them at the frame cadence. Nothing is emitted until the queue has reached
//! the start watermark, and playback falls back to buffering as soon as the
//! queue drops below the minimum watermark.

use std::collections::VecDeque;
use std::time::Instant;

/// Configuration for the jitter buffer.
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Frames needed before playback starts (or resumes).
    pub start_watermark: usize,
    /// Playback reverts to buffering below this many frames.
    pub min_watermark: usize,
    /// Maximum queued frames; the oldest is dropped beyond this.
    pub capacity: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            start_watermark: 16, // 320ms at 20ms frames
            min_watermark: 3,
            capacity: 256,
        }
    }
}

/// Playback mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackMode {
    #[default]
    Buffering,
    Playing,
}

/// Statistics about the jitter buffer.
#[derive(Debug, Clone, Default)]
pub struct JitterStats {
    /// Frames accepted by `push`.
    pub frames_pushed: u64,
    /// Frames handed to the sink.
    pub frames_played: u64,
    /// Frames dropped because the queue was full.
    pub frames_dropped: u64,
    /// Number of Playing -> Buffering transitions.
    pub underruns: u64,
    /// Current queue depth.
    pub depth: usize,
}

/// Jitter buffer state.
#[derive(Debug)]
pub struct JitterBuffer<T> {
    config: JitterBufferConfig,
    queue: VecDeque<T>,
    mode: PlaybackMode,
    stats: JitterStats,
    last_fill: Option<Instant>,
}

impl<T> JitterBuffer<T> {
    pub fn new(config: JitterBufferConfig) -> Self {
        Self {
            queue: VecDeque::with_capacity(config.capacity.min(1024)),
            config,
            mode: PlaybackMode::Buffering,
            stats: JitterStats::default(),
            last_fill: None,
        }
    }

    /// Queue a frame. Returns `true` if the oldest frame was dropped to make room.
    pub fn push(&mut self, frame: T) -> bool {
        let mut dropped = false;
        if self.config.capacity > 0 && self.queue.len() >= self.config.capacity {
            self.queue.pop_front();
            self.stats.frames_dropped += 1;
            dropped = true;
        }

        self.queue.push_back(frame);
        self.stats.frames_pushed += 1;
        self.last_fill = Some(Instant::now());
        self.update_mode();
        dropped
    }

    /// Take the next frame if playback is running.
    ///
    /// Returns `None` while buffering, even if frames are queued.
    pub fn pull(&mut self) -> Option<T> {
        if self.mode != PlaybackMode::Playing {
            return None;
        }

        let frame = self.queue.pop_front();
        if frame.is_some() {
            self.stats.frames_played += 1;
        }
        self.update_mode();
        frame
    }

    /// Drop every queued frame and return to buffering.
    pub fn clear(&mut self) -> usize {
        let drained = self.queue.len();
        self.queue.clear();
        self.mode = PlaybackMode::Buffering;
        self.stats.depth = 0;
        drained
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn config(&self) -> &JitterBufferConfig {
        &self.config
    }

    /// Instant of the most recent `push`.
    pub fn last_fill(&self) -> Option<Instant> {
        self.last_fill
    }

    pub fn stats(&self) -> JitterStats {
        JitterStats {
            depth: self.queue.len(),
            ..self.stats.clone()
        }
    }

    fn update_mode(&mut self) {
        let len = self.queue.len();
        match self.mode {
            PlaybackMode::Buffering if len >= self.config.start_watermark => {
                log::debug!(target: "Media/Jitter", "Buffer ready ({len} frames), playing");
                self.mode = PlaybackMode::Playing;
            }
            PlaybackMode::Playing if len < self.config.min_watermark => {
                log::debug!(target: "Media/Jitter", "Buffer low ({len} frames), re-buffering");
                self.mode = PlaybackMode::Buffering;
                self.stats.underruns += 1;
            }
            _ => {}
        }
        self.stats.depth = len;
    }
}

impl<T> Default for JitterBuffer<T> {
    fn default() -> Self {
        Self::new(JitterBufferConfig::default())
    }
}
