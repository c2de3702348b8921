//! Playback side of the media plane.
//!
//! [`PlaybackBuffer`] wraps the watermark jitter buffer with a wakeup so the
//! playback task can wait for frames without polling; [`run_playback`]
//! drains it into the audio sink at the frame cadence.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use voxcore::jitter::{JitterBuffer, JitterBufferConfig, JitterStats, PlaybackMode};

use crate::audio::AudioSink;

/// Result of waiting for the next frame.
#[derive(Debug, PartialEq, Eq)]
pub enum PullResult {
    Frame(Vec<i16>),
    /// Nothing playable arrived before the timeout.
    Empty,
    /// The buffer was closed; no more frames will be produced.
    Closed,
}

/// Jitter buffer shared between the receive loop (producer) and the
/// playback loop (consumer).
pub struct PlaybackBuffer {
    inner: Mutex<JitterBuffer<Vec<i16>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl PlaybackBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        Self {
            inner: Mutex::new(JitterBuffer::new(config)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a decoded frame. Frames pushed after `close` are discarded.
    pub async fn push(&self, frame: Vec<i16>) {
        if self.is_closed() {
            return;
        }
        let dropped = self.inner.lock().await.push(frame);
        if dropped {
            debug!(target: "Media/Playback", "Playback buffer full, dropped oldest frame");
        }
        self.notify.notify_one();
    }

    /// Wait up to `timeout` for a playable frame.
    pub async fn pull(&self, timeout: Duration) -> PullResult {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_closed() {
                return PullResult::Closed;
            }
            if let Some(frame) = self.inner.lock().await.pull() {
                return PullResult::Frame(frame);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return PullResult::Empty;
            }
        }
    }

    /// Drop every queued frame. Returns how many were dropped.
    pub async fn clear(&self) -> usize {
        self.inner.lock().await.clear()
    }

    /// Wake any waiting consumer and refuse further frames.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> JitterStats {
        self.inner.lock().await.stats()
    }

    pub async fn mode(&self) -> PlaybackMode {
        self.inner.lock().await.mode()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Timing knobs for the playback loop.
#[derive(Debug, Clone)]
pub struct PlaybackTiming {
    pub frame_duration: Duration,
    pub pull_timeout: Duration,
    pub stall_warning: Duration,
}

/// Emit frames from `buffer` to `sink` until cancelled or closed.
///
/// `turn_active` only affects the wording of the stall warning.
pub async fn run_playback(
    buffer: Arc<PlaybackBuffer>,
    mut sink: Box<dyn AudioSink>,
    timing: PlaybackTiming,
    turn_active: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    info!(target: "Media/Playback", "Playback task started");
    let mut ticker = tokio::time::interval(timing.frame_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_progress = Instant::now();
    let mut was_playing = false;

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = buffer.pull(timing.pull_timeout) => result,
        };

        match result {
            PullResult::Frame(frame) => {
                if !was_playing {
                    info!(target: "Media/Playback", "Buffer ready, starting playback");
                    was_playing = true;
                }
                ticker.tick().await;
                if let Err(e) = sink.write_frame(&frame).await {
                    warn!(target: "Media/Playback", "Audio sink error: {e}");
                    break;
                }
                last_progress = Instant::now();
            }
            PullResult::Empty => {
                if was_playing {
                    debug!(target: "Media/Playback", "Playback buffer low, re-buffering");
                    was_playing = false;
                }
                if last_progress.elapsed() >= timing.stall_warning {
                    let depth = buffer.len().await;
                    if turn_active.load(Ordering::SeqCst) {
                        warn!(
                            target: "Media/Playback",
                            "No playable audio for {:?} during an active turn ({depth} frames queued). Possible server issue.",
                            timing.stall_warning
                        );
                    } else {
                        debug!(target: "Media/Playback", "Idle, {depth} frames queued");
                    }
                    last_progress = Instant::now();
                }
            }
            PullResult::Closed => break,
        }
    }

    if let Err(e) = sink.flush().await {
        warn!(target: "Media/Playback", "Audio sink flush failed: {e}");
    }
    info!(target: "Media/Playback", "Playback task finished");
}
