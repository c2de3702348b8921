use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use voxcore::codec::AudioEncoder;

use super::sender::PacketSender;
use crate::audio::AudioSource;

/// Capture-loop settings.
pub struct CaptureContext {
    pub sender: Arc<PacketSender>,
    pub source: Box<dyn AudioSource>,
    pub encoder: Box<dyn AudioEncoder>,
    /// Interleaved samples in one frame.
    pub frame_samples: usize,
    pub frame_duration: Duration,
}

/// Paced read → encode → encrypt → send while the gate is open.
///
/// The gate is checked once per frame, so closing it stops capture within
/// one frame duration. The task waits for the gate to reopen afterwards.
pub async fn run_capture(
    ctx: CaptureContext,
    mut gate: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    let CaptureContext {
        sender,
        mut source,
        mut encoder,
        frame_samples,
        frame_duration,
    } = ctx;
    info!(target: "Media/Capture", "Capture task started, waiting for turn");

    'outer: loop {
        while !*gate.borrow_and_update() {
            tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                changed = gate.changed() => {
                    if changed.is_err() {
                        break 'outer;
                    }
                }
            }
        }

        info!(target: "Media/Capture", "Recording activated, streaming to {}", sender.server());
        let mut ticker = tokio::time::interval(frame_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sent_in_window = 0u32;
        let mut window_start = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'outer,
                _ = ticker.tick() => {}
            }
            if !*gate.borrow() {
                info!(target: "Media/Capture", "Recording stopped, waiting for next turn");
                break;
            }

            let pcm = match source.read_frame(frame_samples).await {
                Ok(Some(pcm)) => pcm,
                Ok(None) => {
                    info!(target: "Media/Capture", "Audio input exhausted");
                    break 'outer;
                }
                Err(e) => {
                    warn!(target: "Media/Capture", "Audio input failed: {e}");
                    break 'outer;
                }
            };

            let frame = match encoder.encode(&pcm) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(target: "Media/Capture", "Encode failed: {e}");
                    continue;
                }
            };

            match sender.send(&frame).await {
                Ok(_) => sent_in_window += 1,
                Err(e) => warn!(target: "Media/Capture", "Send failed: {e}"),
            }

            if window_start.elapsed() >= Duration::from_secs(1) {
                debug!(
                    target: "Media/Capture",
                    "Sent {sent_in_window} audio packets in the last second"
                );
                sent_in_window = 0;
                window_start = Instant::now();
            }
        }
    }

    info!(target: "Media/Capture", "Capture task finished");
}
