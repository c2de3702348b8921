//! UDP media plane for one granted session.
//!
//! [`MediaSession::bind`] resolves the media server, binds the socket and
//! sends the reachability probe; [`MediaSession::start`] spawns the receive,
//! playback and capture tasks. All three share one socket and stop on the
//! session's cancellation token.

pub mod capture;
pub mod playback;
pub mod receive;
pub mod sender;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use voxcore::jitter::JitterBufferConfig;
use voxcore::sequence::{SequenceSummary, SequenceTracker};
use voxcore::session::SessionDescriptor;

use crate::audio::{AudioSink, AudioSource};
use crate::codec::{decoder_for, encoder_for};
use crate::config::ClientConfig;
use crate::error::MediaError;

pub use capture::{CaptureContext, run_capture};
pub use playback::{PlaybackBuffer, PlaybackTiming, PullResult, run_playback};
pub use receive::{ReceiveContext, run_receive};
pub use sender::PacketSender;

/// State shared between the receive loop and the controller.
pub struct MediaShared {
    pub tracker: Mutex<SequenceTracker>,
    pub playback: Arc<PlaybackBuffer>,
    pub turn_active: Arc<AtomicBool>,
}

impl MediaShared {
    pub fn new(jitter: JitterBufferConfig) -> Self {
        Self {
            tracker: Mutex::new(SequenceTracker::new()),
            playback: Arc::new(PlaybackBuffer::new(jitter)),
            turn_active: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Media-plane knobs taken from [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub jitter: JitterBufferConfig,
    pub pull_timeout: Duration,
    pub stall_warning: Duration,
    pub recv_timeout: Duration,
    pub recv_buffer_size: usize,
}

impl From<&ClientConfig> for MediaSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            jitter: config.jitter.clone(),
            pull_timeout: config.pull_timeout,
            stall_warning: config.stall_warning,
            recv_timeout: config.recv_timeout,
            recv_buffer_size: config.recv_buffer_size,
        }
    }
}

pub struct MediaSession {
    descriptor: SessionDescriptor,
    settings: MediaSettings,
    socket: Arc<UdpSocket>,
    sender: Arc<PacketSender>,
    shared: Arc<MediaShared>,
    gate: watch::Sender<bool>,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    turn_started: std::sync::Mutex<Option<Instant>>,
}

impl MediaSession {
    /// Bind a socket for `descriptor` and send the probe.
    ///
    /// `cancel` should be a child of the controller's token so a session
    /// re-grant can stop one generation of tasks without touching the rest.
    pub async fn bind(
        descriptor: SessionDescriptor,
        settings: MediaSettings,
        cancel: CancellationToken,
    ) -> Result<Self, MediaError> {
        let server = resolve(&descriptor.server_addr()).await?;
        let local: SocketAddr = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = Arc::new(UdpSocket::bind(local).await?);
        info!(
            target: "Media/Session",
            "UDP socket bound to {} for session {} → {server} ({})",
            socket.local_addr()?,
            descriptor.session_id,
            descriptor.key.cipher_name()
        );

        let sender = Arc::new(PacketSender::new(
            socket.clone(),
            server,
            descriptor.transport(),
        ));
        sender.send_probe(&descriptor).await?;

        let (gate, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(MediaShared::new(settings.jitter.clone())),
            descriptor,
            settings,
            socket,
            sender,
            gate,
            cancel,
            tasks: Vec::new(),
            turn_started: std::sync::Mutex::new(None),
        })
    }

    /// Spawn the receive, playback and capture tasks.
    pub async fn start(
        &mut self,
        source: Box<dyn AudioSource>,
        sink: Box<dyn AudioSink>,
    ) -> Result<(), MediaError> {
        let audio = &self.descriptor.audio;
        let frame_samples = audio.frame_samples();
        let encoder = encoder_for(audio)?;
        let decoder = decoder_for(audio)?;
        self.shared.tracker.lock().await.reset();

        let receive = tokio::spawn(run_receive(
            ReceiveContext {
                socket: self.socket.clone(),
                key: self.descriptor.key.clone(),
                decoder,
                frame_samples,
                recv_timeout: self.settings.recv_timeout,
                buffer_size: self.settings.recv_buffer_size,
            },
            self.shared.clone(),
            self.cancel.clone(),
        ));
        let playback = tokio::spawn(run_playback(
            self.shared.playback.clone(),
            sink,
            PlaybackTiming {
                frame_duration: audio.frame_duration(),
                pull_timeout: self.settings.pull_timeout,
                stall_warning: self.settings.stall_warning,
            },
            self.shared.turn_active.clone(),
            self.cancel.clone(),
        ));
        let capture = tokio::spawn(run_capture(
            CaptureContext {
                sender: self.sender.clone(),
                source,
                encoder,
                frame_samples,
                frame_duration: audio.frame_duration(),
            },
            self.gate.subscribe(),
            self.cancel.clone(),
        ));
        self.tasks = vec![
            ("receive", receive),
            ("playback", playback),
            ("capture", capture),
        ];
        info!(
            target: "Media/Session",
            "Media tasks started ({} Hz, {} ch, {} ms, {})",
            audio.sample_rate, audio.channels, audio.frame_duration, audio.format
        );
        Ok(())
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn session_id(&self) -> &str {
        &self.descriptor.session_id
    }

    pub fn shared(&self) -> &Arc<MediaShared> {
        &self.shared
    }

    pub fn sender(&self) -> &Arc<PacketSender> {
        &self.sender
    }

    pub fn set_capture(&self, recording: bool) {
        self.gate.send_replace(recording);
    }

    pub fn is_capturing(&self) -> bool {
        *self.gate.borrow()
    }

    pub fn turn_active(&self) -> bool {
        self.shared.turn_active.load(Ordering::SeqCst)
    }

    /// Server started speaking: fresh stats, and a keepalive so NAT state
    /// is refreshed before the audio burst.
    pub async fn begin_turn(&self) {
        self.shared.tracker.lock().await.reset();
        self.shared.turn_active.store(true, Ordering::SeqCst);
        self.mark_turn_clock();
        if let Err(e) = self.sender.send_keepalive(&self.descriptor).await {
            warn!(target: "Media/Session", "Keepalive failed: {e}");
        }
    }

    /// Server finished speaking. Returns the turn's receive statistics.
    pub async fn end_turn(&self) -> SequenceSummary {
        self.shared.turn_active.store(false, Ordering::SeqCst);
        self.clear_turn_clock();
        self.shared.tracker.lock().await.summary()
    }

    /// Restart the no-audio clock, e.g. after asking the server to retry.
    pub fn mark_turn_clock(&self) {
        if let Ok(mut started) = self.turn_started.lock() {
            *started = Some(Instant::now());
        }
    }

    fn clear_turn_clock(&self) {
        if let Ok(mut started) = self.turn_started.lock() {
            *started = None;
        }
    }

    /// How long an active turn has gone without inbound audio.
    pub async fn silence(&self) -> Option<Duration> {
        if !self.turn_active() {
            return None;
        }
        let started = self.turn_started.lock().ok().and_then(|s| *s)?;
        let last = self.shared.tracker.lock().await.last_arrival();
        let since = last.map_or(started, |arrival| arrival.max(started));
        Some(since.elapsed())
    }

    /// Drop queued playback and stop capture.
    pub async fn interrupt(&self) {
        let dropped = self.shared.playback.clear().await;
        self.set_capture(false);
        debug!(target: "Media/Session", "Interrupted, {dropped} queued frames dropped");
    }

    /// Cancel the tasks, release the playback consumer and wait up to
    /// `join_timeout` for each one.
    pub async fn shutdown(mut self, join_timeout: Duration) -> SequenceSummary {
        self.cancel.cancel();
        self.set_capture(false);
        self.shared.playback.close();

        for (name, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout(join_timeout, &mut handle).await {
                Ok(Ok(())) => debug!(target: "Media/Session", "{name} task joined"),
                Ok(Err(e)) => warn!(target: "Media/Session", "{name} task failed: {e}"),
                // Dropping the handle detaches the task; it still exits on
                // the cancelled token.
                Err(_) => warn!(
                    target: "Media/Session",
                    "{name} task did not stop within {join_timeout:?}, leaving it to finish"
                ),
            }
        }

        self.shared.playback.clear().await;
        let summary = self.shared.tracker.lock().await.summary();
        info!(
            target: "Media/Session",
            "Media session {} closed after {} packets sent; received {summary}",
            self.descriptor.session_id,
            self.sender.packets_sent()
        );
        summary
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, MediaError> {
    tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        MediaError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("media server {addr} did not resolve"),
        ))
    })
}
