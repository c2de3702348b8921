//! Session lifecycle: bootstrap → signaling → media → streaming → teardown.
//!
//! [`SessionController::run`] owns every per-session resource and drives the
//! state machine from one task. Everything outside that task talks to it
//! through a [`ControllerHandle`].

use std::future::pending;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use voxcore::identity::DeviceIdentity;
use voxcore::net::{HttpClient, SignalingConnector, SignalingEvent};
use voxcore::signaling::{ClientMessage, HelloReply, ListenState, ServerMessage, TtsState};
use voxcore::state::{InvalidTransition, SessionState, SessionTransition};

use crate::audio::AudioBackend;
use crate::bootstrap::ConfigBootstrapper;
use crate::config::ClientConfig;
use crate::error::{MediaError, SessionError, SignalingError};
use crate::media::{MediaSession, MediaSettings};
use crate::signaling::{Signaling, parse_event, wait_for_hello};

/// Operator requests forwarded to the controller task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    TurnStart,
    Abort,
    ClearHistory,
    ListenStop,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Shutdown,
    ServerGoodbye,
    SignalingLost,
    MediaTimeout,
}

/// Cloneable remote control for a running [`SessionController`].
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<ControlCommand>,
    state: watch::Receiver<SessionState>,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl ControllerHandle {
    /// Ask the server to open a turn (`start_greeting`).
    pub async fn trigger_turn_start(&self) -> Result<(), SessionError> {
        self.command(ControlCommand::TurnStart).await
    }

    /// Interrupt playback and capture, and tell the server.
    pub async fn trigger_abort(&self) -> Result<(), SessionError> {
        self.command(ControlCommand::Abort).await
    }

    /// Publish `goodbye` so the server drops its history; the session stays up.
    pub async fn trigger_clear_history(&self) -> Result<(), SessionError> {
        self.command(ControlCommand::ClearHistory).await
    }

    /// Stop capture and publish `listen stop`.
    pub async fn trigger_listen_stop(&self) -> Result<(), SessionError> {
        self.command(ControlCommand::ListenStop).await
    }

    /// Tear the session down. Safe to call more than once.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Whether the server announced it is ready for a greeting.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate`, or the controller exits.
    pub async fn wait_for(&self, predicate: impl Fn(&SessionState) -> bool) -> SessionState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| predicate(s)).await.map(|s| s.clone());
        match reached {
            Ok(state) => state,
            Err(_) => rx.borrow().clone(),
        }
    }

    async fn command(&self, command: ControlCommand) -> Result<(), SessionError> {
        if !self.state.borrow().is_streaming() {
            return Err(SessionError::NotStreaming);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Stopped)
    }
}

pub struct SessionController {
    config: ClientConfig,
    http: Arc<dyn HttpClient>,
    connector: Arc<dyn SignalingConnector>,
    audio: Arc<dyn AudioBackend>,
    state: watch::Sender<SessionState>,
    commands: mpsc::Receiver<ControlCommand>,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SessionController {
    pub fn new(
        config: ClientConfig,
        http: Arc<dyn HttpClient>,
        connector: Arc<dyn SignalingConnector>,
        audio: Arc<dyn AudioBackend>,
    ) -> (Self, ControllerHandle) {
        let (state, state_rx) = watch::channel(SessionState::Init);
        let (commands_tx, commands) = mpsc::channel(16);
        let ready = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let handle = ControllerHandle {
            commands: commands_tx,
            state: state_rx,
            ready: ready.clone(),
            cancel: cancel.clone(),
        };
        (
            Self {
                config,
                http,
                connector,
                audio,
                state,
                commands,
                ready,
                cancel,
            },
            handle,
        )
    }

    /// Run one session to completion.
    ///
    /// Startup failures are returned after the state machine has been driven
    /// to `Closed`; a session that reached `Streaming` always ends with `Ok`.
    pub async fn run(self) -> Result<CloseReason, SessionError> {
        let Self {
            config,
            http,
            connector,
            audio,
            state,
            commands,
            ready,
            cancel,
        } = self;

        let identity = config.device_id.unwrap_or_else(DeviceIdentity::generate);
        info!(target: "Session/Controller", "Device identity {identity}");

        let bootstrapper = ConfigBootstrapper::new(http, &config);
        let boot = tokio::select! {
            r = bootstrapper.run(&identity) => r,
            _ = cancel.cancelled() => return close_idle(&state),
        };
        let boot = match boot {
            Ok(boot) => boot,
            Err(e) => return Err(fail(&state, e.into())),
        };
        transition(&state, SessionTransition::Bootstrapped).map_err(|e| fail(&state, e.into()))?;

        let credentials = boot.credentials;
        let connected = tokio::select! {
            r = connector.connect(&credentials) => r,
            _ = cancel.cancelled() => return close_idle(&state),
        };
        let (channel, mut events) = match connected {
            Ok(c) => c,
            Err(e) => return Err(fail(&state, SignalingError::Connect(e).into())),
        };
        let signaling = Signaling::new(
            channel,
            credentials.publish_topic.clone(),
            config.publish_timeout,
        );

        let reply = tokio::select! {
            r = handshake(&signaling, &mut events, &config) => r,
            _ = cancel.cancelled() => {
                signaling.disconnect().await;
                return close_idle(&state);
            }
        };
        let descriptor = reply.and_then(|r| {
            r.descriptor_or(&config.audio)
                .map_err(|e| SignalingError::from(e).into())
        });
        let descriptor = match descriptor {
            Ok(d) => d,
            Err(e) => {
                signaling.disconnect().await;
                return Err(fail(&state, e.into()));
            }
        };
        info!(
            target: "Session/Controller",
            "Media grant for session {} at {} (connection {})",
            descriptor.session_id,
            descriptor.server_addr(),
            descriptor.connection_id
        );
        transition(
            &state,
            SessionTransition::Granted {
                session_id: descriptor.session_id.clone(),
            },
        )
        .map_err(|e| fail(&state, e.into()))?;

        let settings = MediaSettings::from(&config);
        let media = match open_media(descriptor, &settings, audio.as_ref(), &cancel, &state).await {
            Ok(media) => media,
            Err(e) => {
                signaling.send_logged(&ClientMessage::goodbye(None)).await;
                signaling.disconnect().await;
                return Err(fail(&state, e));
            }
        };

        let mut session = Streaming {
            config,
            audio,
            settings,
            signaling,
            media,
            state,
            ready,
            cancel,
            generation: 1,
            retries: 0,
            retry_at: None,
        };
        let reason = session.run(events, commands).await;
        session.teardown(reason).await;
        Ok(reason)
    }
}

async fn handshake(
    signaling: &Signaling,
    events: &mut mpsc::Receiver<SignalingEvent>,
    config: &ClientConfig,
) -> Result<HelloReply, SessionError> {
    signaling
        .send(&ClientMessage::hello(config.audio.clone()))
        .await?;
    info!(
        target: "Session/Controller",
        "hello sent, waiting up to {:?} for the media grant", config.hello_timeout
    );
    Ok(wait_for_hello(events, config.hello_timeout).await?)
}

/// Bind, probe and start one generation of media tasks.
async fn open_media(
    descriptor: voxcore::session::SessionDescriptor,
    settings: &MediaSettings,
    audio: &dyn AudioBackend,
    cancel: &CancellationToken,
    state: &watch::Sender<SessionState>,
) -> Result<MediaSession, SessionError> {
    let mut media = MediaSession::bind(descriptor, settings.clone(), cancel.child_token()).await?;
    if !state.borrow().is_streaming() {
        transition(state, SessionTransition::MediaBound)?;
    }
    let source = audio.open_source().await.map_err(audio_error)?;
    let sink = audio.open_sink().await.map_err(audio_error)?;
    media.start(source, sink).await?;
    Ok(media)
}

fn audio_error(e: anyhow::Error) -> SessionError {
    MediaError::Io(std::io::Error::other(e.to_string())).into()
}

fn transition(
    state: &watch::Sender<SessionState>,
    transition: SessionTransition,
) -> Result<(), InvalidTransition> {
    let mut result = Ok(());
    let mut from = "";
    state.send_if_modified(|current| {
        from = current.name();
        result = current.apply(transition);
        result.is_ok()
    });
    if result.is_ok() {
        info!(target: "Session/Controller", "State {from} → {}", state.borrow().name());
    }
    result
}

/// Drive a session that never streamed to `Closed`.
fn close_idle(state: &watch::Sender<SessionState>) -> Result<CloseReason, SessionError> {
    info!(target: "Session/Controller", "Shutdown requested before streaming");
    transition(state, SessionTransition::Close)?;
    transition(state, SessionTransition::Closed)?;
    Ok(CloseReason::Shutdown)
}

fn fail(state: &watch::Sender<SessionState>, err: SessionError) -> SessionError {
    error!(target: "Session/Controller", "Session failed: {err}");
    if transition(state, SessionTransition::Close).is_ok() {
        if let Err(e) = transition(state, SessionTransition::Closed) {
            warn!(target: "Session/Controller", "{e}");
        }
    }
    err
}

enum Flow {
    Continue,
    Stop(CloseReason),
}

/// Resources of a session that reached `Streaming`.
struct Streaming {
    config: ClientConfig,
    audio: Arc<dyn AudioBackend>,
    settings: MediaSettings,
    signaling: Signaling,
    media: MediaSession,
    state: watch::Sender<SessionState>,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
    generation: u64,
    retries: u32,
    retry_at: Option<Instant>,
}

impl Streaming {
    async fn run(
        &mut self,
        mut events: mpsc::Receiver<SignalingEvent>,
        mut commands: mpsc::Receiver<ControlCommand>,
    ) -> CloseReason {
        if let Err(e) = transition(&self.state, SessionTransition::StreamsStarted) {
            error!(target: "Session/Controller", "{e}");
            return CloseReason::Shutdown;
        }
        let mut liveness = tokio::time::interval(Duration::from_secs(1));
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            let retry = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => pending().await,
                }
            };

            let flow = tokio::select! {
                _ = self.cancel.cancelled() => Flow::Stop(CloseReason::Shutdown),
                command = commands.recv() => match command {
                    Some(command) => {
                        self.on_command(command).await;
                        Flow::Continue
                    }
                    None => Flow::Stop(CloseReason::Shutdown),
                },
                event = events.recv() => match event {
                    None | Some(SignalingEvent::Disconnected) => {
                        warn!(target: "Session/Controller", "Signaling connection lost");
                        Flow::Stop(CloseReason::SignalingLost)
                    }
                    Some(event) => match parse_event(&event) {
                        Some(message) => self.on_message(message).await,
                        None => Flow::Continue,
                    },
                },
                _ = retry => {
                    self.retry_at = None;
                    self.request_retry().await
                }
                _ = liveness.tick() => self.check_liveness().await,
            };

            if let Flow::Stop(reason) = flow {
                return reason;
            }
        }
    }

    fn session_id(&self) -> Option<&str> {
        Some(self.media.session_id())
    }

    async fn on_command(&mut self, command: ControlCommand) {
        info!(target: "Session/Controller", "Operator: {command:?}");
        let message = match command {
            ControlCommand::TurnStart => ClientMessage::start_greeting(self.session_id()),
            ControlCommand::Abort => {
                self.media.interrupt().await;
                ClientMessage::abort(self.session_id())
            }
            ControlCommand::ClearHistory => ClientMessage::goodbye(self.session_id()),
            ControlCommand::ListenStop => {
                self.media.set_capture(false);
                ClientMessage::listen(ListenState::Stop, self.session_id(), None)
            }
        };
        self.signaling.send_logged(&message).await;
    }

    async fn on_message(&mut self, message: ServerMessage) -> Flow {
        match message {
            ServerMessage::Hello(reply) if reply.udp.is_some() => self.regrant(reply).await,
            ServerMessage::Hello(_) => {
                debug!(target: "Session/Controller", "hello without grant ignored");
            }
            ServerMessage::Tts { state, text } => self.on_tts(state, text).await,
            ServerMessage::Stt { text } => {
                info!(target: "Session/Controller", "Recognized: {}", text.unwrap_or_default());
            }
            ServerMessage::Llm { text, emotion } => {
                info!(
                    target: "Session/Controller",
                    "Reply [{}]: {}",
                    emotion.unwrap_or_default(),
                    text.unwrap_or_default()
                );
            }
            ServerMessage::RecordStop => {
                info!(target: "Session/Controller", "Server stopped recording");
                self.media.set_capture(false);
            }
            ServerMessage::Abort => {
                info!(target: "Session/Controller", "Server aborted the turn");
                self.media.interrupt().await;
            }
            ServerMessage::Goodbye { session_id } => {
                if session_id.as_deref().is_none_or(|id| id == self.media.session_id()) {
                    info!(target: "Session/Controller", "Server said goodbye");
                    return Flow::Stop(CloseReason::ServerGoodbye);
                }
                debug!(target: "Session/Controller", "goodbye for another session ignored");
            }
            ServerMessage::ReadyForGreeting | ServerMessage::AgentReady => {
                info!(target: "Session/Controller", "Server ready");
                self.ready.store(true, Ordering::SeqCst);
            }
            ServerMessage::Error { message } => {
                warn!(
                    target: "Session/Controller",
                    "Server error: {}",
                    message.unwrap_or_default()
                );
            }
            ServerMessage::Unknown => {
                debug!(target: "Session/Controller", "Unhandled message type");
            }
        }
        Flow::Continue
    }

    async fn on_tts(&mut self, state: TtsState, text: Option<String>) {
        match state {
            TtsState::Start => {
                info!(target: "Session/Controller", "Turn started");
                self.retry_at = None;
                self.media.begin_turn().await;
            }
            TtsState::Stop => {
                let summary = self.media.end_turn().await;
                info!(target: "Session/Controller", "Turn finished: {summary}");
                if summary.total > 0 {
                    self.retries = 0;
                    self.media.set_capture(true);
                } else {
                    warn!(
                        target: "Session/Controller",
                        "No audio received this turn, retrying in {:?}", self.config.retry_delay
                    );
                    self.retry_at = Some(Instant::now() + self.config.retry_delay);
                }
            }
            TtsState::SentenceStart => {
                info!(target: "Session/Controller", "Speaking: {}", text.unwrap_or_default());
            }
            TtsState::Other => debug!(target: "Session/Controller", "Unhandled tts state"),
        }
    }

    /// Ask the server to resend the turn, or give up once
    /// `max_media_retries` requests went unanswered.
    async fn request_retry(&mut self) -> Flow {
        if self.retries >= self.config.max_media_retries {
            error!(
                target: "Session/Controller",
                "No audio after {} retries, giving up", self.retries
            );
            return Flow::Stop(CloseReason::MediaTimeout);
        }
        self.retries += 1;
        let text = format!("retry attempt {}", self.retries);
        info!(target: "Session/Controller", "Requesting audio again ({text})");
        self.signaling
            .send_logged(&ClientMessage::listen(
                ListenState::Detect,
                self.session_id(),
                Some(text),
            ))
            .await;
        Flow::Continue
    }

    async fn check_liveness(&mut self) -> Flow {
        let Some(silent) = self.media.silence().await else {
            return Flow::Continue;
        };
        if silent < self.config.media_timeout {
            return Flow::Continue;
        }
        warn!(
            target: "Session/Controller",
            "{} (silent for {silent:?})",
            MediaError::Timeout(self.config.media_timeout)
        );
        let flow = self.request_retry().await;
        self.media.mark_turn_clock();
        flow
    }

    /// Replace the media plane after the server re-issued the grant.
    async fn regrant(&mut self, reply: HelloReply) {
        let descriptor = match reply.descriptor_or(&self.config.audio) {
            Ok(d) => d,
            Err(e) => {
                warn!(target: "Session/Controller", "Ignoring malformed re-grant: {e}");
                return;
            }
        };
        info!(
            target: "Session/Controller",
            "Session re-granted as {} (generation {})",
            descriptor.session_id,
            self.generation + 1
        );
        let session_id = descriptor.session_id.clone();
        let media = match open_media(
            descriptor,
            &self.settings,
            self.audio.as_ref(),
            &self.cancel,
            &self.state,
        )
        .await
        {
            Ok(media) => media,
            Err(e) => {
                warn!(target: "Session/Controller", "Re-grant failed, keeping current media: {e}");
                return;
            }
        };
        let previous = std::mem::replace(&mut self.media, media);
        previous.shutdown(self.config.join_timeout).await;
        self.generation += 1;
        self.retry_at = None;
        self.retries = 0;
        if let Err(e) = transition(&self.state, SessionTransition::Regranted { session_id }) {
            warn!(target: "Session/Controller", "{e}");
        }
    }

    async fn teardown(self, reason: CloseReason) {
        info!(target: "Session/Controller", "Tearing down session ({reason:?})");
        if let Err(e) = transition(&self.state, SessionTransition::Close) {
            warn!(target: "Session/Controller", "{e}");
        }
        self.cancel.cancel();
        let session_id = self.media.session_id().to_string();
        self.media.shutdown(self.config.join_timeout).await;

        if reason != CloseReason::SignalingLost {
            self.signaling
                .send_logged(&ClientMessage::goodbye(Some(&session_id)))
                .await;
        }
        self.signaling.disconnect().await;
        if let Err(e) = transition(&self.state, SessionTransition::Closed) {
            warn!(target: "Session/Controller", "{e}");
        }
    }
}
