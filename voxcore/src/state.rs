//! Session lifecycle state machine.

use chrono::{DateTime, Utc};

/// Current state of a device session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Nothing negotiated yet.
    #[default]
    Init,
    /// Bootstrap finished; signaling credentials known.
    Configured,
    /// Media grant received over signaling.
    Signaled { session_id: String },
    /// UDP socket bound and probe sent.
    MediaReady { session_id: String },
    /// Media tasks running.
    Streaming {
        session_id: String,
        started_at: DateTime<Utc>,
    },
    /// Teardown in progress.
    Closing,
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Configured => "Configured",
            Self::Signaled { .. } => "Signaled",
            Self::MediaReady { .. } => "MediaReady",
            Self::Streaming { .. } => "Streaming",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Signaled { session_id }
            | Self::MediaReady { session_id }
            | Self::Streaming { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// State transitions for sessions.
#[derive(Debug, Clone)]
pub enum SessionTransition {
    Bootstrapped,
    Granted { session_id: String },
    MediaBound,
    StreamsStarted,
    /// The server re-issued the media grant mid-session.
    Regranted { session_id: String },
    /// Teardown requested; valid from any non-terminal state.
    Close,
    Closed,
}

/// Rejected state change.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid transition {attempted} in state {current_state}")]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl SessionState {
    /// Apply `transition`, leaving the state untouched on error.
    pub fn apply(&mut self, transition: SessionTransition) -> Result<(), InvalidTransition> {
        let next = match (&*self, transition) {
            (Self::Init, SessionTransition::Bootstrapped) => Self::Configured,
            (Self::Configured, SessionTransition::Granted { session_id }) => {
                Self::Signaled { session_id }
            }
            (Self::Signaled { session_id }, SessionTransition::MediaBound) => Self::MediaReady {
                session_id: session_id.clone(),
            },
            (Self::MediaReady { session_id }, SessionTransition::StreamsStarted) => {
                Self::Streaming {
                    session_id: session_id.clone(),
                    started_at: Utc::now(),
                }
            }
            (Self::Streaming { .. }, SessionTransition::Regranted { session_id }) => {
                Self::Streaming {
                    session_id,
                    started_at: Utc::now(),
                }
            }
            (current, SessionTransition::Close) if !current.is_terminal() => Self::Closing,
            (Self::Closing, SessionTransition::Closed) => Self::Closed,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name().to_string(),
                    attempted: format!("{transition:?}"),
                });
            }
        };
        *self = next;
        Ok(())
    }
}
