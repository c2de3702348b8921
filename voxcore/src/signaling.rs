//! Control messages exchanged over the signaling channel.
//!
//! All messages are JSON objects discriminated by a `type` field.

use serde::{Deserialize, Serialize};

use crate::session::{AudioParams, GrantError, SessionDescriptor, UdpGrant};

/// Protocol version announced in `hello`.
pub const PROTOCOL_VERSION: u32 = 3;

/// Default capability list announced in `hello`.
pub const DEFAULT_FEATURES: &[&str] = &["tts", "asr", "vad"];

/// State carried by a `listen` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Detect,
    Stop,
}

/// Messages sent by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        version: u32,
        transport: String,
        audio_params: AudioParams,
        features: Vec<String>,
    },
    Listen {
        state: ListenState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    StartGreeting {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Goodbye {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl ClientMessage {
    /// Capability handshake for the MQTT transport.
    pub fn hello(audio_params: AudioParams) -> Self {
        Self::Hello {
            version: PROTOCOL_VERSION,
            transport: "mqtt".to_string(),
            audio_params,
            features: DEFAULT_FEATURES.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn listen(state: ListenState, session_id: Option<&str>, text: Option<String>) -> Self {
        Self::Listen {
            state,
            text,
            session_id: session_id.map(str::to_string),
        }
    }

    pub fn start_greeting(session_id: Option<&str>) -> Self {
        Self::StartGreeting {
            session_id: session_id.map(str::to_string),
        }
    }

    pub fn abort(session_id: Option<&str>) -> Self {
        Self::Abort {
            session_id: session_id.map(str::to_string),
        }
    }

    pub fn goodbye(session_id: Option<&str>) -> Self {
        Self::Goodbye {
            session_id: session_id.map(str::to_string),
        }
    }

    /// Wire name of the message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Listen { .. } => "listen",
            Self::StartGreeting { .. } => "start_greeting",
            Self::Abort { .. } => "abort",
            Self::Goodbye { .. } => "goodbye",
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// `state` of a `tts` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
    SentenceStart,
    #[serde(other)]
    Other,
}

/// Body of a `hello` reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelloReply {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub audio_params: Option<AudioParams>,
    #[serde(default)]
    pub udp: Option<UdpGrant>,
}

impl HelloReply {
    /// Build the session descriptor from this reply's grant.
    pub fn descriptor(&self) -> Result<SessionDescriptor, GrantError> {
        self.descriptor_or(&AudioParams::default())
    }

    /// Like [`descriptor`](Self::descriptor), but audio parameters missing
    /// from the reply default to what the client announced.
    pub fn descriptor_or(&self, announced: &AudioParams) -> Result<SessionDescriptor, GrantError> {
        let grant = self.udp.as_ref().ok_or(GrantError::MissingGrant)?;
        let session_id = self
            .session_id
            .as_deref()
            .ok_or(GrantError::MissingSessionId)?;
        let audio = self
            .audio_params
            .clone()
            .unwrap_or_else(|| announced.clone());
        SessionDescriptor::from_grant(session_id, Some(audio), grant)
    }
}

/// Messages received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello(HelloReply),
    Tts {
        state: TtsState,
        #[serde(default)]
        text: Option<String>,
    },
    Stt {
        #[serde(default)]
        text: Option<String>,
    },
    Llm {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        emotion: Option<String>,
    },
    RecordStop,
    #[serde(alias = "abort_playback")]
    Abort,
    Goodbye {
        #[serde(default)]
        session_id: Option<String>,
    },
    ReadyForGreeting,
    AgentReady,
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Tts { .. } => "tts",
            Self::Stt { .. } => "stt",
            Self::Llm { .. } => "llm",
            Self::RecordStop => "record_stop",
            Self::Abort => "abort",
            Self::Goodbye { .. } => "goodbye",
            Self::ReadyForGreeting => "ready_for_greeting",
            Self::AgentReady => "agent_ready",
            Self::Error { .. } => "error",
            Self::Unknown => "unknown",
        }
    }
}
