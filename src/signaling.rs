//! Control-message layer over a [`SignalingChannel`].

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use voxcore::net::{SignalingChannel, SignalingEvent};
use voxcore::signaling::{ClientMessage, HelloReply, ServerMessage};

use crate::error::SignalingError;

/// Typed publishing on one connection.
#[derive(Clone)]
pub struct Signaling {
    channel: Arc<dyn SignalingChannel>,
    publish_topic: String,
    publish_timeout: Duration,
}

impl Signaling {
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        publish_topic: impl Into<String>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            publish_topic: publish_topic.into(),
            publish_timeout,
        }
    }

    pub fn publish_topic(&self) -> &str {
        &self.publish_topic
    }

    /// Publish `message`, bounded by the publish timeout.
    pub async fn send(&self, message: &ClientMessage) -> Result<(), SignalingError> {
        let payload = message.to_json()?;
        debug!(
            target: "Signaling",
            "→ {} ({} bytes) on {}",
            message.type_name(),
            payload.len(),
            self.publish_topic
        );
        tokio::time::timeout(
            self.publish_timeout,
            self.channel.publish(&self.publish_topic, &payload),
        )
        .await
        .map_err(|_| SignalingError::PublishTimeout(self.publish_timeout))?
        .map_err(SignalingError::Publish)
    }

    /// Publish `message`, logging instead of failing.
    pub async fn send_logged(&self, message: &ClientMessage) {
        if let Err(e) = self.send(message).await {
            warn!(target: "Signaling", "Dropping {} message: {e}", message.type_name());
        }
    }

    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
    }
}

/// Parse one signaling event into a server message.
///
/// Returns `None` for connection events and for payloads that are not
/// valid control JSON.
pub fn parse_event(event: &SignalingEvent) -> Option<ServerMessage> {
    match event {
        SignalingEvent::Message { topic, payload } => match ServerMessage::parse(payload) {
            Ok(message) => {
                debug!(target: "Signaling", "← {} on {topic}", message.type_name());
                Some(message)
            }
            Err(e) => {
                warn!(target: "Signaling", "Ignoring malformed message on {topic}: {e}");
                None
            }
        },
        SignalingEvent::Connected => {
            debug!(target: "Signaling", "Connected");
            None
        }
        SignalingEvent::Disconnected => None,
    }
}

/// Wait for a `hello` reply carrying a media grant.
///
/// Other messages received before it are logged and discarded.
pub async fn wait_for_hello(
    events: &mut mpsc::Receiver<SignalingEvent>,
    timeout: Duration,
) -> Result<HelloReply, SignalingError> {
    let wait = async {
        while let Some(event) = events.recv().await {
            if matches!(event, SignalingEvent::Disconnected) {
                return Err(SignalingError::Closed);
            }
            match parse_event(&event) {
                Some(ServerMessage::Hello(reply)) if reply.udp.is_some() => return Ok(reply),
                Some(ServerMessage::Hello(_)) => {
                    warn!(target: "Signaling", "hello reply without a udp grant, still waiting");
                }
                Some(other) => {
                    info!(target: "Signaling", "Ignoring {} before handshake", other.type_name());
                }
                None => {}
            }
        }
        Err(SignalingError::Closed)
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| SignalingError::HandshakeTimeout(timeout))?
}
