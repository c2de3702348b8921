use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default topic the device publishes control messages to.
pub const DEFAULT_PUBLISH_TOPIC: &str = "device-server";

/// Reply topic for a signaling client id.
pub fn reply_topic(client_id: &str) -> String {
    format!("devices/p2p/{client_id}")
}

/// Everything needed to open the signaling connection.
#[derive(Clone)]
pub struct SignalingCredentials {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    /// Topic subscribed to for server replies.
    pub subscribe_topic: String,
    /// Topic device messages are published to.
    pub publish_topic: String,
    pub keep_alive: Duration,
}

impl SignalingCredentials {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        client_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let client_id = client_id.into();
        Self {
            host: host.into(),
            port,
            subscribe_topic: reply_topic(&client_id),
            publish_topic: DEFAULT_PUBLISH_TOPIC.to_string(),
            client_id,
            username: username.into(),
            password: password.into(),
            keep_alive: Duration::from_secs(60),
        }
    }
}

impl std::fmt::Debug for SignalingCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("subscribe_topic", &self.subscribe_topic)
            .field("publish_topic", &self.publish_topic)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// An event produced by the signaling layer.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// The broker accepted the connection and the reply topic is subscribed.
    Connected,
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Bytes },
    /// The connection was lost.
    Disconnected,
}

/// An open publish/subscribe connection.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Publish a payload to `topic`.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Close the connection.
    async fn disconnect(&self);
}

/// Opens signaling connections.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Connects and returns the channel along with its event stream.
    async fn connect(
        &self,
        credentials: &SignalingCredentials,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<SignalingEvent>)>;
}

/// A simple structure to represent an HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: String, // "GET" or "POST"
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `value` as the JSON body and set the content type.
    pub fn with_json<T: serde::Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .with_header("Content-Type", "application/json")
            .with_body(body))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn body_string(&self) -> Result<String> {
        Ok(String::from_utf8(self.body.clone())?)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Trait for executing HTTP requests in a runtime-agnostic way
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Executes a given HTTP request and returns the response.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}
