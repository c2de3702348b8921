//! Bootstrap (OTA) request and response types.
//!
//! The HTTP exchange itself lives in the client crate; this module only
//! describes the payloads and turns a response into signaling credentials.

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::identity::DeviceIdentity;
use crate::net::{DEFAULT_PUBLISH_TOPIC, SignalingCredentials, reply_topic};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_APP_NAME: &str = "DOIT AI Kit v1.7.6";
pub const DEFAULT_APP_VERSION: &str = "1.7.6";
pub const DEFAULT_BOARD_TYPE: &str = "doit-ai-01-kit";
pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardInfo {
    #[serde(rename = "type")]
    pub board_type: String,
}

/// Body of the bootstrap POST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaRequest {
    pub application: ApplicationInfo,
    pub board: BoardInfo,
    pub client_id: String,
}

impl OtaRequest {
    pub fn new(app_name: &str, app_version: &str, board_type: &str) -> Self {
        Self {
            application: ApplicationInfo {
                name: app_name.to_string(),
                version: app_version.to_string(),
            },
            board: BoardInfo {
                board_type: board_type.to_string(),
            },
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Default for OtaRequest {
    fn default() -> Self {
        Self::new(DEFAULT_APP_NAME, DEFAULT_APP_VERSION, DEFAULT_BOARD_TYPE)
    }
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttInfo {
    /// `host:port` of the broker.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub client_id: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub publish_topic: Option<String>,
    #[serde(default)]
    pub subscribe_topic: Option<String>,
}

impl std::fmt::Debug for MqttInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttInfo")
            .field("endpoint", &self.endpoint)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("publish_topic", &self.publish_topic)
            .field("subscribe_topic", &self.subscribe_topic)
            .finish()
    }
}

/// Broker override block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttGatewayInfo {
    pub broker: String,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsocketInfo {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTime {
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Minutes east of UTC.
    #[serde(default)]
    pub timezone_offset: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub version: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Activation {
    /// Activation only gates startup when the server handed out a code.
    pub fn is_required(&self) -> bool {
        self.code.as_deref().is_some_and(|c| !c.is_empty())
    }
}

/// Reply to an activation poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationStatus {
    #[serde(default)]
    pub activated: bool,
}

/// Bootstrap response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaResponse {
    #[serde(default)]
    pub mqtt: Option<MqttInfo>,
    #[serde(default)]
    pub mqtt_gateway: Option<MqttGatewayInfo>,
    #[serde(default)]
    pub websocket: Option<WebsocketInfo>,
    #[serde(default)]
    pub server_time: Option<ServerTime>,
    #[serde(default)]
    pub firmware: Option<FirmwareInfo>,
    #[serde(default)]
    pub activation: Option<Activation>,
}

/// Errors interpreting bootstrap data.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid broker endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to derive credentials: {0}")]
    Derivation(String),
}

/// Split `host:port`; a missing port selects `default_port`.
pub fn parse_endpoint(endpoint: &str, default_port: u16) -> Result<(String, u16), CredentialError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(CredentialError::InvalidEndpoint(endpoint.to_string()));
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| CredentialError::InvalidEndpoint(endpoint.to_string()))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(CredentialError::InvalidEndpoint(endpoint.to_string())),
        None => Ok((endpoint.to_string(), default_port)),
    }
}

/// Credentials derived on the device when the bootstrap carries none.
#[derive(Clone, PartialEq, Eq)]
pub struct LocalCredentials {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LocalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Derive broker credentials the way the gateway verifies them.
///
/// `password = base64(HMAC-SHA256(signature_key, client_id + "|" + username))`.
pub fn derive_local_credentials(
    identity: &DeviceIdentity,
    local_ip: &str,
    signature_key: &str,
) -> Result<LocalCredentials, CredentialError> {
    let client_id = format!(
        "GID_test@@@{}@@@{}",
        identity.underscore_form(),
        uuid::Uuid::new_v4()
    );
    let username_json = serde_json::to_vec(&serde_json::json!({ "ip": local_ip }))
        .map_err(|e| CredentialError::Derivation(e.to_string()))?;
    let username = BASE64_STANDARD.encode(username_json);
    let password = sign_credentials(&client_id, &username, signature_key)?;

    Ok(LocalCredentials {
        client_id,
        username,
        password,
    })
}

/// `base64(HMAC-SHA256(key, client_id|username))`.
pub fn sign_credentials(
    client_id: &str,
    username: &str,
    signature_key: &str,
) -> Result<String, CredentialError> {
    let mut mac = HmacSha256::new_from_slice(signature_key.as_bytes())
        .map_err(|e| CredentialError::Derivation(e.to_string()))?;
    mac.update(client_id.as_bytes());
    mac.update(b"|");
    mac.update(username.as_bytes());
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

impl OtaResponse {
    /// Broker address: `mqtt_gateway` wins over `mqtt.endpoint`, which wins
    /// over `fallback`.
    pub fn broker_address(
        &self,
        fallback: (&str, u16),
    ) -> Result<(String, u16), CredentialError> {
        if let Some(gateway) = &self.mqtt_gateway {
            return Ok((
                gateway.broker.clone(),
                gateway.port.unwrap_or(DEFAULT_MQTT_PORT),
            ));
        }
        if let Some(endpoint) = self.mqtt.as_ref().and_then(|m| m.endpoint.as_deref()) {
            return parse_endpoint(endpoint, DEFAULT_MQTT_PORT);
        }
        Ok((fallback.0.to_string(), fallback.1))
    }

    /// Build signaling credentials, deriving them locally when the response
    /// carries no `mqtt` block.
    pub fn signaling_credentials(
        &self,
        identity: &DeviceIdentity,
        fallback_broker: (&str, u16),
        local_ip: &str,
        signature_key: &str,
    ) -> Result<SignalingCredentials, CredentialError> {
        let (host, port) = self.broker_address(fallback_broker)?;

        let Some(mqtt) = &self.mqtt else {
            let local = derive_local_credentials(identity, local_ip, signature_key)?;
            return Ok(SignalingCredentials::new(
                host,
                port,
                local.client_id,
                local.username,
                local.password,
            ));
        };

        let mut creds = SignalingCredentials::new(
            host,
            port,
            mqtt.client_id.clone(),
            mqtt.username.clone(),
            mqtt.password.clone(),
        );
        if let Some(topic) = mqtt.subscribe_topic.as_deref().filter(|t| !t.is_empty()) {
            creds.subscribe_topic = topic.to_string();
        } else {
            creds.subscribe_topic = reply_topic(&mqtt.client_id);
        }
        creds.publish_topic = mqtt
            .publish_topic
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_PUBLISH_TOPIC.to_string());
        Ok(creds)
    }
}
