//! Bootstrap exchange: device identity in, signaling credentials out.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use voxcore::bootstrap::{ActivationStatus, OtaRequest, OtaResponse};
use voxcore::identity::DeviceIdentity;
use voxcore::net::{HttpClient, HttpRequest, SignalingCredentials};

use crate::config::ClientConfig;
use crate::error::BootstrapError;

/// Outcome of a successful bootstrap.
#[derive(Debug, Clone)]
pub struct BootstrapResult {
    pub response: OtaResponse,
    pub credentials: SignalingCredentials,
}

pub struct ConfigBootstrapper {
    http: Arc<dyn HttpClient>,
    ota_url: String,
    activation_url: String,
    app_name: String,
    app_version: String,
    board_type: String,
    fallback_broker: (String, u16),
    signature_key: String,
    local_ip: String,
    request_timeout: Duration,
    activation_interval: Duration,
    activation_attempts: u32,
}

impl ConfigBootstrapper {
    pub fn new(http: Arc<dyn HttpClient>, config: &ClientConfig) -> Self {
        Self {
            http,
            ota_url: config.ota_url.clone(),
            activation_url: config.activation_url.clone(),
            app_name: config.app_name.clone(),
            app_version: config.app_version.clone(),
            board_type: config.board_type.clone(),
            fallback_broker: config.fallback_broker.clone(),
            signature_key: config.signature_key.clone(),
            local_ip: config.local_ip.clone(),
            request_timeout: config.bootstrap_timeout,
            activation_interval: config.activation_interval,
            activation_attempts: config.activation_attempts,
        }
    }

    /// Fetch the bootstrap document, wait for activation if required, and
    /// resolve signaling credentials.
    pub async fn run(&self, identity: &DeviceIdentity) -> Result<BootstrapResult, BootstrapError> {
        let response = self.fetch(identity).await?;

        if let Some(ws) = &response.websocket {
            info!(target: "Bootstrap", "Websocket endpoint: {}", ws.url);
        }
        if let Some(firmware) = &response.firmware {
            debug!(target: "Bootstrap", "Firmware version {}", firmware.version);
        }
        if let Some(time) = &response.server_time {
            debug!(target: "Bootstrap", "Server time {} ms", time.timestamp);
        }

        if let Some(code) = response
            .activation
            .as_ref()
            .filter(|a| a.is_required())
            .and_then(|a| a.code.clone())
        {
            self.wait_for_activation(identity, &code).await?;
        }

        if response.mqtt.is_none() {
            warn!(
                target: "Bootstrap",
                "No signaling credentials in bootstrap response, deriving locally"
            );
        }
        let credentials = response.signaling_credentials(
            identity,
            (&self.fallback_broker.0, self.fallback_broker.1),
            &self.local_ip,
            &self.signature_key,
        )?;
        info!(
            target: "Bootstrap",
            "Signaling via {}:{} as {}",
            credentials.host, credentials.port, credentials.client_id
        );

        Ok(BootstrapResult {
            response,
            credentials,
        })
    }

    async fn fetch(&self, identity: &DeviceIdentity) -> Result<OtaResponse, BootstrapError> {
        let body = OtaRequest::new(&self.app_name, &self.app_version, &self.board_type);
        let request = HttpRequest::post(&self.ota_url)
            .with_header("device-id", identity.colon_form())
            .with_json(&body)?
            .with_timeout(self.request_timeout);

        info!(target: "Bootstrap", "Requesting configuration from {}", self.ota_url);
        let response = tokio::time::timeout(self.request_timeout, self.http.execute(request))
            .await
            .map_err(|_| BootstrapError::Timeout(self.request_timeout))??;

        if !response.is_success() {
            return Err(BootstrapError::Status(response.status_code));
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    async fn wait_for_activation(
        &self,
        identity: &DeviceIdentity,
        code: &str,
    ) -> Result<(), BootstrapError> {
        info!(target: "Bootstrap", "Activation required, code {code}");
        let url = format!("{}?mac={}", self.activation_url, identity.colon_form());

        for attempt in 1..=self.activation_attempts {
            debug!(
                target: "Bootstrap",
                "Checking activation ({attempt}/{})", self.activation_attempts
            );
            let request = HttpRequest::get(&url).with_timeout(self.request_timeout);
            match self.http.execute(request).await {
                Ok(resp) if resp.is_success() => match resp.json::<ActivationStatus>() {
                    Ok(status) if status.activated => {
                        info!(target: "Bootstrap", "Device activated");
                        return Ok(());
                    }
                    Ok(_) => debug!(target: "Bootstrap", "Not activated yet"),
                    Err(e) => warn!(target: "Bootstrap", "Bad activation status body: {e}"),
                },
                Ok(resp) => {
                    warn!(target: "Bootstrap", "Activation check returned {}", resp.status_code)
                }
                Err(e) => warn!(target: "Bootstrap", "Activation check failed: {e}"),
            }

            if attempt < self.activation_attempts {
                tokio::time::sleep(self.activation_interval).await;
            }
        }

        Err(BootstrapError::ActivationTimeout {
            attempts: self.activation_attempts,
            code: code.to_string(),
        })
    }
}
