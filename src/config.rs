use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use voxcore::bootstrap::{DEFAULT_APP_NAME, DEFAULT_APP_VERSION, DEFAULT_BOARD_TYPE};
use voxcore::identity::{DeviceIdentity, InvalidIdentity};
use voxcore::jitter::JitterBufferConfig;
use voxcore::session::AudioParams;

/// Runtime configuration for one device session.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Bootstrap endpoint, e.g. `http://host:8002/toy/ota/`.
    pub ota_url: String,
    /// Activation poll endpoint; `?mac=` is appended.
    pub activation_url: String,
    /// Fixed device identity; generated when absent.
    pub device_id: Option<DeviceIdentity>,
    pub app_name: String,
    pub app_version: String,
    pub board_type: String,
    /// Broker used when the bootstrap names none.
    pub fallback_broker: (String, u16),
    /// Key for locally derived broker passwords.
    pub signature_key: String,
    /// Address advertised in locally derived usernames.
    pub local_ip: String,

    pub bootstrap_timeout: Duration,
    pub activation_interval: Duration,
    pub activation_attempts: u32,

    pub hello_timeout: Duration,
    pub publish_timeout: Duration,

    /// Parameters announced in `hello`.
    pub audio: AudioParams,
    pub jitter: JitterBufferConfig,
    pub pull_timeout: Duration,
    pub stall_warning: Duration,
    pub recv_timeout: Duration,
    pub recv_buffer_size: usize,

    pub media_timeout: Duration,
    pub max_media_retries: u32,
    pub retry_delay: Duration,
    pub join_timeout: Duration,

    /// Raw s16le capture file; silence when absent.
    pub input: Option<PathBuf>,
    /// Raw s16le playback file; discarded when absent.
    pub output: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ota_url: "http://127.0.0.1:8002/toy/ota/".to_string(),
            activation_url: "http://127.0.0.1:8002/ota/active".to_string(),
            device_id: None,
            app_name: DEFAULT_APP_NAME.to_string(),
            app_version: DEFAULT_APP_VERSION.to_string(),
            board_type: DEFAULT_BOARD_TYPE.to_string(),
            fallback_broker: ("127.0.0.1".to_string(), 1883),
            signature_key: "test-signature-key-12345".to_string(),
            local_ip: "127.0.0.1".to_string(),

            bootstrap_timeout: Duration::from_secs(5),
            activation_interval: Duration::from_secs(5),
            activation_attempts: 10,

            hello_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(2),

            audio: AudioParams::default(),
            jitter: JitterBufferConfig::default(),
            pull_timeout: Duration::from_secs(1),
            stall_warning: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(1),
            recv_buffer_size: 4096,

            media_timeout: Duration::from_secs(30),
            max_media_retries: 3,
            retry_delay: Duration::from_secs(2),
            join_timeout: Duration::from_secs(2),

            input: None,
            output: None,
        }
    }
}

/// Command line for the voxlink device client.
#[derive(Debug, Parser)]
#[command(name = "voxlink", version, about = "Voice assistant device transport client")]
pub struct Cli {
    /// Bootstrap (OTA) URL
    #[arg(long, env = "VOXLINK_OTA_URL", default_value = "http://127.0.0.1:8002/toy/ota/")]
    pub ota_url: String,

    /// Activation status URL
    #[arg(long, env = "VOXLINK_ACTIVATION_URL")]
    pub activation_url: Option<String>,

    /// Device MAC, e.g. 00:16:3e:ac:b5:38 (random when omitted)
    #[arg(long, env = "VOXLINK_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Broker host used when the bootstrap response names none
    #[arg(long, env = "VOXLINK_BROKER_HOST", default_value = "127.0.0.1")]
    pub broker_host: String,

    #[arg(long, env = "VOXLINK_BROKER_PORT", default_value_t = 1883)]
    pub broker_port: u16,

    /// HMAC key for locally derived broker credentials
    #[arg(long, env = "VOXLINK_SIGNATURE_KEY", default_value = "test-signature-key-12345")]
    pub signature_key: String,

    /// IP advertised in locally derived credentials
    #[arg(long, env = "VOXLINK_LOCAL_IP", default_value = "127.0.0.1")]
    pub local_ip: String,

    /// Frames buffered before playback starts
    #[arg(long, env = "VOXLINK_JITTER_START", default_value_t = 16)]
    pub jitter_start: usize,

    /// Playback re-buffers below this many frames
    #[arg(long, env = "VOXLINK_JITTER_MIN", default_value_t = 3)]
    pub jitter_min: usize,

    /// Seconds without audio during a turn before retrying
    #[arg(long, env = "VOXLINK_MEDIA_TIMEOUT", default_value_t = 30)]
    pub media_timeout_secs: u64,

    /// Raw s16le file to stream as microphone input
    #[arg(long, env = "VOXLINK_INPUT")]
    pub input: Option<PathBuf>,

    /// Raw s16le file to write received audio to
    #[arg(long, env = "VOXLINK_OUTPUT")]
    pub output: Option<PathBuf>,
}

impl Cli {
    pub fn into_config(self) -> Result<ClientConfig, InvalidIdentity> {
        let defaults = ClientConfig::default();
        let device_id = self.device_id.as_deref().map(str::parse).transpose()?;
        let activation_url = self
            .activation_url
            .unwrap_or_else(|| derive_activation_url(&self.ota_url));

        Ok(ClientConfig {
            ota_url: self.ota_url,
            activation_url,
            device_id,
            fallback_broker: (self.broker_host, self.broker_port),
            signature_key: self.signature_key,
            local_ip: self.local_ip,
            jitter: JitterBufferConfig {
                start_watermark: self.jitter_start,
                min_watermark: self.jitter_min,
                ..defaults.jitter.clone()
            },
            media_timeout: Duration::from_secs(self.media_timeout_secs),
            input: self.input,
            output: self.output,
            ..defaults
        })
    }
}

/// `scheme://host:port/anything` -> `scheme://host:port/ota/active`.
fn derive_activation_url(ota_url: &str) -> String {
    let after_scheme = ota_url.find("://").map(|i| i + 3).unwrap_or(0);
    let origin_end = ota_url[after_scheme..]
        .find('/')
        .map(|i| after_scheme + i)
        .unwrap_or(ota_url.len());
    format!("{}/ota/active", &ota_url[..origin_end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = ClientConfig::default();
        assert_eq!(config.jitter.start_watermark, 16);
        assert_eq!(config.jitter.min_watermark, 3);
        assert_eq!(config.jitter.capacity, 256);
        assert_eq!(config.hello_timeout, Duration::from_secs(30));
        assert_eq!(config.media_timeout, Duration::from_secs(30));
        assert_eq!(config.max_media_retries, 3);
        assert_eq!(config.activation_attempts, 10);
        assert_eq!(config.recv_buffer_size, 4096);
    }

    #[test]
    fn test_cli_into_config() {
        let cli = Cli::parse_from([
            "voxlink",
            "--ota-url",
            "http://10.0.0.1:8002/toy/ota/",
            "--device-id",
            "00_16_3e_00_00_01",
            "--jitter-start",
            "8",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.activation_url, "http://10.0.0.1:8002/ota/active");
        assert_eq!(
            config.device_id.map(|d| d.colon_form()),
            Some("00:16:3e:00:00:01".to_string())
        );
        assert_eq!(config.jitter.start_watermark, 8);
        assert_eq!(config.jitter.min_watermark, 3);
    }

    #[test]
    fn test_cli_rejects_bad_device_id() {
        let cli = Cli::parse_from(["voxlink", "--device-id", "nope"]);
        assert!(cli.into_config().is_err());
    }

    #[test]
    fn test_derive_activation_url() {
        assert_eq!(derive_activation_url("http://h:1/toy/ota/"), "http://h:1/ota/active");
        assert_eq!(derive_activation_url("http://h:1"), "http://h:1/ota/active");
    }
}
