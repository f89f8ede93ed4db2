//! Connector configuration
//!
//! Loaded from a TOML file. Only the device identity and key path are required;
//! everything else has a default matching the behaviour of the production
//! connector (5 reconnect attempts, 5 second fixed delay, TLS 1.2 floor).
//! Secrets are never stored in the file: the directory access token is read at
//! runtime from the environment variable named in `[directory]`.

use crate::identity::{DeviceIdentity, IdentityError};
use crate::token::{KeyAlgorithm, KeyMaterial, MAX_VALIDITY_MINUTES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main connector configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectorConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub directory: DirectorySection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Device identity and key material
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    pub project_id: String,
    pub region: String,
    pub registry_id: String,
    pub device_id: String,
    /// PEM private key used to sign connection tokens
    pub private_key_path: PathBuf,
    /// PEM public key registered with the device at creation time
    pub public_key_path: Option<PathBuf>,
    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,
    /// Lifetime of each connection token
    #[serde(default = "default_token_ttl_minutes")]
    pub token_ttl_minutes: u32,
}

/// Broker session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// `mqtts://`, `ssl://` or `tls://` for TLS; `mqtt://` or `tcp://` for plain TCP
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    #[serde(default)]
    pub tls_min_version: TlsVersion,
    /// Extra CA bundle trusted in addition to the platform roots
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
    /// Capacity of the client request queue
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            tls_min_version: TlsVersion::default(),
            ca_cert_path: None,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            publish_timeout_secs: default_publish_timeout_secs(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
            request_capacity: default_request_capacity(),
        }
    }
}

impl MqttSection {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

/// Lowest TLS protocol version the session will negotiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TlsVersion {
    #[default]
    Tls12,
    Tls13,
}

impl TryFrom<String> for TlsVersion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim() {
            "1.2" => Ok(TlsVersion::Tls12),
            "1.3" => Ok(TlsVersion::Tls13),
            "1.0" | "1.1" => Err(format!(
                "TLS floor {value} is not allowed, the minimum is 1.2"
            )),
            other => Err(format!("unknown TLS version `{other}`, expected 1.2 or 1.3")),
        }
    }
}

impl From<TlsVersion> for String {
    fn from(version: TlsVersion) -> Self {
        match version {
            TlsVersion::Tls12 => "1.2".to_string(),
            TlsVersion::Tls13 => "1.3".to_string(),
        }
    }
}

/// Reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Reconnect attempts allowed after the first failed handshake
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Cap for exponential backoff
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Restore the budget once this long has passed since the terminal failure
    pub cooldown_secs: Option<u64>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff: BackoffKind::default(),
            max_delay_ms: default_max_delay_ms(),
            cooldown_secs: None,
        }
    }
}

/// Delay progression between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

/// Device directory (admin HTTP API)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectorySection {
    #[serde(default = "default_directory_url")]
    pub base_url: String,
    /// Environment variable holding an OAuth2 bearer token
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,
    #[serde(default = "default_directory_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DirectorySection {
    fn default() -> Self {
        Self {
            base_url: default_directory_url(),
            access_token_env: default_access_token_env(),
            timeout_secs: default_directory_timeout_secs(),
        }
    }
}

/// Default topic suffixes for the connector's own device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    #[serde(default = "default_events_topic")]
    pub events_topic: String,
    #[serde(default = "default_state_topic")]
    pub state_topic: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            events_topic: default_events_topic(),
            state_topic: default_state_topic(),
        }
    }
}

fn default_token_ttl_minutes() -> u32 {
    60
}

fn default_broker_url() -> String {
    "mqtts://mqtt.googleapis.com:8883".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_publish_timeout_secs() -> u64 {
    30
}

fn default_disconnect_grace_ms() -> u64 {
    250
}

fn default_request_capacity() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_delay_ms() -> u64 {
    5000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_directory_url() -> String {
    "https://cloudiot.googleapis.com".to_string()
}

fn default_access_token_env() -> String {
    "IOT_ACCESS_TOKEN".to_string()
}

fn default_directory_timeout_secs() -> u64 {
    30
}

fn default_events_topic() -> String {
    "events".to_string()
}

fn default_state_topic() -> String {
    "state".to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(#[from] IdentityError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConnectorConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ConnectorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.identity()?;

        let ttl = self.device.token_ttl_minutes;
        if ttl == 0 || ttl > MAX_VALIDITY_MINUTES {
            return Err(ConfigError::InvalidConfig(format!(
                "device.token_ttl_minutes must be between 1 and {MAX_VALIDITY_MINUTES}, got {ttl}"
            )));
        }

        if self.mqtt.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keep_alive_secs must be at least 5".to_string(),
            ));
        }

        if self.mqtt.connect_timeout_secs == 0 || self.mqtt.publish_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt timeouts must be greater than 0".to_string(),
            ));
        }

        if self.mqtt.request_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.request_capacity must be greater than 0".to_string(),
            ));
        }

        crate::transport::mqtt::parse_broker_url(&self.mqtt.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if self.retry.backoff == BackoffKind::Exponential
            && self.retry.max_delay_ms < self.retry.delay_ms
        {
            return Err(ConfigError::InvalidConfig(
                "retry.max_delay_ms must not be smaller than retry.delay_ms".to_string(),
            ));
        }

        if self.telemetry.events_topic.is_empty() || self.telemetry.state_topic.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "telemetry topics must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Device identity described by the `[device]` section
    pub fn identity(&self) -> Result<DeviceIdentity, ConfigError> {
        Ok(DeviceIdentity::new(
            &self.device.project_id,
            &self.device.region,
            &self.device.registry_id,
            &self.device.device_id,
        )?)
    }

    /// Private key used for connection tokens
    pub fn key_material(&self) -> KeyMaterial {
        KeyMaterial::from_file(&self.device.private_key_path, self.device.key_algorithm)
    }

    /// Directory bearer token from the configured environment variable
    pub fn directory_access_token(&self) -> Result<String, ConfigError> {
        std::env::var(&self.directory.access_token_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.directory.access_token_env.clone()))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
project_id = "test-project"
region = "europe-west1"
registry_id = "test-registry"
device_id = "test-device"
private_key_path = "tests/fixtures/rsa_private.pem"

[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
