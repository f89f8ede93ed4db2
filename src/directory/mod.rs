//! Device directory: the admin side of the device-management service
//!
//! The connector only needs a device's public key to be registered before the
//! broker will trust its tokens. This module provides the thin client used to
//! provision and inspect devices; request semantics are those of the remote
//! service.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::token::KeyAlgorithm;

pub mod http;

pub use http::HttpDeviceDirectory;

/// Device directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Directory API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Directory authentication failed: {0}")]
    Auth(String),
    #[error("failed to read public key from {}", path.display())]
    PublicKeyRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Public key registered for a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyCredential {
    /// `RSA_PEM`, `ES256_PEM`, ...
    pub format: String,
    pub key: String,
}

impl PublicKeyCredential {
    pub fn new(algorithm: KeyAlgorithm, pem: impl Into<String>) -> Self {
        Self {
            format: algorithm.public_key_format().to_string(),
            key: pem.into(),
        }
    }

    /// Read a PEM public key from disk
    pub fn from_file(path: &Path, algorithm: KeyAlgorithm) -> Result<Self, DirectoryError> {
        let pem = std::fs::read_to_string(path).map_err(|source| DirectoryError::PublicKeyRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(algorithm, pem))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCredential {
    pub public_key: PublicKeyCredential,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<String>,
}

/// A device resource as returned by the directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<DeviceCredential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_state_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_config_ack_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_config_send_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// One version of the cloud-to-device configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// int64 encoded as a JSON string
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_update_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ack_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_data: Option<String>,
}

impl DeviceConfig {
    /// Decoded configuration payload, `None` when absent or not valid base64
    pub fn data(&self) -> Option<Vec<u8>> {
        decode_binary(self.binary_data.as_deref())
    }
}

/// A state report sent by the device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_data: Option<String>,
}

impl DeviceState {
    pub fn data(&self) -> Option<Vec<u8>> {
        decode_binary(self.binary_data.as_deref())
    }
}

fn decode_binary(data: Option<&str>) -> Option<Vec<u8>> {
    data.and_then(|encoded| STANDARD.decode(encoded).ok())
}

/// Encode a configuration payload the way the directory expects it
pub fn encode_binary(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Device provisioning and inspection operations
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Register `device_id` with a single public key credential
    async fn create_device(
        &self,
        device_id: &str,
        public_key: PublicKeyCredential,
    ) -> Result<Device, DirectoryError>;

    async fn get_device(&self, device_id: &str) -> Result<Device, DirectoryError>;

    async fn list_devices(&self) -> Result<Vec<Device>, DirectoryError>;

    /// Partial update; only the fields named in `update_mask` are applied
    async fn patch_device(
        &self,
        device_id: &str,
        patch: &Device,
        update_mask: &str,
    ) -> Result<Device, DirectoryError>;

    async fn delete_device(&self, device_id: &str) -> Result<(), DirectoryError>;

    async fn get_device_config_versions(
        &self,
        device_id: &str,
    ) -> Result<Vec<DeviceConfig>, DirectoryError>;

    async fn get_device_states(&self, device_id: &str) -> Result<Vec<DeviceState>, DirectoryError>;

    /// Store a new cloud-to-device configuration version
    async fn set_device_config(
        &self,
        device_id: &str,
        data: &[u8],
    ) -> Result<DeviceConfig, DirectoryError>;
}
