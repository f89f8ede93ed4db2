//! Device identity and the resource paths derived from it
//!
//! A device is addressed by the tuple (project, region, registry, device). The
//! broker uses the full resource path as the MQTT client id, and the directory API
//! uses the registry path as the parent of every device request.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identity of a single device registered in the device-management service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub project: String,
    pub region: String,
    pub registry: String,
    pub device: String,
}

/// Identity validation failure
#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    #[error("identity component `{field}` must not be empty")]
    Empty { field: &'static str },
    #[error("identity component `{field}` contains invalid character(s): {value}")]
    InvalidCharacters { field: &'static str, value: String },
}

impl DeviceIdentity {
    /// Build and validate an identity
    pub fn new(
        project: impl Into<String>,
        region: impl Into<String>,
        registry: impl Into<String>,
        device: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let identity = Self {
            project: project.into(),
            region: region.into(),
            registry: registry.into(),
            device: device.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Validate every component: non-empty, no path separators or whitespace
    pub fn validate(&self) -> Result<(), IdentityError> {
        for (field, value) in [
            ("project", &self.project),
            ("region", &self.region),
            ("registry", &self.registry),
            ("device", &self.device),
        ] {
            validate_component(field, value)?;
        }
        Ok(())
    }

    /// `projects/{project}/locations/{region}`
    pub fn location_path(&self) -> String {
        format!("projects/{}/locations/{}", self.project, self.region)
    }

    /// `projects/{project}/locations/{region}/registries/{registry}`
    pub fn registry_path(&self) -> String {
        format!("{}/registries/{}", self.location_path(), self.registry)
    }

    /// Full device resource path, also used as the MQTT client id
    pub fn device_path(&self) -> String {
        self.device_path_for(&self.device)
    }

    /// Resource path of another device in the same registry
    pub fn device_path_for(&self, device_id: &str) -> String {
        format!("{}/devices/{}", self.registry_path(), device_id)
    }

    /// MQTT client id (the connection principal)
    pub fn client_id(&self) -> String {
        self.device_path()
    }

    /// Same identity pointed at a different device of the registry
    pub fn with_device(&self, device: impl Into<String>) -> Result<Self, IdentityError> {
        let identity = Self {
            device: device.into(),
            ..self.clone()
        };
        identity.validate()?;
        Ok(identity)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.device_path())
    }
}

fn validate_component(field: &'static str, value: &str) -> Result<(), IdentityError> {
    if value.is_empty() {
        return Err(IdentityError::Empty { field });
    }

    if value.chars().any(|c| c == '/' || c.is_whitespace()) {
        return Err(IdentityError::InvalidCharacters {
            field,
            value: value.to_string(),
        });
    }

    Ok(())
}
