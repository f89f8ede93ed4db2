//! IoT device connector
//!
//! Connects a device registered in a cloud device-management service to its
//! MQTT broker and publishes telemetry on its behalf.
//!
//! # Overview
//!
//! - [`token`] signs the short-lived JWT the broker accepts as a password
//! - [`transport`] holds the MQTT 3.1.1 session over TLS
//! - [`connector`] supervises reconnection with a bounded retry budget and
//!   publishes with an explicit delivery guarantee
//! - [`directory`] provisions and inspects devices through the admin API
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use iot_device_connector::{ConnectorConfig, DeliveryGuarantee, DeviceConnector};
//!
//! # tokio_test::block_on(async {
//! let config = ConnectorConfig::parse(r#"
//! [device]
//! project_id = "my-project"
//! region = "europe-west1"
//! registry_id = "my-registry"
//! device_id = "thermostat-1"
//! private_key_path = "rsa_private.pem"
//! "#)?;
//!
//! let connector = DeviceConnector::from_config(&config)?;
//! connector
//!     .publish_message("thermostat-1", "events", b"21.5".to_vec(), DeliveryGuarantee::AtLeastOnce)
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod connector;
pub mod directory;
pub mod error;
pub mod identity;
pub mod observability;
pub mod testing;
pub mod token;
pub mod transport;

pub use config::{ConfigError, ConnectorConfig};
pub use connector::{
    ConnectorPool, ConnectorState, DeliveryGuarantee, DeviceConnector, PublishRequest,
    RetryPolicy, Supervisor, TelemetryPublisher,
};
pub use directory::{DeviceDirectory, DirectoryError, HttpDeviceDirectory};
pub use error::{ConnectorError, ConnectorResult};
pub use identity::DeviceIdentity;
pub use token::{Credential, CredentialIssuer, KeyAlgorithm, KeyMaterial, TokenError, TokenIssuer};
pub use transport::{Transport, TransportError};
