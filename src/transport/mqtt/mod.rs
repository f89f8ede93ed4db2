//! MQTT 3.1.1 transport for device connections
//!
//! The module separates pure functions from I/O:
//!
//! - [`connection`] - broker URL parsing, TLS and MQTT option construction, topics
//! - [`message_handler`] - pure event routing and publish acknowledgement tracking
//! - [`session`] - the I/O side: handshake, event loop task, publish
//!
//! # Usage
//!
//! ```rust,no_run
//! use iot_device_connector::config::MqttSection;
//! use iot_device_connector::identity::DeviceIdentity;
//! use iot_device_connector::token::{KeyMaterial, TokenIssuer, CredentialIssuer};
//! use iot_device_connector::transport::{mqtt::MqttSession, Transport};
//!
//! # tokio_test::block_on(async {
//! let identity = DeviceIdentity::new("my-project", "europe-west1", "my-registry", "my-device")?;
//! let issuer = TokenIssuer::new(KeyMaterial::from_file("rsa_private.pem", Default::default()), 60);
//! let session = MqttSession::new(identity.clone(), MqttSection::default())?;
//!
//! session.connect(&issuer.issue(&identity)?).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod message_handler;
pub mod session;

pub use connection::{
    build_tls_config, configure_mqtt_options, parse_broker_url, BrokerAddress, TopicBuilder,
    USERNAME_SENTINEL,
};
pub use message_handler::{AckTracker, EventRoute, MessageHandler};
pub use session::MqttSession;
