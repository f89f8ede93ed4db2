//! Transport layer for device-to-broker communication
//!
//! The [`Transport`] trait abstracts a single authenticated broker session so the
//! reconnection supervisor and the telemetry publisher can be driven by the real
//! MQTT session or by a scripted mock in tests.

use crate::token::Credential;
use rumqttc::QoS;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),
    #[error("No CONNACK within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Not connected")]
    NotConnected,
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("No PUBACK within {0:?}")]
    AckTimeout(Duration),
    #[error("Request queue stayed full for {0:?}")]
    QueueFull(Duration),
    #[error("Session closed: {0}")]
    SessionClosed(String),
}

impl TransportError {
    /// Errors showing the local session is unusable and must be re-established
    pub fn is_fatal_local(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected | TransportError::SessionClosed(_)
        )
    }
}

/// A single authenticated session with the message broker
///
/// All methods take `&self`; implementations keep their lifecycle behind
/// interior mutability so the session can be shared between the supervisor
/// (which opens and closes it) and publishers (which only send).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Perform the handshake using `credential` as the password and wait for
    /// the broker's answer
    async fn connect(&self, credential: &Credential) -> Result<(), TransportError>;

    /// Non-blocking view of the transport-level connection status
    fn is_connected(&self) -> bool;

    /// Best-effort graceful close; safe to call when already disconnected
    async fn disconnect(&self, grace: Duration);

    /// Send a message. QoS 0 returns once enqueued locally, QoS 1 once the
    /// broker acknowledged it.
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;
}

/// Type alias for the MQTT transport
pub type MqttTransport = mqtt::MqttSession;
