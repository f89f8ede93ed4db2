//! Device connector: supervised MQTT session plus telemetry publishing
//!
//! A [`DeviceConnector`] owns one transport session for one device identity.
//! The [`Supervisor`] is the only component allowed to open or close that
//! session; the [`TelemetryPublisher`] drives it through the supervisor before
//! every send.
//!
//! # Usage
//!
//! ```rust,no_run
//! use iot_device_connector::config::ConnectorConfig;
//! use iot_device_connector::connector::{DeliveryGuarantee, DeviceConnector};
//! use std::path::Path;
//!
//! # tokio_test::block_on(async {
//! let config = ConnectorConfig::load_from_file(Path::new("iot-connector.toml"))?;
//! let connector = DeviceConnector::from_config(&config)?;
//!
//! connector
//!     .publish_telemetry(br#"{"temperature":21.5}"#.to_vec(), DeliveryGuarantee::AtLeastOnce)
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod pool;
pub mod publisher;
pub mod supervisor;

pub use pool::ConnectorPool;
pub use publisher::{DeliveryGuarantee, PublishRequest, TelemetryPublisher};
pub use supervisor::{
    Backoff, ConnectorState, RetryBudget, RetryPolicy, SessionGeneration, Supervisor,
};

use crate::config::{ConnectorConfig, TelemetrySection};
use crate::error::{ConnectorError, ConnectorResult};
use crate::identity::DeviceIdentity;
use crate::token::{CredentialIssuer, TokenIssuer};
use crate::transport::mqtt::MqttSession;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One device's connection to the broker
pub struct DeviceConnector<T: Transport = MqttSession> {
    supervisor: Arc<Supervisor<T>>,
    publisher: TelemetryPublisher<T>,
}

impl DeviceConnector<MqttSession> {
    /// Build the connector for the device named in the configuration
    pub fn from_config(config: &ConnectorConfig) -> ConnectorResult<Self> {
        Self::for_identity(config, config.identity()?)
    }

    /// Build a connector for `identity` using the configuration's broker,
    /// key and retry settings
    pub fn for_identity(config: &ConnectorConfig, identity: DeviceIdentity) -> ConnectorResult<Self> {
        let issuer = TokenIssuer::new(config.key_material(), config.device.token_ttl_minutes);
        let session = MqttSession::new(identity.clone(), config.mqtt.clone())
            .map_err(ConnectorError::Connect)?;

        let supervisor = Supervisor::new(
            identity,
            Arc::new(session),
            Arc::new(issuer),
            RetryPolicy::from(&config.retry),
        )
        .with_disconnect_grace(config.mqtt.disconnect_grace());

        Ok(Self::from_supervisor(supervisor, config.telemetry.clone()))
    }
}

impl<T: Transport> DeviceConnector<T> {
    pub fn new(
        identity: DeviceIdentity,
        transport: Arc<T>,
        issuer: Arc<dyn CredentialIssuer>,
        policy: RetryPolicy,
        topics: TelemetrySection,
    ) -> Self {
        Self::from_supervisor(Supervisor::new(identity, transport, issuer, policy), topics)
    }

    pub fn from_supervisor(supervisor: Supervisor<T>, topics: TelemetrySection) -> Self {
        let supervisor = Arc::new(supervisor);
        let publisher = TelemetryPublisher::new(supervisor.clone(), topics);
        Self {
            supervisor,
            publisher,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.supervisor.identity()
    }

    pub fn supervisor(&self) -> &Arc<Supervisor<T>> {
        &self.supervisor
    }

    pub fn publisher(&self) -> &TelemetryPublisher<T> {
        &self.publisher
    }

    pub fn state(&self) -> ConnectorState {
        self.supervisor.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectorState> {
        self.supervisor.subscribe()
    }

    /// Establish the session without publishing anything
    pub async fn connect(&self) -> ConnectorResult<()> {
        self.supervisor.ensure_connected().await.map(|_| ())
    }

    pub async fn publish_message(
        &self,
        target_device_id: &str,
        topic_suffix: &str,
        payload: impl Into<Vec<u8>>,
        guarantee: DeliveryGuarantee,
    ) -> ConnectorResult<()> {
        self.publisher
            .publish_message(target_device_id, topic_suffix, payload, guarantee)
            .await
    }

    pub async fn publish_telemetry(
        &self,
        payload: impl Into<Vec<u8>>,
        guarantee: DeliveryGuarantee,
    ) -> ConnectorResult<()> {
        self.publisher.publish_telemetry(payload, guarantee).await
    }

    pub async fn publish_state(&self, payload: impl Into<Vec<u8>>) -> ConnectorResult<()> {
        self.publisher.publish_state(payload).await
    }

    /// Close the session; the next publish reconnects
    pub async fn disconnect(&self, grace: Duration) {
        self.supervisor.teardown(grace).await;
    }
}
