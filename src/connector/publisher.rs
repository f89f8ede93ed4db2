//! Telemetry publisher
//!
//! Each publish first makes sure the supervisor holds a live session, then
//! hands the message to the transport. Only the connection is ever retried;
//! a message whose send fails is reported to the caller and not re-sent.

use super::supervisor::Supervisor;
use crate::config::TelemetrySection;
use crate::error::{ConnectorError, ConnectorResult};
use crate::transport::mqtt::TopicBuilder;
use crate::transport::Transport;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn, Instrument};

/// Delivery guarantee requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    /// Fire and forget: returns once the message is enqueued locally
    #[default]
    AtMostOnce,
    /// Returns only after the broker acknowledged the message
    AtLeastOnce,
}

impl DeliveryGuarantee {
    /// Wire-level QoS for this guarantee
    pub fn qos(self) -> QoS {
        match self {
            DeliveryGuarantee::AtMostOnce => QoS::AtMostOnce,
            DeliveryGuarantee::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// A single message to publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub target_device_id: String,
    pub topic_suffix: String,
    pub payload: Vec<u8>,
    pub guarantee: DeliveryGuarantee,
}

impl PublishRequest {
    pub fn topic(&self) -> String {
        TopicBuilder::device_topic(&self.target_device_id, &self.topic_suffix)
    }
}

/// Public-facing publish capability of a connector
pub struct TelemetryPublisher<T: Transport> {
    supervisor: Arc<Supervisor<T>>,
    topics: TelemetrySection,
}

impl<T: Transport> TelemetryPublisher<T> {
    pub fn new(supervisor: Arc<Supervisor<T>>, topics: TelemetrySection) -> Self {
        Self { supervisor, topics }
    }

    pub fn supervisor(&self) -> &Arc<Supervisor<T>> {
        &self.supervisor
    }

    /// Publish `payload` to `/devices/{target_device_id}/{topic_suffix}`
    ///
    /// The suffix is not validated. With [`DeliveryGuarantee::AtLeastOnce`] the
    /// call resolves only after the broker's acknowledgement.
    pub async fn publish_message(
        &self,
        target_device_id: &str,
        topic_suffix: &str,
        payload: impl Into<Vec<u8>>,
        guarantee: DeliveryGuarantee,
    ) -> ConnectorResult<()> {
        self.publish(PublishRequest {
            target_device_id: target_device_id.to_string(),
            topic_suffix: topic_suffix.to_string(),
            payload: payload.into(),
            guarantee,
        })
        .await
    }

    pub async fn publish(&self, request: PublishRequest) -> ConnectorResult<()> {
        let topic = request.topic();
        let span = crate::publish_span!(
            topic = %topic,
            guarantee = ?request.guarantee,
            bytes = request.payload.len()
        );

        async move {
            let generation = self.supervisor.ensure_connected().await?;

            let result = self
                .supervisor
                .transport()
                .publish(&topic, request.guarantee.qos(), false, request.payload)
                .await;

            match result {
                Ok(()) => {
                    debug!("Message published");
                    Ok(())
                }
                Err(e) => {
                    warn!("Publish failed: {}", e);
                    if e.is_fatal_local() {
                        // Force the next call to re-establish a clean session
                        self.supervisor.invalidate(generation).await;
                    }
                    Err(ConnectorError::Publish(e))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Publish to the connector's own device on the telemetry events topic
    pub async fn publish_telemetry(
        &self,
        payload: impl Into<Vec<u8>>,
        guarantee: DeliveryGuarantee,
    ) -> ConnectorResult<()> {
        let device = self.supervisor.identity().device.clone();
        self.publish_message(&device, &self.topics.events_topic, payload, guarantee)
            .await
    }

    /// Report device state; state updates are always acknowledged
    pub async fn publish_state(&self, payload: impl Into<Vec<u8>>) -> ConnectorResult<()> {
        let device = self.supervisor.identity().device.clone();
        self.publish_message(
            &device,
            &self.topics.state_topic,
            payload,
            DeliveryGuarantee::AtLeastOnce,
        )
        .await
    }
}
