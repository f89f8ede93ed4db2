//! Pure routing of MQTT events and publish acknowledgement tracking
//!
//! rumqttc does not hand back a packet id from `publish`, so acknowledgement is
//! correlated from the event stream: publishes are handed to the event loop in
//! request order, each QoS 1 publish surfaces as `Outgoing::Publish(pkid)` in that
//! same order, and the broker answers with `PubAck(pkid)`.

use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK with the broker's return code
    ConnectionAcknowledged { accepted: bool, code: String },
    /// A publish packet left the client with this packet id (0 for QoS 0)
    PublishSent { pkid: u16 },
    /// Broker acknowledged a QoS 1 publish
    PublishAcknowledged { pkid: u16 },
    /// Broker closed the session
    Disconnected,
    /// Client sent DISCONNECT
    DisconnectSent,
    /// Pings and everything the connector does not act upon
    InfrastructureEvent(String),
}

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(ack) => EventRoute::ConnectionAcknowledged {
                    accepted: ack.code == ConnectReturnCode::Success,
                    code: format!("{:?}", ack.code),
                },
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged { pkid: ack.pkid },
                Packet::PubComp(comp) => EventRoute::PublishAcknowledged { pkid: comp.pkid },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::PublishSent { pkid: *pkid },
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
        }
    }
}

/// Result delivered to a publisher waiting for PUBACK
pub type AckResult = Result<(), String>;

/// Matches outgoing QoS 1 publishes to their PUBACKs
#[derive(Debug, Default)]
pub struct AckTracker {
    /// Requested but not yet seen on the wire, in request order
    queued: VecDeque<oneshot::Sender<AckResult>>,
    /// On the wire, waiting for PUBACK
    inflight: HashMap<u16, oneshot::Sender<AckResult>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the next QoS 1 publish handed to the client
    pub fn register(&mut self) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(tx);
        rx
    }

    /// Drop the most recent registration after the client refused the request
    pub fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    /// A publish packet was written; packet id 0 marks QoS 0 and is not tracked
    pub fn on_publish_sent(&mut self, pkid: u16) {
        if pkid == 0 {
            return;
        }

        match self.queued.pop_front() {
            Some(waiter) => {
                if let Some(stale) = self.inflight.insert(pkid, waiter) {
                    let _ = stale.send(Err(format!("packet id {pkid} reused before PUBACK")));
                }
            }
            None => debug!(pkid, "Outgoing publish without a registered waiter"),
        }
    }

    /// The broker acknowledged `pkid`
    pub fn on_ack(&mut self, pkid: u16) {
        match self.inflight.remove(&pkid) {
            Some(waiter) => {
                let _ = waiter.send(Ok(()));
            }
            None => warn!(pkid, "PUBACK for unknown packet id"),
        }
    }

    /// Fail every outstanding publish, e.g. when the session drops
    pub fn fail_all(&mut self, reason: &str) {
        for waiter in self.queued.drain(..) {
            let _ = waiter.send(Err(reason.to_string()));
        }
        for (_, waiter) in self.inflight.drain() {
            let _ = waiter.send(Err(reason.to_string()));
        }
    }

    pub fn pending(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, PubAck};

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged { accepted: true, .. }
        ));

        let refused = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::BadUserNamePassword,
            false,
        )));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&refused),
            EventRoute::ConnectionAcknowledged { accepted: false, .. }
        ));
    }

    #[test]
    fn test_route_publish_flow() {
        let sent = Event::Outgoing(Outgoing::Publish(7));
        assert_eq!(
            MessageHandler::route_mqtt_event(&sent),
            EventRoute::PublishSent { pkid: 7 }
        );

        let acked = Event::Incoming(Packet::PubAck(PubAck::new(7)));
        assert_eq!(
            MessageHandler::route_mqtt_event(&acked),
            EventRoute::PublishAcknowledged { pkid: 7 }
        );
    }

    #[test]
    fn test_route_disconnects() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[tokio::test]
    async fn test_ack_resolves_waiter_in_order() {
        let mut tracker = AckTracker::new();
        let first = tracker.register();
        let second = tracker.register();

        tracker.on_publish_sent(1);
        tracker.on_publish_sent(2);
        tracker.on_ack(2);
        tracker.on_ack(1);

        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn test_qos0_publish_does_not_consume_waiter() {
        let mut tracker = AckTracker::new();
        let waiter = tracker.register();

        tracker.on_publish_sent(0);
        assert_eq!(tracker.pending(), 1);

        tracker.on_publish_sent(3);
        tracker.on_ack(3);
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_waiter_not_resolved_before_ack() {
        let mut tracker = AckTracker::new();
        let mut waiter = tracker.register();
        tracker.on_publish_sent(5);

        assert!(waiter.try_recv().is_err());

        tracker.on_ack(5);
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let mut tracker = AckTracker::new();
        let queued = tracker.register();
        let inflight = tracker.register();
        tracker.on_publish_sent(1);

        tracker.fail_all("connection lost");

        assert_eq!(queued.await.unwrap(), Err("connection lost".to_string()));
        assert_eq!(inflight.await.unwrap(), Err("connection lost".to_string()));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_cancel_last() {
        let mut tracker = AckTracker::new();
        let _first = tracker.register();
        let _second = tracker.register();
        tracker.cancel_last();
        assert_eq!(tracker.pending(), 1);
    }
}
