//! MQTT 3.1.1 broker session over rumqttc
//!
//! One [`MqttSession`] owns at most one live connection. `connect` performs the
//! handshake inline and only then hands the event loop to a background task,
//! which tracks publish acknowledgements and notices connection loss. The task
//! never reconnects on its own: once the connection drops it marks the session
//! disconnected and exits, leaving every reconnection decision to the
//! supervisor.

use super::connection::configure_mqtt_options;
use super::message_handler::{AckResult, AckTracker, EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::identity::DeviceIdentity;
use crate::token::Credential;
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, EventLoop, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How often a publish re-checks a full request queue
const ENQUEUE_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// A live connection and the task polling it
struct ActiveSession {
    client: AsyncClient,
    event_loop_handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// MQTT transport session for one device identity
pub struct MqttSession {
    identity: DeviceIdentity,
    config: MqttSection,
    connected: Arc<AtomicBool>,
    acks: Arc<StdMutex<AckTracker>>,
    active: Mutex<Option<ActiveSession>>,
}

fn lock_tracker(acks: &StdMutex<AckTracker>) -> MutexGuard<'_, AckTracker> {
    acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MqttSession {
    /// Create a disconnected session; the broker URL is validated up front
    pub fn new(identity: DeviceIdentity, config: MqttSection) -> Result<Self, TransportError> {
        super::connection::parse_broker_url(&config.broker_url)?;

        Ok(Self {
            identity,
            config,
            connected: Arc::new(AtomicBool::new(false)),
            acks: Arc::new(StdMutex::new(AckTracker::new())),
            active: Mutex::new(None),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Number of QoS 1 publishes still waiting for PUBACK
    pub fn pending_acks(&self) -> usize {
        lock_tracker(&self.acks).pending()
    }

    /// Poll the event loop until the broker answers the CONNECT
    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), TransportError> {
        loop {
            match event_loop.poll().await {
                Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::ConnectionAcknowledged { accepted: true, .. } => return Ok(()),
                    EventRoute::ConnectionAcknowledged {
                        accepted: false,
                        code,
                    } => return Err(TransportError::ConnectionRefused(code)),
                    _ => continue,
                },
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(TransportError::ConnectionRefused(format!("{code:?}")));
                }
                Err(e) => return Err(TransportError::ConnectionFailed(Box::new(e))),
            }
        }
    }

    /// Background task: drive the established connection until it ends
    async fn run_event_loop(
        mut event_loop: EventLoop,
        device: String,
        connected: Arc<AtomicBool>,
        acks: Arc<StdMutex<AckTracker>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let reason = loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break "session shut down".to_string();
                    }
                }
                event = event_loop.poll() => match event {
                    Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                        EventRoute::PublishSent { pkid } => {
                            lock_tracker(&acks).on_publish_sent(pkid);
                        }
                        EventRoute::PublishAcknowledged { pkid } => {
                            lock_tracker(&acks).on_ack(pkid);
                        }
                        EventRoute::Disconnected => {
                            warn!(device = %device, "Broker closed the MQTT session");
                            break "broker closed the session".to_string();
                        }
                        EventRoute::DisconnectSent => {
                            break "client disconnected".to_string();
                        }
                        EventRoute::ConnectionAcknowledged { code, .. } => {
                            debug!(target: "mqtt_transport", "Unexpected CONNACK: {}", code);
                        }
                        EventRoute::InfrastructureEvent(event) => {
                            debug!(target: "mqtt_transport", "MQTT event: {}", event);
                        }
                    },
                    Err(e) => {
                        error!(device = %device, "MQTT event loop error: {}", e);
                        break e.to_string();
                    }
                }
            }
        };

        connected.store(false, Ordering::SeqCst);
        lock_tracker(&acks).fail_all(&reason);
        info!(device = %device, reason = %reason, "MQTT event loop stopped");
    }

    /// Ask the broker to close, then give the event loop `grace` to finish
    async fn close(session: ActiveSession, grace: Duration) {
        let ActiveSession {
            client,
            mut event_loop_handle,
            shutdown_tx,
        } = session;

        if let Err(e) = client.try_disconnect() {
            debug!("DISCONNECT could not be queued: {}", e);
        }

        match tokio::time::timeout(grace, &mut event_loop_handle).await {
            Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!("Event loop task didn't shut down gracefully, forcing abort");
                let _ = shutdown_tx.send(true);
                event_loop_handle.abort();
            }
        }
    }

    /// Hand a publish to the client's request queue.
    ///
    /// The ack waiter is registered and the request queued in one synchronous
    /// step, so a caller dropping this future can never leave a waiter behind
    /// for another publish's PUBACK. A full queue is retried until `deadline`
    /// without holding any lock in between.
    async fn enqueue(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
        deadline: Instant,
    ) -> Result<Option<oneshot::Receiver<AckResult>>, TransportError> {
        loop {
            {
                let active = self.active.lock().await;
                let session = active
                    .as_ref()
                    .filter(|_| self.connected.load(Ordering::SeqCst))
                    .ok_or(TransportError::NotConnected)?;

                let mut acks = lock_tracker(&self.acks);
                let ack_rx = (qos != QoS::AtMostOnce).then(|| acks.register());

                match session.client.try_publish(topic, qos, retain, payload.clone()) {
                    Ok(()) => return Ok(ack_rx),
                    Err(e) => {
                        if ack_rx.is_some() {
                            acks.cancel_last();
                        }
                        if !self.connected.load(Ordering::SeqCst) {
                            return Err(TransportError::SessionClosed(e.to_string()));
                        }
                        if Instant::now() >= deadline {
                            return Err(TransportError::QueueFull(self.config.publish_timeout()));
                        }
                    }
                }
            }

            tokio::time::sleep(ENQUEUE_RETRY_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Transport for MqttSession {
    async fn connect(&self, credential: &Credential) -> Result<(), TransportError> {
        let mut active = self.active.lock().await;

        // A stale session from an earlier connection must not keep polling
        if let Some(previous) = active.take() {
            Self::close(previous, self.config.disconnect_grace()).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        lock_tracker(&self.acks).fail_all("superseded by a new connection");

        let mqtt_options = configure_mqtt_options(&self.identity, &self.config, credential)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, self.config.request_capacity);

        info!(
            client_id = %self.identity.client_id(),
            broker = %self.config.broker_url,
            "Connecting to MQTT broker"
        );

        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, Self::wait_for_connack(&mut event_loop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(TransportError::ConnectTimeout(timeout)),
        }

        self.connected.store(true, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event_loop_handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            self.identity.device.clone(),
            self.connected.clone(),
            self.acks.clone(),
            shutdown_rx,
        ));

        *active = Some(ActiveSession {
            client,
            event_loop_handle,
            shutdown_tx,
        });

        info!(device = %self.identity.device, "MQTT session established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self, grace: Duration) {
        let session = self.active.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);

        if let Some(session) = session {
            Self::close(session, grace).await;
            lock_tracker(&self.acks).fail_all("session disconnected");
            info!(device = %self.identity.device, "MQTT session disconnected");
        }
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        if topic.contains(['+', '#']) {
            return Err(TransportError::PublishFailed(
                format!("wildcards are not allowed in a publish topic: {topic}").into(),
            ));
        }

        let timeout = self.config.publish_timeout();
        let deadline = Instant::now() + timeout;

        let Some(ack_rx) = self.enqueue(topic, qos, retain, payload, deadline).await? else {
            debug!(topic = %topic, "Published QoS 0 message");
            return Ok(());
        };

        match tokio::time::timeout_at(deadline, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(topic = %topic, "Publish acknowledged by broker");
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(TransportError::SessionClosed(reason)),
            Ok(Err(_)) => Err(TransportError::SessionClosed(
                "acknowledgement channel dropped".to_string(),
            )),
            Err(_) => Err(TransportError::AckTimeout(timeout)),
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // No async work in Drop: only stop the background task
        if let Some(session) = self.active.get_mut().take() {
            let _ = session.shutdown_tx.send(true);
            session.event_loop_handle.abort();
        }
    }
}
