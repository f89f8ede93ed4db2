//! Mock implementations for testing
//!
//! Provides a scripted transport, static credential issuers and an in-memory
//! device directory so the connector can be exercised without a broker, key
//! files or the directory service.

use crate::directory::{
    encode_binary, Device, DeviceConfig, DeviceCredential, DeviceDirectory, DeviceState,
    DirectoryError, PublicKeyCredential,
};
use crate::identity::DeviceIdentity;
use crate::token::{Credential, CredentialIssuer, TokenError};
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rumqttc::QoS;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

/// A message accepted by [`MockTransport`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Vec<u8>,
}

/// Scripted transport for testing
///
/// Connect attempts consume `connect_results` in order and succeed once the
/// script is empty. Publishes consume `publish_results` the same way.
#[derive(Debug, Default)]
pub struct MockTransport {
    pub connect_results: Arc<Mutex<VecDeque<Result<(), TransportError>>>>,
    pub publish_results: Arc<Mutex<VecDeque<Result<(), TransportError>>>>,
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub tokens: Arc<Mutex<Vec<String>>>,
    connected: AtomicBool,
    connect_calls: AtomicU32,
    publish_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    connects_in_flight: AtomicU32,
    max_concurrent_connects: AtomicU32,
    connect_delay: Duration,
    acks: Option<Arc<Semaphore>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_results(results: Vec<Result<(), TransportError>>) -> Self {
        Self {
            connect_results: Arc::new(Mutex::new(results.into())),
            ..Default::default()
        }
    }

    /// Make every handshake take `delay`
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Hold QoS 1 publishes until [`MockTransport::release_acks`] is called
    pub fn with_held_acks(mut self) -> Self {
        self.acks = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn release_acks(&self, count: usize) {
        if let Some(acks) = &self.acks {
            acks.add_permits(count);
        }
    }

    pub async fn push_publish_result(&self, result: Result<(), TransportError>) {
        self.publish_results.lock().await.push_back(result);
    }

    /// Simulate the broker dropping the session
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published_messages.lock().await.clone()
    }

    /// Tokens presented on each connect attempt, in order
    pub async fn tokens_seen(&self) -> Vec<String> {
        self.tokens.lock().await.clone()
    }

    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> u32 {
        self.publish_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Highest number of handshakes observed running at the same time
    pub fn max_concurrent_connects(&self) -> u32 {
        self.max_concurrent_connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, credential: &Credential) -> Result<(), TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.connects_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_connects
            .fetch_max(in_flight, Ordering::SeqCst);

        self.tokens.lock().await.push(credential.token().to_string());

        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let result = self
            .connect_results
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(()));
        self.connected.store(result.is_ok(), Ordering::SeqCst);
        self.connects_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self, _grace: Duration) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);

        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        if let Some(result) = self.publish_results.lock().await.pop_front() {
            result?;
        }

        if qos != QoS::AtMostOnce {
            if let Some(acks) = &self.acks {
                acks.acquire()
                    .await
                    .map_err(|e| TransportError::SessionClosed(e.to_string()))?
                    .forget();
            }
        }

        self.published_messages.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });
        Ok(())
    }
}

/// Issues distinct unsigned tokens without key material
#[derive(Debug, Default)]
pub struct StaticIssuer {
    issued: AtomicU32,
}

impl StaticIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::SeqCst)
    }
}

impl CredentialIssuer for StaticIssuer {
    fn issue(&self, identity: &DeviceIdentity) -> Result<Credential, TokenError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        Ok(Credential::new(
            format!("static-token-{}-{n}", identity.device),
            now,
            now + ChronoDuration::minutes(60),
        ))
    }
}

/// Issuer whose key material can never be read
#[derive(Debug, Default)]
pub struct FailingIssuer;

impl CredentialIssuer for FailingIssuer {
    fn issue(&self, _identity: &DeviceIdentity) -> Result<Credential, TokenError> {
        Err(TokenError::KeyRead {
            path: "missing/rsa_private.pem".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock key missing"),
        })
    }
}

#[derive(Debug, Default)]
struct StoredDevice {
    device: Device,
    configs: Vec<DeviceConfig>,
    states: Vec<DeviceState>,
}

/// In-memory device directory for testing
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    registry_path: String,
    devices: Mutex<BTreeMap<String, StoredDevice>>,
}

impl InMemoryDirectory {
    pub fn new(registry_path: impl Into<String>) -> Self {
        Self {
            registry_path: registry_path.into(),
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a state report as if the device had sent one
    pub async fn push_state(&self, device_id: &str, data: &[u8]) -> Result<(), DirectoryError> {
        let mut devices = self.devices.lock().await;
        let stored = devices
            .get_mut(device_id)
            .ok_or_else(|| not_found(device_id))?;
        stored.states.push(DeviceState {
            update_time: Some(Utc::now().to_rfc3339()),
            binary_data: Some(encode_binary(data)),
        });
        Ok(())
    }
}

fn not_found(device_id: &str) -> DirectoryError {
    DirectoryError::Api {
        status: 404,
        message: format!("Device {device_id} not found"),
    }
}

#[async_trait]
impl DeviceDirectory for InMemoryDirectory {
    async fn create_device(
        &self,
        device_id: &str,
        public_key: PublicKeyCredential,
    ) -> Result<Device, DirectoryError> {
        let mut devices = self.devices.lock().await;
        if devices.contains_key(device_id) {
            return Err(DirectoryError::Api {
                status: 409,
                message: format!("Device {device_id} already exists"),
            });
        }

        let device = Device {
            id: device_id.to_string(),
            name: Some(format!("{}/devices/{device_id}", self.registry_path)),
            num_id: Some((devices.len() + 1).to_string()),
            credentials: vec![DeviceCredential {
                public_key,
                expiration_time: None,
            }],
            ..Default::default()
        };

        devices.insert(
            device_id.to_string(),
            StoredDevice {
                device: device.clone(),
                configs: vec![DeviceConfig {
                    version: "1".to_string(),
                    cloud_update_time: Some(Utc::now().to_rfc3339()),
                    ..Default::default()
                }],
                states: Vec::new(),
            },
        );
        Ok(device)
    }

    async fn get_device(&self, device_id: &str) -> Result<Device, DirectoryError> {
        self.devices
            .lock()
            .await
            .get(device_id)
            .map(|stored| stored.device.clone())
            .ok_or_else(|| not_found(device_id))
    }

    async fn list_devices(&self) -> Result<Vec<Device>, DirectoryError> {
        Ok(self
            .devices
            .lock()
            .await
            .values()
            .map(|stored| stored.device.clone())
            .collect())
    }

    async fn patch_device(
        &self,
        device_id: &str,
        patch: &Device,
        update_mask: &str,
    ) -> Result<Device, DirectoryError> {
        let mut devices = self.devices.lock().await;
        let stored = devices
            .get_mut(device_id)
            .ok_or_else(|| not_found(device_id))?;

        for field in update_mask.split(',').map(str::trim) {
            match field {
                "credentials" => stored.device.credentials = patch.credentials.clone(),
                "blocked" => stored.device.blocked = patch.blocked,
                "metadata" => stored.device.metadata = patch.metadata.clone(),
                other => {
                    return Err(DirectoryError::Api {
                        status: 400,
                        message: format!("Unsupported update mask field: {other}"),
                    })
                }
            }
        }

        Ok(stored.device.clone())
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), DirectoryError> {
        self.devices
            .lock()
            .await
            .remove(device_id)
            .map(|_| ())
            .ok_or_else(|| not_found(device_id))
    }

    async fn get_device_config_versions(
        &self,
        device_id: &str,
    ) -> Result<Vec<DeviceConfig>, DirectoryError> {
        let devices = self.devices.lock().await;
        let stored = devices.get(device_id).ok_or_else(|| not_found(device_id))?;
        // Newest first, as the service returns them
        Ok(stored.configs.iter().rev().cloned().collect())
    }

    async fn get_device_states(&self, device_id: &str) -> Result<Vec<DeviceState>, DirectoryError> {
        let devices = self.devices.lock().await;
        let stored = devices.get(device_id).ok_or_else(|| not_found(device_id))?;
        Ok(stored.states.iter().rev().cloned().collect())
    }

    async fn set_device_config(
        &self,
        device_id: &str,
        data: &[u8],
    ) -> Result<DeviceConfig, DirectoryError> {
        let mut devices = self.devices.lock().await;
        let stored = devices
            .get_mut(device_id)
            .ok_or_else(|| not_found(device_id))?;

        let config = DeviceConfig {
            version: (stored.configs.len() + 1).to_string(),
            cloud_update_time: Some(Utc::now().to_rfc3339()),
            device_ack_time: None,
            binary_data: Some(encode_binary(data)),
        };
        stored.configs.push(config.clone());
        Ok(config)
    }
}
