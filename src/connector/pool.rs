//! Per-identity connector cache
//!
//! One connector per full identity tuple. Two callers asking for the same
//! (project, region, registry, device) share a session; any difference in the
//! tuple yields a separate connector.

use super::DeviceConnector;
use crate::config::ConnectorConfig;
use crate::error::ConnectorResult;
use crate::identity::DeviceIdentity;
use crate::transport::mqtt::MqttSession;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

type ConnectorFactory<T> =
    Box<dyn Fn(&DeviceIdentity) -> ConnectorResult<DeviceConnector<T>> + Send + Sync>;

/// Cache of connectors keyed by [`DeviceIdentity`]
pub struct ConnectorPool<T: Transport = MqttSession> {
    connectors: Mutex<HashMap<DeviceIdentity, Arc<DeviceConnector<T>>>>,
    factory: ConnectorFactory<T>,
}

impl ConnectorPool<MqttSession> {
    /// Connectors built from `config`'s broker, key and retry settings
    pub fn from_config(config: ConnectorConfig) -> Self {
        Self::with_factory(move |identity| {
            DeviceConnector::for_identity(&config, identity.clone())
        })
    }
}

impl<T: Transport> ConnectorPool<T> {
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(&DeviceIdentity) -> ConnectorResult<DeviceConnector<T>> + Send + Sync + 'static,
    {
        Self {
            connectors: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// Return the connector for `identity`, building it on first use
    pub async fn get(&self, identity: &DeviceIdentity) -> ConnectorResult<Arc<DeviceConnector<T>>> {
        let mut connectors = self.connectors.lock().await;

        if let Some(connector) = connectors.get(identity) {
            return Ok(connector.clone());
        }

        let connector = Arc::new((self.factory)(identity)?);
        connectors.insert(identity.clone(), connector.clone());
        info!(identity = %identity, "Created device connector");
        Ok(connector)
    }

    pub async fn len(&self) -> usize {
        self.connectors.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connectors.lock().await.is_empty()
    }

    /// Drop the connector for `identity` after closing its session
    pub async fn remove(&self, identity: &DeviceIdentity, grace: Duration) -> bool {
        let removed = self.connectors.lock().await.remove(identity);
        match removed {
            Some(connector) => {
                connector.disconnect(grace).await;
                true
            }
            None => false,
        }
    }

    /// Close every cached session and empty the pool
    pub async fn shutdown(&self, grace: Duration) {
        let connectors: Vec<_> = self.connectors.lock().await.drain().collect();
        for (identity, connector) in connectors {
            connector.disconnect(grace).await;
            info!(identity = %identity, "Device connector shut down");
        }
    }
}
