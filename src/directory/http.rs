//! HTTP implementation of the device directory (Cloud IoT v1 REST API)

use super::{
    encode_binary, Device, DeviceConfig, DeviceCredential, DeviceDirectory, DeviceState,
    DirectoryError, PublicKeyCredential,
};
use crate::config::ConnectorConfig;
use crate::error::ConnectorResult;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDevicesResponse {
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListConfigVersionsResponse {
    #[serde(default)]
    device_configs: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListStatesResponse {
    #[serde(default)]
    device_states: Vec<DeviceState>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyConfigRequest {
    binary_data: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetails,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetails {
    message: String,
}

/// Directory client scoped to one registry
pub struct HttpDeviceDirectory {
    client: Client,
    base_url: String,
    registry_path: String,
    access_token: String,
}

impl HttpDeviceDirectory {
    /// Create a client for `registry_path`
    /// (`projects/{p}/locations/{r}/registries/{g}`)
    pub fn new(
        base_url: &str,
        registry_path: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DirectoryError> {
        let access_token = access_token.into();
        if access_token.trim().is_empty() {
            return Err(DirectoryError::Auth(
                "access token must not be empty".to_string(),
            ));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            registry_path: registry_path.into(),
            access_token,
        })
    }

    /// Build a client for the configured device's registry
    pub fn from_config(config: &ConnectorConfig) -> ConnectorResult<Self> {
        let identity = config.identity()?;
        let access_token = config.directory_access_token()?;

        Ok(Self::new(
            &config.directory.base_url,
            identity.registry_path(),
            access_token,
            Duration::from_secs(config.directory.timeout_secs),
        )?)
    }

    pub fn registry_path(&self) -> &str {
        &self.registry_path
    }

    fn devices_url(&self) -> String {
        format!("{}/v1/{}/devices", self.base_url, self.registry_path)
    }

    fn device_url(&self, device_id: &str) -> String {
        format!("{}/{}", self.devices_url(), device_id)
    }

    /// Send with bearer auth and decode the JSON body, mapping API failures
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, DirectoryError> {
        let response = request.bearer_auth(&self.access_token).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);

            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DirectoryError::Auth(message),
                _ => DirectoryError::Api {
                    status: status.as_u16(),
                    message,
                },
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl DeviceDirectory for HttpDeviceDirectory {
    async fn create_device(
        &self,
        device_id: &str,
        public_key: PublicKeyCredential,
    ) -> Result<Device, DirectoryError> {
        let body = Device {
            id: device_id.to_string(),
            credentials: vec![DeviceCredential {
                public_key,
                expiration_time: None,
            }],
            ..Default::default()
        };

        let device: Device = self
            .send(self.client.post(self.devices_url()).json(&body))
            .await?;
        debug!(device = %device.id, name = ?device.name, "Created device");
        Ok(device)
    }

    async fn get_device(&self, device_id: &str) -> Result<Device, DirectoryError> {
        self.send(self.client.get(self.device_url(device_id))).await
    }

    async fn list_devices(&self) -> Result<Vec<Device>, DirectoryError> {
        let mut devices = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.client.get(self.devices_url());
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let page: ListDevicesResponse = self.send(request).await?;
            devices.extend(page.devices);

            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(registry = %self.registry_path, count = devices.len(), "Listed devices");
        Ok(devices)
    }

    async fn patch_device(
        &self,
        device_id: &str,
        patch: &Device,
        update_mask: &str,
    ) -> Result<Device, DirectoryError> {
        let request = self
            .client
            .patch(self.device_url(device_id))
            .query(&[("updateMask", update_mask)])
            .json(patch);
        self.send(request).await
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), DirectoryError> {
        let _: IgnoredAny = self
            .send(self.client.delete(self.device_url(device_id)))
            .await?;
        debug!(device = %device_id, "Deleted device");
        Ok(())
    }

    async fn get_device_config_versions(
        &self,
        device_id: &str,
    ) -> Result<Vec<DeviceConfig>, DirectoryError> {
        let url = format!("{}/configVersions", self.device_url(device_id));
        let response: ListConfigVersionsResponse = self.send(self.client.get(url)).await?;
        Ok(response.device_configs)
    }

    async fn get_device_states(&self, device_id: &str) -> Result<Vec<DeviceState>, DirectoryError> {
        let url = format!("{}/states", self.device_url(device_id));
        let response: ListStatesResponse = self.send(self.client.get(url)).await?;
        Ok(response.device_states)
    }

    async fn set_device_config(
        &self,
        device_id: &str,
        data: &[u8],
    ) -> Result<DeviceConfig, DirectoryError> {
        let url = format!("{}:modifyCloudToDeviceConfig", self.device_url(device_id));
        let body = ModifyConfigRequest {
            binary_data: encode_binary(data),
        };

        let config: DeviceConfig = self.send(self.client.post(url).json(&body)).await?;
        debug!(device = %device_id, version = %config.version, "Device config updated");
        Ok(config)
    }
}
