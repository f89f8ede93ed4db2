//! Pure connection configuration for the MQTT session
//!
//! Broker URL parsing, TLS client configuration, MQTT option construction and
//! topic construction. Nothing in here touches the network.

use crate::config::{MqttSection, TlsVersion};
use crate::identity::DeviceIdentity;
use crate::token::Credential;
use crate::transport::TransportError;
use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use std::io::BufReader;
use tracing::{debug, warn};
use url::Url;

/// The broker ignores the username; authentication is carried by the token
pub const USERNAME_SENTINEL: &str = "unused";

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Broker endpoint extracted from the configured URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtts://host:port` style broker URLs
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerAddress, TransportError> {
    let url =
        Url::parse(broker_url).map_err(|_| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;

    let tls = match url.scheme() {
        "mqtts" | "ssl" | "tls" => true,
        "mqtt" | "tcp" => false,
        _ => return Err(TransportError::InvalidBrokerUrl(broker_url.to_string())),
    };

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Protocol versions allowed by a TLS floor
pub fn allowed_protocol_versions(floor: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    match floor {
        TlsVersion::Tls12 => rustls::ALL_VERSIONS,
        TlsVersion::Tls13 => TLS13_ONLY,
    }
}

/// Build the rustls client configuration: platform roots plus an optional CA
/// bundle, restricted to the configured protocol floor
pub fn build_tls_config(config: &MqttSection) -> Result<ClientConfig, TransportError> {
    let mut root_store = RootCertStore::empty();

    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                root_store.add(cert).ok();
            }
        }
        Err(e) => warn!("Unable to load platform root certificates: {}", e),
    }

    if let Some(ca_path) = &config.ca_cert_path {
        let ca_file = std::fs::File::open(ca_path)
            .map_err(|e| TransportError::Tls(format!("Failed to open CA cert: {e}")))?;
        let mut reader = BufReader::new(ca_file);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
            .collect::<Result<_, _>>()
            .map_err(|e| TransportError::Tls(format!("Failed to parse CA cert: {e}")))?;
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| TransportError::Tls(e.to_string()))?;
        }
    }

    if root_store.is_empty() {
        return Err(TransportError::Tls(
            "no trusted root certificates available".to_string(),
        ));
    }

    debug!(
        roots = root_store.len(),
        floor = ?config.tls_min_version,
        "Built TLS client configuration"
    );

    Ok(
        ClientConfig::builder_with_protocol_versions(allowed_protocol_versions(
            config.tls_min_version,
        ))
        .with_root_certificates(root_store)
        .with_no_client_auth(),
    )
}

/// Build MQTT 3.1.1 options for one handshake attempt
///
/// The client id is the device's full resource path, the password is the
/// signed token and every session starts clean.
pub fn configure_mqtt_options(
    identity: &DeviceIdentity,
    config: &MqttSection,
    credential: &Credential,
) -> Result<MqttOptions, TransportError> {
    let broker = parse_broker_url(&config.broker_url)?;

    let mut mqtt_options = MqttOptions::new(identity.client_id(), broker.host, broker.port);
    mqtt_options.set_credentials(USERNAME_SENTINEL, credential.token());
    mqtt_options.set_clean_session(true);
    mqtt_options.set_keep_alive(config.keep_alive());

    if broker.tls {
        let tls_config = build_tls_config(config)?;
        mqtt_options.set_transport(RumqttcTransport::tls_with_config(tls_config.into()));
    }

    Ok(mqtt_options)
}

/// Topic construction for device messages
pub struct TopicBuilder;

impl TopicBuilder {
    /// `/devices/{device_id}/{suffix}`; the suffix is passed through verbatim
    pub fn device_topic(device_id: &str, suffix: &str) -> String {
        format!("/devices/{device_id}/{suffix}")
    }
}
