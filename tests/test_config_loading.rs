//! Configuration loading and validation tests
//!
//! Tests focus on the observable outcome of loading a file: accepted values,
//! defaults, and the error reported for each kind of bad input.

use iot_device_connector::config::{BackoffKind, ConfigError, ConnectorConfig, TlsVersion};
use iot_device_connector::connector::{Backoff, RetryPolicy};
use iot_device_connector::token::KeyAlgorithm;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

const MINIMAL: &str = r#"
[device]
project_id = "acme-project"
region = "europe-west1"
registry_id = "sensors"
device_id = "thermostat-7"
private_key_path = "tests/fixtures/rsa_private.pem"
"#;

#[test]
fn test_config_loads_successfully_from_minimal_toml() {
    let temp_file = write_config(MINIMAL);

    let config = ConnectorConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.device.project_id, "acme-project");
    assert_eq!(config.device.key_algorithm, KeyAlgorithm::Rs256);
    assert_eq!(config.mqtt.broker_url, "mqtts://mqtt.googleapis.com:8883");
    assert_eq!(config.mqtt.tls_min_version, TlsVersion::Tls12);
    assert_eq!(config.telemetry.events_topic, "events");
    assert_eq!(config.telemetry.state_topic, "state");

    let identity = config.identity().unwrap();
    assert_eq!(
        identity.client_id(),
        "projects/acme-project/locations/europe-west1/registries/sensors/devices/thermostat-7"
    );
}

#[test]
fn test_config_loads_every_section() {
    let temp_file = write_config(
        r#"
[device]
project_id = "acme-project"
region = "us-central1"
registry_id = "sensors"
device_id = "gateway"
private_key_path = "/etc/iot/ec_private.pem"
public_key_path = "/etc/iot/ec_public.pem"
key_algorithm = "ES256"
token_ttl_minutes = 20

[mqtt]
broker_url = "mqtts://broker.example.com:443"
tls_min_version = "1.3"
ca_cert_path = "/etc/iot/roots.pem"
keep_alive_secs = 30
connect_timeout_secs = 10
publish_timeout_secs = 15
disconnect_grace_ms = 250

[retry]
max_attempts = 3
delay_ms = 100
backoff = "exponential"
max_delay_ms = 800
cooldown_secs = 120

[directory]
base_url = "http://localhost:9000"
access_token_env = "ACME_IOT_TOKEN"

[telemetry]
events_topic = "events/metrics"
state_topic = "state"
"#,
    );

    let config = ConnectorConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.device.key_algorithm, KeyAlgorithm::Es256);
    assert_eq!(config.device.token_ttl_minutes, 20);
    assert_eq!(config.mqtt.tls_min_version, TlsVersion::Tls13);
    assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(30));
    assert_eq!(config.mqtt.disconnect_grace(), Duration::from_millis(250));
    assert_eq!(config.retry.backoff, BackoffKind::Exponential);
    assert_eq!(config.directory.access_token_env, "ACME_IOT_TOKEN");
    assert_eq!(config.telemetry.events_topic, "events/metrics");

    let policy = RetryPolicy::from(&config.retry);
    assert_eq!(policy.max_attempts, 3);
    assert_eq!(policy.delay, Duration::from_millis(100));
    assert_eq!(
        policy.backoff,
        Backoff::Exponential {
            max: Duration::from_millis(800)
        }
    );
    assert_eq!(policy.cooldown, Some(Duration::from_secs(120)));
}

#[test]
fn test_config_missing_file_returns_file_read_error() {
    let result = ConnectorConfig::load_from_file(std::path::Path::new(
        "/nonexistent/iot-connector.toml",
    ));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_missing_device_section_is_a_parse_error() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    );

    let result = ConnectorConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_tls_below_1_2() {
    for floor in ["1.0", "1.1"] {
        let temp_file = write_config(&format!(
            "{MINIMAL}\n[mqtt]\nbroker_url = \"mqtts://localhost:8883\"\ntls_min_version = \"{floor}\"\n"
        ));

        let result = ConnectorConfig::load_from_file(temp_file.path());
        match result {
            Err(ConfigError::TomlParse(e)) => assert!(e.to_string().contains("1.2")),
            other => panic!("expected TLS floor rejection, got {other:?}"),
        }
    }
}

#[test]
fn test_config_rejects_identity_with_path_separator() {
    let content = MINIMAL.replace("thermostat-7", "floor/2");
    let temp_file = write_config(&content);

    let result = ConnectorConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidIdentity(_))));
}

#[test]
fn test_config_rejects_empty_identity_component() {
    let content = MINIMAL.replace("\"sensors\"", "\"\"");
    let result = ConnectorConfig::parse(&content);
    assert!(matches!(result, Err(ConfigError::InvalidIdentity(_))));
}

#[test]
fn test_config_rejects_token_ttl_above_one_day() {
    let content = format!("{MINIMAL}token_ttl_minutes = 1441\n");
    let result = ConnectorConfig::parse(&content);
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_unsupported_broker_scheme() {
    let content = format!("{MINIMAL}\n[mqtt]\nbroker_url = \"http://localhost:1883\"\n");
    let result = ConnectorConfig::parse(&content);
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_exponential_cap_below_delay() {
    let content = format!(
        "{MINIMAL}\n[retry]\ndelay_ms = 1000\nbackoff = \"exponential\"\nmax_delay_ms = 10\n"
    );
    let result = ConnectorConfig::parse(&content);
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_directory_access_token_read_from_environment() {
    let content = format!(
        "{MINIMAL}\n[directory]\naccess_token_env = \"IOT_CONNECTOR_TEST_TOKEN_PRESENT\"\n"
    );
    let config = ConnectorConfig::parse(&content).unwrap();

    std::env::set_var("IOT_CONNECTOR_TEST_TOKEN_PRESENT", "ya29.test-token");
    assert_eq!(config.directory_access_token().unwrap(), "ya29.test-token");
    std::env::remove_var("IOT_CONNECTOR_TEST_TOKEN_PRESENT");
}

#[test]
fn test_directory_access_token_missing_variable() {
    let content = format!(
        "{MINIMAL}\n[directory]\naccess_token_env = \"IOT_CONNECTOR_TEST_TOKEN_ABSENT\"\n"
    );
    let config = ConnectorConfig::parse(&content).unwrap();

    match config.directory_access_token() {
        Err(ConfigError::EnvVarNotFound(name)) => {
            assert_eq!(name, "IOT_CONNECTOR_TEST_TOKEN_ABSENT")
        }
        other => panic!("expected EnvVarNotFound, got {other:?}"),
    }
}

#[test]
fn test_config_round_trips_through_show_output() {
    let config = ConnectorConfig::parse(MINIMAL).unwrap();
    let rendered = toml::to_string_pretty(&config).unwrap();

    let reparsed = ConnectorConfig::parse(&rendered).unwrap();
    assert_eq!(reparsed.device.device_id, "thermostat-7");
    assert_eq!(reparsed.mqtt.tls_min_version, TlsVersion::Tls12);
}
