//! iot-connector: command-line front end for the device connector
//!
//! Publishes telemetry as a device, prints signed device tokens and manages
//! devices in the directory.

use clap::{Parser, Subcommand, ValueEnum};
use iot_device_connector::config::ConnectorConfig;
use iot_device_connector::connector::{DeliveryGuarantee, DeviceConnector};
use iot_device_connector::directory::{
    Device, DeviceDirectory, HttpDeviceDirectory, PublicKeyCredential,
};
use iot_device_connector::observability::init_default_logging;
use iot_device_connector::token::{CredentialIssuer, TokenIssuer};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["iot-connector.toml", "config/iot-connector.toml"];

/// Cloud IoT device connector
#[derive(Parser)]
#[command(name = "iot-connector")]
#[command(about = "Publish device telemetry over MQTT and manage registered devices")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "IOT_CONNECTOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one or more messages as the configured device
    Publish {
        /// Message payload
        #[arg(long, conflicts_with = "payload_file")]
        payload: Option<String>,
        /// Read the payload from a file
        #[arg(long, value_name = "FILE")]
        payload_file: Option<PathBuf>,
        /// Target device (defaults to the configured device)
        #[arg(long)]
        device: Option<String>,
        /// Topic suffix under /devices/{device}/ (defaults to the events topic)
        #[arg(long)]
        topic: Option<String>,
        /// Publish to the state topic instead of the events topic
        #[arg(long, conflicts_with = "topic")]
        state: bool,
        #[arg(long, value_enum, default_value_t = GuaranteeArg::AtLeastOnce)]
        guarantee: GuaranteeArg,
        /// Number of messages to publish
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Pause between messages
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Print a freshly signed device token
    Token {
        /// Token lifetime in minutes (defaults to device.token_ttl_minutes)
        #[arg(long)]
        ttl_minutes: Option<u32>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Manage devices in the configured registry
    Device {
        #[command(subcommand)]
        command: DeviceCommands,
    },
}

#[derive(Subcommand)]
enum DeviceCommands {
    /// List every device of the registry
    List,
    /// Show one device
    Get { id: String },
    /// Register a device with a public key
    Create {
        id: String,
        /// PEM public key (defaults to device.public_key_path)
        #[arg(long, value_name = "FILE")]
        public_key: Option<PathBuf>,
    },
    /// Block or unblock a device
    Patch {
        id: String,
        #[arg(long)]
        blocked: bool,
    },
    /// Delete a device
    Delete { id: String },
    /// List configuration versions of a device
    Configs { id: String },
    /// List state reports of a device
    States { id: String },
    /// Push a new cloud-to-device configuration
    SetConfig { id: String, data: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum GuaranteeArg {
    AtMostOnce,
    AtLeastOnce,
}

impl From<GuaranteeArg> for DeliveryGuarantee {
    fn from(arg: GuaranteeArg) -> Self {
        match arg {
            GuaranteeArg::AtMostOnce => DeliveryGuarantee::AtMostOnce,
            GuaranteeArg::AtLeastOnce => DeliveryGuarantee::AtLeastOnce,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish {
            payload,
            payload_file,
            device,
            topic,
            state,
            guarantee,
            count,
            interval_ms,
        } => {
            let topic = match (topic, state) {
                (Some(topic), _) => topic,
                (None, true) => config.telemetry.state_topic.clone(),
                (None, false) => config.telemetry.events_topic.clone(),
            };
            match read_payload(payload, payload_file) {
                Ok(payload) => {
                    let plan = PublishPlan {
                        target: device.unwrap_or_else(|| config.device.device_id.clone()),
                        topic,
                        payload,
                        guarantee: guarantee.into(),
                        count,
                        interval: Duration::from_millis(interval_ms),
                    };
                    publish(&config, plan).await
                }
                Err(e) => Err(e),
            }
        }
        Commands::Token { ttl_minutes } => print_token(&config, ttl_minutes),
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Device { command } => handle_device_command(&config, command).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: Option<&PathBuf>,
) -> Result<ConnectorConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ConnectorConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ConnectorConfig::load_from_file(&path)?);
        }
    }

    Err(format!(
        "no configuration file found; pass -c/--config or create one of: {}",
        DEFAULT_CONFIG_PATHS.join(", ")
    )
    .into())
}

fn read_payload(
    payload: Option<String>,
    payload_file: Option<PathBuf>,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    match (payload, payload_file) {
        (Some(payload), _) => Ok(payload.into_bytes()),
        (None, Some(path)) => Ok(std::fs::read(path)?),
        (None, None) => Err("either --payload or --payload-file is required".into()),
    }
}

struct PublishPlan {
    target: String,
    topic: String,
    payload: Vec<u8>,
    guarantee: DeliveryGuarantee,
    count: u32,
    interval: Duration,
}

async fn publish(
    config: &ConnectorConfig,
    plan: PublishPlan,
) -> Result<(), Box<dyn std::error::Error>> {
    let connector = DeviceConnector::from_config(config)?;
    let grace = config.mqtt.disconnect_grace();

    let run = async {
        for sequence in 1..=plan.count {
            connector
                .publish_message(&plan.target, &plan.topic, plan.payload.clone(), plan.guarantee)
                .await?;
            info!(sequence, count = plan.count, topic = %plan.topic, "Message published");

            if sequence < plan.count {
                sleep(plan.interval).await;
            }
        }
        Ok::<(), iot_device_connector::ConnectorError>(())
    };

    let result = tokio::select! {
        result = run => result,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            Ok(())
        }
    };

    connector.disconnect(grace).await;
    Ok(result?)
}

fn print_token(
    config: &ConnectorConfig,
    ttl_minutes: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let identity = config.identity()?;
    let ttl = ttl_minutes.unwrap_or(config.device.token_ttl_minutes);
    let credential = TokenIssuer::new(config.key_material(), ttl).issue(&identity)?;

    info!(expires_at = %credential.expires_at(), "Issued device token");
    println!("{}", credential.token());
    Ok(())
}

fn handle_config_command(
    config: &ConnectorConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!(client_id = %config.identity()?.client_id(), "Configuration validation complete");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_device_command(
    config: &ConnectorConfig,
    command: DeviceCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    let directory = HttpDeviceDirectory::from_config(config)?;

    match command {
        DeviceCommands::List => print_json(&directory.list_devices().await?),
        DeviceCommands::Get { id } => print_json(&directory.get_device(&id).await?),
        DeviceCommands::Create { id, public_key } => {
            let path = public_key
                .or_else(|| config.device.public_key_path.clone())
                .ok_or("no public key given and device.public_key_path is not set")?;
            let credential = PublicKeyCredential::from_file(&path, config.device.key_algorithm)?;
            print_json(&directory.create_device(&id, credential).await?)
        }
        DeviceCommands::Patch { id, blocked } => {
            let patch = Device {
                blocked: Some(blocked),
                ..Default::default()
            };
            print_json(&directory.patch_device(&id, &patch, "blocked").await?)
        }
        DeviceCommands::Delete { id } => {
            directory.delete_device(&id).await?;
            info!(device = %id, "Device deleted");
            Ok(())
        }
        DeviceCommands::Configs { id } => {
            print_json(&directory.get_device_config_versions(&id).await?)
        }
        DeviceCommands::States { id } => print_json(&directory.get_device_states(&id).await?),
        DeviceCommands::SetConfig { id, data } => {
            print_json(&directory.set_device_config(&id, data.as_bytes()).await?)
        }
    }
}
