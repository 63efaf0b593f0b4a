//! Agent Configuration
//!
//! Layered: built-in defaults, then an optional file, then
//! `TELEMETRY_AGENT__SECTION__KEY` environment variables.

use crate::AgentError;
use cloud_sync::{NetworkConfig, UploadConfig};
use config::{Config, Environment, File};
use obd_driver::DriverConfig;
use obd_protocol::transport::{SerialSettings, SimulatorConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use storage::StorageConfig;

pub const ENV_PREFIX: &str = "TELEMETRY_AGENT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Vehicle uploads are attributed to until rebound over the API
    pub vehicle_id: Option<String>,
    pub driver: DriverConfig,
    pub serial: SerialSettings,
    pub upload: UploadConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub simulator: SimulatorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub metrics_enabled: bool,
    /// Reconnect to the last used adapter on startup
    pub auto_reconnect: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            metrics_enabled: true,
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Emulated adapter offered as a notify-style device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSection {
    pub enabled: bool,
    pub vehicle: SimulatorConfig,
}

impl AgentConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, AgentError> {
        let mut builder = Config::builder().add_source(Config::try_from(&AgentConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
