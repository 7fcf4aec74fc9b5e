use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/opt/midea2mqtt/midea2mqtt.yml";
const CONFIG_PATH_VAR: &str = "MIDEA2MQTT_CONFIG";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Poll interval in seconds.
    #[serde(default = "default_pollrate")]
    pub pollrate: u64,
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    /// Device driver backing the appliances. There is no implicit default.
    #[serde(default)]
    pub driver: Option<DriverKind>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            pollrate: default_pollrate(),
            loglevel: default_loglevel(),
            driver: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Simulated in-process appliances, for dry runs without hardware.
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default)]
    pub broker: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_clientid")]
    pub clientid: String,
    #[serde(default = "default_basetopic")]
    pub basetopic: String,
}

/// A raw `devices` entry. Fields stay optional here so that one incomplete
/// entry can be skipped instead of rejecting the whole file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeviceEntry {
    pub topic: Option<String>,
    pub address: Option<String>,
    pub token: Option<String>,
    pub key: Option<String>,
}

/// A complete device entry, as consumed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplianceConfig {
    pub topic: String,
    pub address: String,
    pub token: String,
    pub key: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unable to parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Configuration value {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

fn default_pollrate() -> u64 {
    60
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_clientid() -> String {
    "midea2mqtt".to_string()
}

fn default_basetopic() -> String {
    "midea".to_string()
}

impl DeviceEntry {
    /// Returns the entry as an `ApplianceConfig` when all four fields are non-empty.
    pub fn to_appliance_config(&self) -> Option<ApplianceConfig> {
        let field = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Some(ApplianceConfig {
            topic: field(&self.topic)?,
            address: field(&self.address)?,
            token: field(&self.token)?,
            key: field(&self.key)?,
        })
    }
}

impl Config {
    /// Resolve the configuration file path from the environment (a `.env` file is honoured).
    pub fn path_from_env() -> PathBuf {
        dotenv().ok();
        env::var(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the broker section, the poll rate and the device list.
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_POLLRATE: u64 = 1;
        const MAX_POLLRATE: u64 = 86_400;

        if self.mqtt.broker.trim().is_empty() {
            return Err(ConfigError::MissingOrInvalid("mqtt.broker".to_string()));
        }

        if !(MIN_POLLRATE..=MAX_POLLRATE).contains(&self.general.pollrate) {
            return Err(ConfigError::ParsingError(format!(
                "general.pollrate must be between {} and {} seconds",
                MIN_POLLRATE, MAX_POLLRATE
            )));
        }

        // Silent here: logging is not up yet, `appliances` reports skipped entries later.
        if !self
            .devices
            .iter()
            .any(|entry| entry.to_appliance_config().is_some())
        {
            return Err(ConfigError::MissingOrInvalid("devices".to_string()));
        }

        Ok(())
    }

    /// Complete device entries in file order; incomplete ones are logged and skipped.
    pub fn appliances(&self) -> Vec<ApplianceConfig> {
        self.devices
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let appliance = entry.to_appliance_config();
                if appliance.is_none() {
                    warn!(
                        "Skipping devices[{}]: topic, address, token and key are all required",
                        index
                    );
                }
                appliance
            })
            .collect()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.general.pollrate)
    }

    pub fn log_level(&self) -> tracing::Level {
        self.general
            .loglevel
            .parse()
            .unwrap_or(tracing::Level::INFO)
    }
}
