/*!
 * Configuration management for BlueLink.
 *
 * This module provides functionality to load and access the scan and GATT
 * settings that drive a connection controller.
 */
use std::path::Path;
use std::sync::Arc;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::GattUuid;

/// Serial-over-BLE service exposed by Makeblock-style robot boards
pub const SERIAL_SERVICE_UUID: GattUuid = GattUuid::from_u16(0xFFE1);
/// Read/notify characteristic of the serial service
pub const SERIAL_NOTIFY_CHARACTERISTIC_UUID: GattUuid = GattUuid::from_u16(0xFFE2);
/// Write characteristic of the serial service
pub const SERIAL_WRITE_CHARACTERISTIC_UUID: GattUuid = GattUuid::from_u16(0xFFE3);

/// Core configuration for BlueLink
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Scan configuration
    #[serde(default)]
    pub scan: ScanConfig,

    /// GATT handshake configuration
    #[serde(default)]
    pub gatt: GattConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Scan configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Advertised service UUIDs of interest; empty means unrestricted
    #[serde(default = "default_service_filters")]
    pub service_filters: Vec<GattUuid>,

    /// Stop an active scan when a connection attempt starts
    #[serde(default)]
    pub stop_on_connect: bool,

    /// Notify observers when only the signal strength of a known device changed
    #[serde(default)]
    pub notify_on_signal_update: bool,
}

/// A service that must be resolved before a connection counts as complete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredService {
    /// Service UUID
    pub service: GattUuid,

    /// Characteristics that must be present; empty accepts whatever is found
    #[serde(default)]
    pub characteristics: Vec<GattUuid>,
}

impl RequiredService {
    /// Create a new required service
    pub fn new(service: GattUuid, characteristics: Vec<GattUuid>) -> Self {
        Self {
            service,
            characteristics,
        }
    }
}

/// GATT handshake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GattConfig {
    /// Fail the whole attempt if any required service fails to resolve
    #[serde(default)]
    pub strict: bool,

    /// Services resolved after connecting; empty resolves everything discovered
    #[serde(default = "default_required_services")]
    pub required_services: Vec<RequiredService>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            service_filters: default_service_filters(),
            stop_on_connect: false,
            notify_on_signal_update: false,
        }
    }
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            strict: false,
            required_services: default_required_services(),
        }
    }
}

impl GattConfig {
    /// Service UUIDs to request during service discovery
    pub fn service_uuids(&self) -> Vec<GattUuid> {
        self.resolution_plan().into_iter().map(|s| s.service).collect()
    }

    /// Required services with repeated entries merged
    ///
    /// Keeps first-listed order; a service listed more than once requires the
    /// union of every entry's characteristics.
    pub fn resolution_plan(&self) -> Vec<RequiredService> {
        let mut plan: Vec<RequiredService> = Vec::with_capacity(self.required_services.len());
        for required in &self.required_services {
            match plan.iter_mut().find(|entry| entry.service == required.service) {
                Some(entry) => {
                    for characteristic in &required.characteristics {
                        if !entry.characteristics.contains(characteristic) {
                            entry.characteristics.push(*characteristic);
                        }
                    }
                }
                None => plan.push(required.clone()),
            }
        }
        plan
    }
}

impl Config {
    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_app_name() -> String {
    "bluelink".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_service_filters() -> Vec<GattUuid> {
    vec![SERIAL_SERVICE_UUID]
}

fn default_required_services() -> Vec<RequiredService> {
    vec![RequiredService::new(
        SERIAL_SERVICE_UUID,
        vec![
            SERIAL_NOTIFY_CHARACTERISTIC_UUID,
            SERIAL_WRITE_CHARACTERISTIC_UUID,
        ],
    )]
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            return Ok(config);
        }

        let default_config = Config::default();
        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!(
            service_filters = config.scan.service_filters.len(),
            required_services = config.gatt.required_services.len(),
            "Configuration loaded"
        );
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
