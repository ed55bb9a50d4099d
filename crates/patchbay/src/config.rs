//! Hub Configuration
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `PATCHBAY_*` environment variables (nested keys split on `__`, e.g.
//! `PATCHBAY_HTTP__PORT=8080`). CLI flags are applied on top by `main`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use patchbay_core::{HubSettings, RegistrySettings};

use crate::serial::ScanConfig;

/// File read when no `--config` is given, if it exists
pub const DEFAULT_CONFIG_FILE: &str = "patchbay.toml";

/// Errors while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub http: HttpConfig,
    pub serial: SerialConfig,
    pub heartbeat: HeartbeatConfig,
    pub hub: QueueConfig,
    pub logging: LogConfig,
}

/// Webhook listener and outbound HTTP delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Path appended to a plugin's base URL for outbound messages
    pub callback_path: String,
    pub request_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 3000,
            callback_path: "/webhook/orchestrator".to_string(),
            request_timeout_ms: 5000,
        }
    }
}

impl HttpConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Serial port discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub enabled: bool,
    /// Directory listed for candidate ports
    pub device_dir: PathBuf,
    pub scan_interval_ms: u64,
    /// Device name patterns to attach (wildcards allowed)
    pub include: Vec<String>,
    /// Device name patterns never attached, even if included
    pub exclude: Vec<String>,
    /// Line speed; ports are always 8 data bits, no parity, 1 stop bit
    pub baud_rate: u32,
    /// Outbound lines buffered per port
    pub write_queue: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device_dir: PathBuf::from("/dev"),
            scan_interval_ms: 10_000,
            include: vec![
                "ttyUSB*".to_string(),
                "ttyACM*".to_string(),
                "cu.usbserial*".to_string(),
                "cu.usbmodem*".to_string(),
            ],
            exclude: vec!["*Bluetooth*".to_string(), "ttyAMA*".to_string()],
            baud_rate: crate::serial::DEFAULT_BAUD_RATE,
            write_queue: 64,
        }
    }
}

impl SerialConfig {
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            device_dir: self.device_dir.clone(),
            interval: Duration::from_millis(self.scan_interval_ms),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
        }
    }
}

/// Liveness accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub sweep_interval_ms: u64,
    /// Interval assumed for plugins that do not declare one
    pub default_interval_ms: u64,
    pub miss_threshold: u32,
    /// Ping healthy plugins on transports that support it
    pub keepalive: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        let registry = RegistrySettings::default();
        Self {
            sweep_interval_ms: 20_000,
            default_interval_ms: registry.default_heartbeat_interval_ms,
            miss_threshold: registry.miss_threshold,
            keepalive: true,
        }
    }
}

/// Queue sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub inbound_capacity: usize,
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let settings = HubSettings::default();
        Self {
            inbound_capacity: settings.inbound_capacity,
            event_capacity: settings.event_capacity,
        }
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directives; `RUST_LOG` takes precedence
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "patchbay=info,patchbay_core=info".to_string(),
            json: false,
        }
    }
}

impl HubConfig {
    /// Provider stack for `path`, or for the default file when `None`
    pub fn figment(path: Option<&Path>) -> Figment {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Figment::from(Serialized::defaults(HubConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("PATCHBAY_").split("__"))
    }

    /// Load and validate configuration
    ///
    /// An explicitly given file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
        }
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: HubConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.sweep_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat.default_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.default_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.heartbeat.miss_threshold == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.miss_threshold must be greater than 0".to_string(),
            ));
        }
        if self.hub.inbound_capacity == 0 || self.hub.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "hub queue capacities must be greater than 0".to_string(),
            ));
        }
        if self.serial.enabled && self.serial.scan_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "serial.scan_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid(
                "serial.baud_rate must be greater than 0".to_string(),
            ));
        }
        if self.serial.write_queue == 0 {
            return Err(ConfigError::Invalid(
                "serial.write_queue must be greater than 0".to_string(),
            ));
        }
        if !self.http.callback_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "http.callback_path must start with '/': {}",
                self.http.callback_path
            )));
        }
        Ok(())
    }

    /// Settings for the core hub
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            registry: RegistrySettings {
                default_heartbeat_interval_ms: self.heartbeat.default_interval_ms,
                miss_threshold: self.heartbeat.miss_threshold,
            },
            sweep_interval: Duration::from_millis(self.heartbeat.sweep_interval_ms),
            keepalive: self.heartbeat.keepalive,
            inbound_capacity: self.hub.inbound_capacity,
            event_capacity: self.hub.event_capacity,
        }
    }
}
