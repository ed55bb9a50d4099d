//! Plugin Data Model
//!
//! Declared capability surface of a plugin, its transport address, and the
//! liveness record the registry keeps for it.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::RegistrationError;

/// Heartbeat cadence assumed when a plugin does not declare one
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

// ─────────────────────────────────────────────────────────────────────────────
// Transport Address
// ─────────────────────────────────────────────────────────────────────────────

/// Physical channel a plugin is reachable through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Http => write!(f, "http"),
        }
    }
}

/// Where a plugin lives: which transport, and which endpoint on it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportAddress {
    /// Serial port path, e.g. `/dev/ttyUSB0`
    Serial { port: String },
    /// Callback base URL, e.g. `http://10.0.0.7:8080`
    Http { base_url: String },
}

impl TransportAddress {
    pub fn serial(port: impl Into<String>) -> Self {
        Self::Serial { port: port.into() }
    }

    pub fn http(base_url: impl Into<String>) -> Self {
        Self::Http {
            base_url: base_url.into(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            TransportAddress::Serial { .. } => TransportKind::Serial,
            TransportAddress::Http { .. } => TransportKind::Http,
        }
    }

    /// Check that the address can actually be dispatched to
    pub fn validate(&self) -> Result<(), RegistrationError> {
        match self {
            TransportAddress::Serial { port } => {
                if port.trim().is_empty() {
                    return Err(RegistrationError::InvalidMetadata(
                        "serial port path is empty".to_string(),
                    ));
                }
            }
            TransportAddress::Http { base_url } => {
                let url = url::Url::parse(base_url).map_err(|e| {
                    RegistrationError::InvalidMetadata(format!(
                        "invalid callback URL '{}': {}",
                        base_url, e
                    ))
                })?;
                if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                    return Err(RegistrationError::InvalidMetadata(format!(
                        "callback URL '{}' is not an http(s) URL",
                        base_url
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddress::Serial { port } => write!(f, "serial:{}", port),
            TransportAddress::Http { base_url } => write!(f, "{}", base_url),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability Surface
// ─────────────────────────────────────────────────────────────────────────────

/// A single parameter (or return value) of a plugin method
///
/// The hub only stores and serves these, so every field is optional and the
/// `type` is kept as whatever string the plugin sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParameterDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: String,
    pub description: String,
    pub required: bool,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParameterDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Box<ParameterDescriptor>>,
}

/// A method a plugin exposes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MethodDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_type: Option<ParameterDescriptor>,
}

/// Keep every method entry that parses; skip the rest
fn lenient_methods<'de, D>(deserializer: D) -> Result<Vec<MethodDescriptor>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(method) => Some(method),
            Err(e) => {
                tracing::warn!("Skipping unreadable method descriptor: {}", e);
                None
            }
        })
        .collect())
}

/// What a plugin announces about itself when it registers
///
/// Every field is defaulted so that an incomplete registration still parses
/// and is rejected by the registry with a proper [`RegistrationError`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default, alias = "name")]
    pub plugin_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default, deserialize_with = "lenient_methods")]
    pub methods: Vec<MethodDescriptor>,
    #[serde(default)]
    pub events: BTreeSet<String>,
    /// Expected heartbeat cadence in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
}

impl PluginManifest {
    pub fn new(plugin_name: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.events.insert(event.into());
        self
    }

    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval = Some(interval_ms);
        self
    }

    /// Declared interval, with an absent or zero value meaning "use the default"
    pub fn effective_heartbeat_interval(&self, default_ms: u64) -> u64 {
        match self.heartbeat_interval {
            Some(ms) if ms > 0 => ms,
            _ => default_ms,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Plugin Record
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness state of a registered plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Connected,
    Disconnected,
}

impl PluginStatus {
    pub fn is_connected(&self) -> bool {
        *self == PluginStatus::Connected
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStatus::Connected => write!(f, "connected"),
            PluginStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Everything the hub knows about one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub name: String,
    pub version: String,
    pub capabilities: BTreeSet<String>,
    pub methods: Vec<MethodDescriptor>,
    pub events: BTreeSet<String>,
    pub address: TransportAddress,
    pub heartbeat_interval_ms: u64,
    pub status: PluginStatus,
    pub last_seen: DateTime<Utc>,
    pub missed_heartbeats: u32,
}

impl PluginRecord {
    /// Build a freshly connected record from a registration
    pub fn connected(
        manifest: PluginManifest,
        address: TransportAddress,
        heartbeat_interval_ms: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: manifest.plugin_name,
            version: manifest.version,
            capabilities: manifest.capabilities,
            methods: manifest.methods,
            events: manifest.events,
            address,
            heartbeat_interval_ms,
            status: PluginStatus::Connected,
            last_seen: now,
            missed_heartbeats: 0,
        }
    }

    /// Milliseconds since the plugin was last heard from, negative if `now`
    /// predates the last contact
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.last_seen).num_milliseconds()
    }

    /// Whether the last contact is within one heartbeat interval of `now`
    ///
    /// A `last_seen` later than `now` counts as fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let elapsed = self.elapsed_ms(now);
        elapsed < 0 || elapsed.unsigned_abs() <= self.heartbeat_interval_ms
    }
}
