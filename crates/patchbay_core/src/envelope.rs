//! Inbound Envelopes
//!
//! Plugins speak loosely-typed JSON tagged by `type`. Transports turn each
//! message into an [`Envelope`] at their boundary, so malformed input never
//! reaches the router.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::EnvelopeError;
use crate::plugin::{PluginManifest, TransportAddress};

/// A plugin message, discriminated by its `type` tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// A plugin announcing itself
    Register(PluginManifest),

    /// Liveness signal
    Heartbeat { plugin_name: String },

    /// Data for one or more plugins
    Publish(Publish),

    /// Any other tag; ignored by the router
    #[serde(other)]
    Unknown,
}

/// Payload of a publish message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publish {
    /// Sending plugin, when it identifies itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_name: Option<String>,

    /// Target plugin names; a single string on the wire is a one-element list
    #[serde(rename = "to_plugin", alias = "targets", deserialize_with = "one_or_many")]
    pub targets: Vec<String>,

    #[serde(rename = "message", alias = "body", default)]
    pub body: Value,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(name) => vec![name],
        OneOrMany::Many(names) => names,
    })
}

/// A validated message plus the transport endpoint it arrived from
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: TransportAddress,
    pub message: Message,
}

impl Envelope {
    pub fn new(source: TransportAddress, message: Message) -> Self {
        Self { source, message }
    }

    pub fn register(source: TransportAddress, manifest: PluginManifest) -> Self {
        Self::new(source, Message::Register(manifest))
    }

    pub fn heartbeat(source: TransportAddress, plugin_name: impl Into<String>) -> Self {
        Self::new(
            source,
            Message::Heartbeat {
                plugin_name: plugin_name.into(),
            },
        )
    }

    pub fn publish(source: TransportAddress, targets: Vec<String>, body: Value) -> Self {
        Self::new(
            source,
            Message::Publish(Publish {
                plugin_name: None,
                targets,
                body,
            }),
        )
    }

    /// Parse raw bytes (one HTTP body or one serial line)
    pub fn parse(raw: &[u8], source: TransportAddress) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_slice(raw)?;
        Self::from_value(value, source)
    }

    /// Validate an already-decoded JSON value
    pub fn from_value(value: Value, source: TransportAddress) -> Result<Self, EnvelopeError> {
        let kind = match value.as_object() {
            None => return Err(EnvelopeError::NotAnObject),
            Some(obj) => match obj.get("type") {
                None => return Err(EnvelopeError::MissingKind),
                Some(kind) => kind.as_str().unwrap_or_default().to_string(),
            },
        };

        let message = serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed {
            kind,
            reason: e.to_string(),
        })?;

        Ok(Self { source, message })
    }

    /// Tag name, for logging
    pub fn kind(&self) -> &'static str {
        match &self.message {
            Message::Register(_) => "register",
            Message::Heartbeat { .. } => "heartbeat",
            Message::Publish(_) => "publish",
            Message::Unknown => "unknown",
        }
    }
}
