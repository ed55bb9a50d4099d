//! Error types for the hub core.

use crate::plugin::TransportKind;

/// Errors returned when a registration is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("Invalid plugin metadata: {0}")]
    InvalidMetadata(String),
}

/// Errors raised while validating an inbound message at the transport boundary.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Message has no 'type' tag")]
    MissingKind,

    #[error("Malformed '{kind}' message: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Errors a transport reports for an outbound send.
///
/// These only describe local queuing failures; what happens on the wire after
/// a successful `deliver` is the transport's own concern.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("No {0} transport available")]
    Unavailable(TransportKind),

    #[error("Address {0} is not handled by this transport")]
    WrongAddress(String),

    #[error("Port not connected: {0}")]
    NotConnected(String),

    #[error("Failed to encode payload: {0}")]
    Encode(String),

    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors returned when handing an envelope to the hub.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InboundError {
    #[error("Inbound queue is full")]
    Full,

    #[error("Hub is not running")]
    Closed,
}
