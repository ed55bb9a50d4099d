//! Transport Abstraction
//!
//! The hub never talks to a serial port or an HTTP client directly. Each
//! physical channel implements [`Transport`], and the [`Dispatcher`] picks the
//! implementation from the address kind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{TransportError, TransportResult};
use crate::plugin::{TransportAddress, TransportKind};

/// Payload of the proactive keepalive ping
pub fn keepalive_payload() -> Value {
    json!({ "cmd": "heartbeat" })
}

/// Outbound side of a physical channel
///
/// `deliver` must return as soon as the payload is queued locally. Failures on
/// the wire are the transport's to log; they are never reported back.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Which address kind this transport serves
    fn kind(&self) -> TransportKind;

    /// Queue `payload` for the plugin at `address`
    async fn deliver(&self, address: &TransportAddress, payload: Value) -> TransportResult<()>;

    /// Proactively ping a healthy plugin
    ///
    /// The default does nothing; channels without bidirectional liveness
    /// confirmation override it.
    async fn keepalive(&self, _address: &TransportAddress) -> TransportResult<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Routes outbound sends to the transport matching the address kind
#[derive(Clone, Default)]
pub struct Dispatcher {
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transport, replacing any previous one of the same kind
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.insert(transport);
        self
    }

    pub fn insert(&mut self, transport: Arc<dyn Transport>) {
        let kind = transport.kind();
        if self.transports.insert(kind, transport).is_some() {
            tracing::warn!("Replaced existing {} transport", kind);
        }
    }

    pub fn has(&self, kind: TransportKind) -> bool {
        self.transports.contains_key(&kind)
    }

    fn select(&self, address: &TransportAddress) -> TransportResult<&Arc<dyn Transport>> {
        let kind = address.kind();
        self.transports
            .get(&kind)
            .ok_or(TransportError::Unavailable(kind))
    }

    pub async fn deliver(&self, address: &TransportAddress, payload: Value) -> TransportResult<()> {
        self.select(address)?.deliver(address, payload).await
    }

    pub async fn keepalive(&self, address: &TransportAddress) -> TransportResult<()> {
        self.select(address)?.keepalive(address).await
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.transports.keys().map(|k| k.to_string()).collect();
        kinds.sort();
        f.debug_struct("Dispatcher").field("transports", &kinds).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory transport
// ─────────────────────────────────────────────────────────────────────────────

/// One recorded outbound send
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub address: TransportAddress,
    pub payload: Value,
}

/// Transport that records every send instead of doing I/O
///
/// Useful wherever the hub runs without hardware: tests, dry runs, demos.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    kind: TransportKind,
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    keepalives: Arc<Mutex<Vec<TransportAddress>>>,
    fail_with: Arc<Mutex<Option<TransportError>>>,
}

impl MemoryTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            deliveries: Arc::default(),
            keepalives: Arc::default(),
            fail_with: Arc::default(),
        }
    }

    /// Make every following send fail with `error`, or succeed again with `None`
    pub fn fail_with(&self, error: Option<TransportError>) {
        *self.fail_with.lock() = error;
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn keepalives(&self) -> Vec<TransportAddress> {
        self.keepalives.lock().clone()
    }

    pub fn clear(&self) {
        self.deliveries.lock().clear();
        self.keepalives.lock().clear();
    }

    fn check(&self, address: &TransportAddress) -> TransportResult<()> {
        if address.kind() != self.kind {
            return Err(TransportError::WrongAddress(address.to_string()));
        }
        match self.fail_with.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn deliver(&self, address: &TransportAddress, payload: Value) -> TransportResult<()> {
        self.check(address)?;
        self.deliveries.lock().push(Delivery {
            address: address.clone(),
            payload,
        });
        Ok(())
    }

    async fn keepalive(&self, address: &TransportAddress) -> TransportResult<()> {
        self.check(address)?;
        self.keepalives.lock().push(address.clone());
        Ok(())
    }
}
