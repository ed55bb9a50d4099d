//! Patchbay Core
//!
//! Plugin liveness registry and transport-agnostic routing for the Patchbay
//! device hub:
//! - [`registry`]: who is registered, through which transport, and whether
//!   they are still alive
//! - [`monitor`]: the periodic heartbeat sweep
//! - [`router`]: inbound envelope handling and publish fan-out
//! - [`transport`]: the outbound capability every physical channel implements
//! - [`hub`]: one owned instance of all of the above

pub mod clock;
pub mod envelope;
pub mod error;
pub mod hub;
pub mod monitor;
pub mod plugin;
pub mod registry;
pub mod router;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use envelope::{Envelope, Message, Publish};
pub use error::{EnvelopeError, InboundError, RegistrationError, TransportError, TransportResult};
pub use hub::{Hub, HubHandle, HubSettings, InboundSender};
pub use monitor::{HeartbeatMonitor, MonitorEvent, MonitorHandle};
pub use plugin::{
    MethodDescriptor, ParameterDescriptor, PluginManifest, PluginRecord,
    PluginStatus, TransportAddress, TransportKind,
};
pub use registry::{KeepaliveTarget, PluginRegistry, RegistrySettings, RegistryStats, SweepOutcome};
pub use router::{PublishReport, RouteOutcome, Router};
pub use transport::{Delivery, Dispatcher, MemoryTransport, Transport};
