//! Envelope Router
//!
//! Control messages (register, heartbeat) go to the registry; publish
//! messages are resolved against the registry and handed to the dispatcher.
//! The router holds no state of its own and never fails: every problem is
//! logged and reported in the [`RouteOutcome`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::envelope::{Envelope, Message, Publish};
use crate::error::RegistrationError;
use crate::plugin::{PluginManifest, TransportAddress};
use crate::registry::PluginRegistry;
use crate::transport::Dispatcher;

/// Reply sent to a plugin after a successful registration
pub fn registered_payload() -> Value {
    json!({ "cmd": "registered" })
}

/// Per-target result of a publish
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    /// Targets the payload was queued for
    pub delivered: Vec<String>,
    /// Targets that are unknown or disconnected
    pub unreachable: Vec<String>,
    /// Targets whose transport refused the payload
    pub failed: Vec<String>,
}

/// What the router did with an envelope
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Registered {
        plugin: String,
        reply: PublishReport,
    },
    RegistrationRejected(RegistrationError),
    HeartbeatAccepted {
        plugin: String,
    },
    UnknownHeartbeat {
        plugin: String,
    },
    Published(PublishReport),
    Ignored,
}

/// Stateless dispatcher of inbound envelopes
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<PluginRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl Router {
    pub fn new(registry: Arc<PluginRegistry>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Handle one inbound envelope
    pub async fn route(&self, envelope: Envelope) -> RouteOutcome {
        tracing::debug!("Routing {} envelope from {}", envelope.kind(), envelope.source);

        match envelope.message {
            Message::Register(manifest) => self.handle_register(manifest, envelope.source).await,
            Message::Heartbeat { plugin_name } => self.handle_heartbeat(plugin_name),
            Message::Publish(publish) => self.handle_publish(publish).await,
            Message::Unknown => RouteOutcome::Ignored,
        }
    }

    async fn handle_register(
        &self,
        manifest: PluginManifest,
        source: TransportAddress,
    ) -> RouteOutcome {
        let attempted = manifest.plugin_name.clone();

        match self.registry.register(manifest, source) {
            Ok(record) => {
                let reply = self
                    .publish(std::slice::from_ref(&record.name), &registered_payload())
                    .await;
                RouteOutcome::Registered {
                    plugin: record.name,
                    reply,
                }
            }
            Err(e) => {
                tracing::warn!("Plugin registration failed ({:?}): {}", attempted, e);
                RouteOutcome::RegistrationRejected(e)
            }
        }
    }

    fn handle_heartbeat(&self, plugin_name: String) -> RouteOutcome {
        if self.registry.touch(&plugin_name) {
            RouteOutcome::HeartbeatAccepted {
                plugin: plugin_name,
            }
        } else {
            tracing::warn!("Heartbeat from unknown plugin: {}", plugin_name);
            RouteOutcome::UnknownHeartbeat {
                plugin: plugin_name,
            }
        }
    }

    async fn handle_publish(&self, publish: Publish) -> RouteOutcome {
        if let Some(sender) = &publish.plugin_name {
            tracing::debug!("Publish from {} to {:?}", sender, publish.targets);
        }
        RouteOutcome::Published(self.publish(&publish.targets, &publish.body).await)
    }

    /// Send `body` to every connected plugin in `targets`
    ///
    /// Unknown and disconnected targets are skipped; the rest are still
    /// attempted.
    pub async fn publish(&self, targets: &[String], body: &Value) -> PublishReport {
        let mut report = PublishReport::default();

        for target in targets {
            let Some(address) = self.registry.connected_address(target) else {
                if self.registry.contains(target) {
                    tracing::warn!("Target unreachable (disconnected): {}", target);
                } else {
                    tracing::warn!("Target unreachable (not registered): {}", target);
                }
                report.unreachable.push(target.clone());
                continue;
            };

            match self.dispatcher.deliver(&address, body.clone()).await {
                Ok(()) => {
                    tracing::debug!("Queued message for {} via {}", target, address);
                    report.delivered.push(target.clone());
                }
                Err(e) => {
                    tracing::warn!("Delivery to {} via {} failed: {}", target, address, e);
                    report.failed.push(target.clone());
                }
            }
        }

        report
    }
}
