//! Hub
//!
//! Owns one registry per orchestrator instance and wires it to the router,
//! the heartbeat monitor and the transports:
//!
//! - a single worker drains the inbound queue in arrival order
//! - the monitor sweeps the registry on its own timer
//! - a forwarder turns the monitor's keepalive events into transport pings
//!
//! The hub can be built and driven without any transport having started.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::envelope::Envelope;
use crate::error::InboundError;
use crate::monitor::{HeartbeatMonitor, MonitorEvent, MonitorHandle, DEFAULT_SWEEP_INTERVAL};
use crate::registry::{PluginRegistry, RegistrySettings};
use crate::router::Router;
use crate::transport::Dispatcher;

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Runtime settings for a hub instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSettings {
    pub registry: RegistrySettings,
    /// Period of the heartbeat sweep
    pub sweep_interval: Duration,
    /// Whether healthy plugins get proactive keepalive pings
    pub keepalive: bool,
    /// Envelopes buffered before transports see back-pressure
    pub inbound_capacity: usize,
    /// Monitor events buffered per subscriber
    pub event_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            registry: RegistrySettings::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            keepalive: true,
            inbound_capacity: 1024,
            event_capacity: 256,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound Sender
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle transports use to feed envelopes to the hub
#[derive(Debug, Clone)]
pub struct InboundSender {
    tx: mpsc::Sender<Envelope>,
}

impl InboundSender {
    /// Queue an envelope, waiting for room if the queue is full
    pub async fn send(&self, envelope: Envelope) -> Result<(), InboundError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| InboundError::Closed)
    }

    /// Queue an envelope without waiting
    pub fn try_send(&self, envelope: Envelope) -> Result<(), InboundError> {
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => InboundError::Full,
            mpsc::error::TrySendError::Closed(_) => InboundError::Closed,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Hub
// ─────────────────────────────────────────────────────────────────────────────

/// A hub that has been built but not started
pub struct Hub {
    registry: Arc<PluginRegistry>,
    settings: HubSettings,
    inbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: mpsc::Receiver<Envelope>,
}

impl Hub {
    pub fn new(settings: HubSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: HubSettings, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(PluginRegistry::with_clock(clock, settings.registry));
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.inbound_capacity.max(1));

        Self {
            registry,
            settings,
            inbound_tx,
            inbound_rx,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Sender for transports; may be handed out before the hub starts
    pub fn inbound(&self) -> InboundSender {
        InboundSender {
            tx: self.inbound_tx.clone(),
        }
    }

    /// Start the worker, the monitor and the keepalive forwarder
    pub fn start(self, dispatcher: Dispatcher) -> HubHandle {
        let dispatcher = Arc::new(dispatcher);
        let router = Router::new(Arc::clone(&self.registry), Arc::clone(&dispatcher));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = HeartbeatMonitor::with_capacity(
            Arc::clone(&self.registry),
            self.settings.sweep_interval,
            self.settings.event_capacity,
        );
        let events = monitor.subscribe();

        let keepalive = self.settings.keepalive.then(|| {
            tokio::spawn(run_keepalive_forwarder(
                Arc::clone(&dispatcher),
                events,
                shutdown_rx.clone(),
            ))
        });

        let worker = tokio::spawn(run_inbound_worker(
            router.clone(),
            self.inbound_rx,
            shutdown_rx,
        ));

        let monitor = monitor.spawn();
        tracing::info!(
            "Hub started (sweep every {:?}, keepalive {})",
            self.settings.sweep_interval,
            if self.settings.keepalive { "on" } else { "off" }
        );

        HubHandle {
            registry: self.registry,
            router,
            inbound: InboundSender {
                tx: self.inbound_tx,
            },
            monitor,
            worker,
            keepalive,
            shutdown_tx,
        }
    }
}

/// Handle to a running hub
pub struct HubHandle {
    registry: Arc<PluginRegistry>,
    router: Router,
    inbound: InboundSender,
    monitor: MonitorHandle,
    worker: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl HubHandle {
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Router for sends that do not originate from a plugin
    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn inbound(&self) -> InboundSender {
        self.inbound.clone()
    }

    pub fn subscribe_monitor(&self) -> broadcast::Receiver<MonitorEvent> {
        self.monitor.subscribe()
    }

    /// Stop every hub task and wait for them to finish
    pub async fn shutdown(self) {
        tracing::info!("Shutting down hub");
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.worker.await {
            tracing::error!(error = ?e, "Inbound worker panicked");
        }
        if let Some(keepalive) = self.keepalive {
            if let Err(e) = keepalive.await {
                tracing::error!(error = ?e, "Keepalive forwarder panicked");
            }
        }
        self.monitor.stop().await;

        tracing::info!("Hub stopped");
    }
}

/// Process inbound envelopes one at a time, in arrival order
async fn run_inbound_worker(
    router: Router,
    mut inbound_rx: mpsc::Receiver<Envelope>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            envelope = inbound_rx.recv() => match envelope {
                Some(envelope) => {
                    router.route(envelope).await;
                }
                None => break,
            },
        }
    }
    tracing::debug!("Inbound worker stopped");
}

/// Ping every plugin the monitor reports as healthy
async fn run_keepalive_forwarder(
    dispatcher: Arc<Dispatcher>,
    mut events: broadcast::Receiver<MonitorEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            event = events.recv() => match event {
                Ok(MonitorEvent::Keepalive(target)) => {
                    if let Err(e) = dispatcher.keepalive(&target.address).await {
                        tracing::debug!("Keepalive to {} failed: {}", target.name, e);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Keepalive forwarder lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!("Keepalive forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::plugin::{PluginManifest, PluginStatus, TransportAddress, TransportKind};
    use crate::transport::MemoryTransport;
    use serde_json::json;

    fn settings(sweep: Duration) -> HubSettings {
        HubSettings {
            sweep_interval: sweep,
            ..HubSettings::default()
        }
    }

    /// Let the worker drain what is queued
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_envelopes_processed_in_order() {
        let http = MemoryTransport::new(TransportKind::Http);
        let hub = Hub::new(settings(Duration::from_secs(60)));
        let inbound = hub.inbound();
        let handle = hub.start(Dispatcher::new().with_transport(Arc::new(http.clone())));

        let source = TransportAddress::http("http://host:9");
        inbound
            .send(Envelope::register(source.clone(), PluginManifest::new("p1")))
            .await
            .unwrap();
        inbound
            .send(Envelope::heartbeat(source.clone(), "p1"))
            .await
            .unwrap();
        for i in 0..5 {
            inbound
                .send(Envelope::publish(source.clone(), vec!["p1".into()], json!({"seq": i})))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while http.deliveries().len() < 6 {
                settle().await;
            }
        })
        .await
        .expect("deliveries did not arrive");

        let payloads: Vec<_> = http.deliveries().into_iter().map(|d| d.payload).collect();
        assert_eq!(payloads[0], json!({"cmd": "registered"}));
        for i in 0..5 {
            assert_eq!(payloads[i + 1], json!({"seq": i}));
        }

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_forwarded_to_transport() {
        let clock = ManualClock::default();
        let serial = MemoryTransport::new(TransportKind::Serial);
        let hub = Hub::with_clock(settings(Duration::from_secs(1)), Arc::new(clock.clone()));
        hub.registry()
            .register(
                PluginManifest::new("lamp").with_heartbeat_interval(30_000),
                TransportAddress::serial("/dev/ttyUSB0"),
            )
            .unwrap();
        let handle = hub.start(Dispatcher::new().with_transport(Arc::new(serial.clone())));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        settle().await;

        assert_eq!(
            serial.keepalives(),
            vec![TransportAddress::serial("/dev/ttyUSB0")]
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_disabled() {
        let serial = MemoryTransport::new(TransportKind::Serial);
        let hub = Hub::new(HubSettings {
            keepalive: false,
            ..settings(Duration::from_secs(1))
        });
        hub.registry()
            .register(PluginManifest::new("lamp"), TransportAddress::serial("COM1"))
            .unwrap();
        let handle = hub.start(Dispatcher::new().with_transport(Arc::new(serial.clone())));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        settle().await;

        assert!(serial.keepalives().is_empty());
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_races_with_sweep() {
        let clock = ManualClock::default();
        let hub = Hub::with_clock(settings(Duration::from_secs(1)), Arc::new(clock.clone()));
        let inbound = hub.inbound();
        let source = TransportAddress::serial("/dev/ttyACM0");
        hub.registry()
            .register(PluginManifest::new("p1").with_heartbeat_interval(1000), source.clone())
            .unwrap();
        let handle = hub.start(Dispatcher::new());
        let mut events = handle.subscribe_monitor();

        // Two missed windows
        clock.advance_ms(1100);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        clock.advance_ms(1100);
        tokio::time::sleep(Duration::from_millis(1000)).await;

        inbound
            .send(Envelope::heartbeat(source.clone(), "p1"))
            .await
            .unwrap();
        settle().await;

        let record = handle.registry().get("p1").unwrap();
        assert_eq!(record.status, PluginStatus::Connected);
        assert_eq!(record.missed_heartbeats, 0);

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, MonitorEvent::Demoted { .. }));
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_inbound_closed_after_shutdown() {
        let hub = Hub::new(HubSettings::default());
        let handle = hub.start(Dispatcher::new());
        let inbound = handle.inbound();

        handle.shutdown().await;

        let envelope = Envelope::heartbeat(TransportAddress::serial("COM1"), "p1");
        assert_eq!(inbound.try_send(envelope.clone()), Err(InboundError::Closed));
        assert_eq!(inbound.send(envelope).await, Err(InboundError::Closed));
    }

    #[tokio::test]
    async fn test_full_queue_reported() {
        let hub = Hub::new(HubSettings {
            inbound_capacity: 1,
            ..HubSettings::default()
        });
        let inbound = hub.inbound();

        // Not started: nothing drains the single slot
        let envelope = Envelope::heartbeat(TransportAddress::serial("COM1"), "p1");
        assert_eq!(inbound.try_send(envelope.clone()), Ok(()));
        assert_eq!(inbound.try_send(envelope), Err(InboundError::Full));
    }
}
