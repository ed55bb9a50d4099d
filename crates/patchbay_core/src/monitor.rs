//! Heartbeat Monitor
//!
//! A single periodic timer that sweeps the registry. Findings are logged and
//! published as [`MonitorEvent`]s; transports that want to ping healthy
//! plugins subscribe to the `Keepalive` events instead of being called back
//! directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::registry::{KeepaliveTarget, PluginRegistry, SweepOutcome};

/// Default period between sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(20);

/// Something a sweep found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Plugin is healthy and may be pinged
    Keepalive(KeepaliveTarget),
    /// Plugin missed a window but is still connected
    Lagging { plugin: String, missed: u32 },
    /// Plugin was just marked disconnected
    Demoted { plugin: String },
}

/// Periodic staleness check over the registry
pub struct HeartbeatMonitor {
    registry: Arc<PluginRegistry>,
    sweep_interval: Duration,
    events: broadcast::Sender<MonitorEvent>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<PluginRegistry>, sweep_interval: Duration) -> Self {
        Self::with_capacity(registry, sweep_interval, 256)
    }

    /// Create a monitor whose event channel buffers `capacity` events
    pub fn with_capacity(
        registry: Arc<PluginRegistry>,
        sweep_interval: Duration,
        capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            registry,
            sweep_interval,
            events,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Receive events from every following sweep
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Run one sweep now
    pub fn tick(&self) -> SweepOutcome {
        let outcome = self.registry.sweep(self.registry.now());

        for (plugin, missed) in &outcome.lagging {
            tracing::info!("Plugin {} heartbeat late, missed {} time(s)", plugin, missed);
            self.emit(MonitorEvent::Lagging {
                plugin: plugin.clone(),
                missed: *missed,
            });
        }

        for plugin in &outcome.demoted {
            tracing::info!("Plugin disconnected: {}", plugin);
            self.emit(MonitorEvent::Demoted {
                plugin: plugin.clone(),
            });
        }

        for target in &outcome.keepalive {
            self.emit(MonitorEvent::Keepalive(target.clone()));
        }

        tracing::debug!(
            demoted = outcome.demoted.len(),
            lagging = outcome.lagging.len(),
            healthy = outcome.keepalive.len(),
            "Heartbeat sweep complete"
        );

        outcome
    }

    fn emit(&self, event: MonitorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Start the sweep timer
    ///
    /// The first sweep happens one full period after start. Dropping or
    /// stopping the returned handle ends the timer task.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let events = self.events.clone();
        let period = self.sweep_interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!("Heartbeat monitor started (every {:?})", period);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        self.tick();
                    }
                }
            }

            tracing::info!("Heartbeat monitor stopped");
        });

        MonitorHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            events,
        }
    }
}

/// Handle to a running sweep timer
pub struct MonitorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    events: broadcast::Sender<MonitorEvent>,
}

impl MonitorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    /// Stop the timer and wait for its task to finish
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                tracing::error!(error = ?e, "Heartbeat monitor task panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("running", &self.is_running())
            .finish()
    }
}
