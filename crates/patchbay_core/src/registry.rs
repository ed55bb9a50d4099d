//! Plugin Registry
//!
//! Owns the name → [`PluginRecord`] mapping and the liveness state machine.
//!
//! # Liveness
//!
//! A record becomes `Connected` on registration or heartbeat. Each sweep that
//! finds a record silent for longer than its declared interval counts one
//! missed heartbeat; reaching the miss threshold demotes it to
//! `Disconnected`. The next heartbeat or registration revives it.
//!
//! `touch` and `sweep` take the same per-shard write lock for a given name,
//! so a revival and a demotion of one plugin never interleave.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::{Clock, SystemClock};
use crate::error::RegistrationError;
use crate::plugin::{
    PluginManifest, PluginRecord, PluginStatus, TransportAddress, DEFAULT_HEARTBEAT_INTERVAL_MS,
};

/// Consecutive missed sweeps before a plugin is demoted
pub const DEFAULT_MISS_THRESHOLD: u32 = 3;

/// Tunables for liveness accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    /// Interval assumed for plugins that do not declare one
    pub default_heartbeat_interval_ms: u64,
    /// Missed sweeps before demotion
    pub miss_threshold: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            default_heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            miss_threshold: DEFAULT_MISS_THRESHOLD,
        }
    }
}

/// A healthy plugin the monitor may ping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveTarget {
    pub name: String,
    pub address: TransportAddress,
}

/// Result of one sweep over the registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Plugins demoted to `Disconnected` by this sweep
    pub demoted: Vec<String>,
    /// Plugins that missed this window but are still below the threshold
    pub lagging: Vec<(String, u32)>,
    /// Plugins heard from within their interval
    pub keepalive: Vec<KeepaliveTarget>,
}

/// Counts for status listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub connected: usize,
}

/// In-memory registry of plugins keyed by name
pub struct PluginRegistry {
    plugins: DashMap<String, PluginRecord>,
    clock: Arc<dyn Clock>,
    settings: RegistrySettings,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// Registry on the wall clock with default settings
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), RegistrySettings::default())
    }

    pub fn with_clock(clock: Arc<dyn Clock>, settings: RegistrySettings) -> Self {
        Self {
            plugins: DashMap::new(),
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Insert or overwrite a plugin record
    ///
    /// Last write wins: a second registration under the same name replaces the
    /// whole record, address included.
    pub fn register(
        &self,
        manifest: PluginManifest,
        address: TransportAddress,
    ) -> Result<PluginRecord, RegistrationError> {
        let name = manifest.plugin_name.trim().to_string();
        if name.is_empty() {
            return Err(RegistrationError::InvalidMetadata(
                "plugin name is empty".to_string(),
            ));
        }
        address.validate()?;

        let interval =
            manifest.effective_heartbeat_interval(self.settings.default_heartbeat_interval_ms);
        let manifest = PluginManifest {
            plugin_name: name.clone(),
            ..manifest
        };
        let record = PluginRecord::connected(manifest, address, interval, self.clock.now());

        match self.plugins.insert(name.clone(), record.clone()) {
            Some(previous) if previous.address != record.address => {
                tracing::info!(
                    "Plugin re-registered: {} v{} ({} -> {})",
                    name,
                    record.version,
                    previous.address,
                    record.address
                );
            }
            Some(_) => {
                tracing::info!("Plugin re-registered: {} v{}", name, record.version);
            }
            None => {
                tracing::info!(
                    "Plugin registered: {} v{} via {}",
                    name,
                    record.version,
                    record.address
                );
            }
        }

        Ok(record)
    }

    /// Record a heartbeat
    ///
    /// Returns `false` when no plugin of that name is registered.
    pub fn touch(&self, name: &str) -> bool {
        let Some(mut record) = self.plugins.get_mut(name) else {
            return false;
        };

        record.last_seen = self.clock.now();
        record.missed_heartbeats = 0;

        if record.status == PluginStatus::Disconnected {
            record.status = PluginStatus::Connected;
            tracing::info!("Plugin reconnected: {}", name);
        } else {
            tracing::debug!("Heartbeat from {}", name);
        }

        true
    }

    pub fn get(&self, name: &str) -> Option<PluginRecord> {
        self.plugins.get(name).map(|r| r.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Address of a plugin, but only while it is connected
    pub fn connected_address(&self, name: &str) -> Option<TransportAddress> {
        self.plugins
            .get(name)
            .filter(|r| r.status.is_connected())
            .map(|r| r.address.clone())
    }

    /// Snapshot of all records, sorted by name
    pub fn list(&self) -> Vec<PluginRecord> {
        let mut records: Vec<_> = self.plugins.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for record in self.plugins.iter() {
            stats.total += 1;
            if record.status.is_connected() {
                stats.connected += 1;
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Account for one heartbeat window across every plugin
    ///
    /// Only the heartbeat monitor should call this; calling it more often than
    /// the plugins' intervals inflates miss counts.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let threshold = self.settings.miss_threshold;

        for mut entry in self.plugins.iter_mut() {
            let record = entry.value_mut();
            if record.is_fresh(now) {
                outcome.keepalive.push(KeepaliveTarget {
                    name: record.name.clone(),
                    address: record.address.clone(),
                });
                continue;
            }

            record.missed_heartbeats = record.missed_heartbeats.saturating_add(1);

            if record.missed_heartbeats >= threshold {
                if record.status == PluginStatus::Connected {
                    record.status = PluginStatus::Disconnected;
                    outcome.demoted.push(record.name.clone());
                }
            } else {
                outcome
                    .lagging
                    .push((record.name.clone(), record.missed_heartbeats));
            }
        }

        outcome.demoted.sort();
        outcome.lagging.sort();
        outcome.keepalive.sort_by(|a, b| a.name.cmp(&b.name));
        outcome
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.len())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry() -> (PluginRegistry, ManualClock) {
        let clock = ManualClock::default();
        let registry =
            PluginRegistry::with_clock(Arc::new(clock.clone()), RegistrySettings::default());
        (registry, clock)
    }

    fn p1() -> PluginManifest {
        PluginManifest::new("p1")
            .with_version("1.0.0")
            .with_heartbeat_interval(1000)
    }

    #[test]
    fn test_register_then_get() {
        let registry = PluginRegistry::new();
        let before = Utc::now();

        registry
            .register(p1(), TransportAddress::http("http://host:9"))
            .unwrap();

        let record = registry.get("p1").unwrap();
        assert_eq!(record.status, PluginStatus::Connected);
        assert_eq!(record.missed_heartbeats, 0);
        assert!(record.last_seen >= before);
        assert!(registry.contains("p1"));
        assert!(!registry.contains("p2"));
    }

    #[test]
    fn test_register_rejects_invalid_metadata() {
        let (registry, _) = registry();

        let err = registry
            .register(PluginManifest::new(""), TransportAddress::serial("/dev/ttyUSB0"))
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidMetadata(_)));

        assert!(registry
            .register(PluginManifest::new("p1"), TransportAddress::http("nope"))
            .is_err());
        assert!(registry
            .register(PluginManifest::new("p1"), TransportAddress::serial(""))
            .is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregister_overwrites() {
        let (registry, _) = registry();

        registry
            .register(
                p1().with_capability("a").with_event("toggled"),
                TransportAddress::serial("/dev/ttyUSB0"),
            )
            .unwrap();
        assert!(registry.get("p1").unwrap().events.contains("toggled"));

        registry
            .register(p1(), TransportAddress::http("http://host:9"))
            .unwrap();

        assert_eq!(registry.len(), 1);
        let record = registry.get("p1").unwrap();
        assert_eq!(record.address, TransportAddress::http("http://host:9"));
        assert!(record.capabilities.is_empty());
        assert!(record.events.is_empty());
    }

    #[test]
    fn test_default_interval_applied() {
        let (registry, _) = registry();
        registry
            .register(PluginManifest::new("p"), TransportAddress::serial("COM3"))
            .unwrap();
        assert_eq!(
            registry.get("p").unwrap().heartbeat_interval_ms,
            DEFAULT_HEARTBEAT_INTERVAL_MS
        );
    }

    #[test]
    fn test_touch_unknown_plugin() {
        let (registry, _) = registry();
        assert!(!registry.touch("ghost"));
    }

    #[test]
    fn test_scenario_three_missed_sweeps_disconnect() {
        let (registry, clock) = registry();
        registry
            .register(p1(), TransportAddress::http("http://host:9"))
            .unwrap();

        clock.advance_ms(500);
        assert!(registry.touch("p1"));
        assert_eq!(registry.get("p1").unwrap().status, PluginStatus::Connected);

        clock.advance_ms(1100); // t = 1600
        let outcome = registry.sweep(clock.now());
        assert_eq!(outcome.lagging, vec![("p1".to_string(), 1)]);
        assert!(outcome.demoted.is_empty());

        clock.advance_ms(1100); // t = 2700
        let outcome = registry.sweep(clock.now());
        assert_eq!(outcome.lagging, vec![("p1".to_string(), 2)]);
        assert_eq!(registry.get("p1").unwrap().status, PluginStatus::Connected);

        clock.advance_ms(1100); // t = 3800
        let outcome = registry.sweep(clock.now());
        assert_eq!(outcome.demoted, vec!["p1".to_string()]);

        let record = registry.get("p1").unwrap();
        assert_eq!(record.status, PluginStatus::Disconnected);
        assert_eq!(record.missed_heartbeats, 3);

        // Stays down and is not reported again
        clock.advance_ms(1100);
        let outcome = registry.sweep(clock.now());
        assert!(outcome.demoted.is_empty());
        assert_eq!(registry.get("p1").unwrap().status, PluginStatus::Disconnected);
        assert_eq!(registry.connected_address("p1"), None);
    }

    #[test]
    fn test_interval_boundary_is_inclusive() {
        let (registry, clock) = registry();
        registry
            .register(p1(), TransportAddress::serial("/dev/ttyACM0"))
            .unwrap();

        clock.advance_ms(1000);
        let outcome = registry.sweep(clock.now());
        assert!(outcome.lagging.is_empty());
        assert_eq!(outcome.keepalive.len(), 1);

        clock.advance_ms(1);
        let outcome = registry.sweep(clock.now());
        assert_eq!(outcome.lagging, vec![("p1".to_string(), 1)]);
    }

    #[test]
    fn test_huge_declared_interval_stays_connected() {
        let (registry, clock) = registry();
        for (name, interval) in [("max", u64::MAX), ("edge", i64::MAX as u64 + 1)] {
            registry
                .register(
                    PluginManifest::new(name).with_heartbeat_interval(interval),
                    TransportAddress::serial("/dev/ttyUSB1"),
                )
                .unwrap();
        }

        for _ in 0..3 {
            clock.advance_ms(1);
            let outcome = registry.sweep(clock.now());
            assert!(outcome.lagging.is_empty());
            assert!(outcome.demoted.is_empty());
        }

        for name in ["max", "edge"] {
            let record = registry.get(name).unwrap();
            assert_eq!(record.status, PluginStatus::Connected);
            assert_eq!(record.missed_heartbeats, 0);
        }
    }

    #[test]
    fn test_jitter_tolerance() {
        let (registry, clock) = registry();
        registry
            .register(p1(), TransportAddress::serial("/dev/ttyACM0"))
            .unwrap();

        for _ in 0..2 {
            clock.advance_ms(1100);
            let outcome = registry.sweep(clock.now());
            assert!(outcome.demoted.is_empty());
        }
        assert_eq!(registry.get("p1").unwrap().missed_heartbeats, 2);

        assert!(registry.touch("p1"));
        let record = registry.get("p1").unwrap();
        assert_eq!(record.status, PluginStatus::Connected);
        assert_eq!(record.missed_heartbeats, 0);

        // The next window starts counting from zero again
        clock.advance_ms(1100);
        let outcome = registry.sweep(clock.now());
        assert_eq!(outcome.lagging, vec![("p1".to_string(), 1)]);
    }

    #[test]
    fn test_touch_revives_disconnected() {
        let (registry, clock) = registry();
        registry
            .register(p1(), TransportAddress::http("http://host:9"))
            .unwrap();

        for _ in 0..3 {
            clock.advance_ms(1100);
            registry.sweep(clock.now());
        }
        assert_eq!(registry.get("p1").unwrap().status, PluginStatus::Disconnected);

        assert!(registry.touch("p1"));
        let record = registry.get("p1").unwrap();
        assert_eq!(record.status, PluginStatus::Connected);
        assert_eq!(record.missed_heartbeats, 0);
        assert_eq!(record.last_seen, clock.now());
    }

    #[test]
    fn test_reregistration_revives_disconnected() {
        let (registry, clock) = registry();
        registry
            .register(p1(), TransportAddress::http("http://host:9"))
            .unwrap();
        for _ in 0..3 {
            clock.advance_ms(1100);
            registry.sweep(clock.now());
        }

        registry
            .register(p1(), TransportAddress::http("http://host:10"))
            .unwrap();
        assert_eq!(
            registry.connected_address("p1"),
            Some(TransportAddress::http("http://host:10"))
        );
    }

    #[test]
    fn test_healthy_plugins_listed_for_keepalive() {
        let (registry, clock) = registry();
        registry
            .register(p1(), TransportAddress::serial("/dev/ttyUSB0"))
            .unwrap();
        registry
            .register(
                PluginManifest::new("slow").with_heartbeat_interval(10_000),
                TransportAddress::http("http://slow:1"),
            )
            .unwrap();

        clock.advance_ms(1000); // exactly at p1's deadline: still healthy
        let outcome = registry.sweep(clock.now());

        let names: Vec<_> = outcome.keepalive.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["p1", "slow"]);
        assert!(outcome.lagging.is_empty());
        assert_eq!(registry.get("p1").unwrap().missed_heartbeats, 0);
    }

    #[test]
    fn test_stats_and_list() {
        let (registry, clock) = registry();
        registry
            .register(PluginManifest::new("b").with_heartbeat_interval(100), TransportAddress::serial("COM1"))
            .unwrap();
        registry
            .register(PluginManifest::new("a").with_heartbeat_interval(100_000), TransportAddress::serial("COM2"))
            .unwrap();

        for _ in 0..3 {
            clock.advance_ms(200);
            registry.sweep(clock.now());
        }

        assert_eq!(
            registry.stats(),
            RegistryStats {
                total: 2,
                connected: 1
            }
        );
        let names: Vec<_> = registry.list().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_concurrent_touch_and_sweep() {
        let clock = ManualClock::default();
        let registry = Arc::new(PluginRegistry::with_clock(
            Arc::new(clock.clone()),
            RegistrySettings::default(),
        ));
        registry
            .register(p1(), TransportAddress::serial("/dev/ttyUSB0"))
            .unwrap();

        let sweeper = {
            let registry = Arc::clone(&registry);
            let clock = clock.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    registry.sweep(clock.now());
                }
            })
        };
        for _ in 0..1000 {
            assert!(registry.touch("p1"));
        }
        sweeper.join().unwrap();

        // A final heartbeat always wins over whatever the sweeps did
        assert!(registry.touch("p1"));
        let record = registry.get("p1").unwrap();
        assert_eq!(record.status, PluginStatus::Connected);
        assert_eq!(record.missed_heartbeats, 0);
    }
}
