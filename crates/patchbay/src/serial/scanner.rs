//! Serial port discovery
//!
//! Lists a device directory and keeps the names that look like attached
//! hardware, skipping system consoles and Bluetooth pseudo-ports.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use wildmatch::WildMatch;

use super::SerialTransport;

/// What to scan and how often
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    pub device_dir: PathBuf,
    pub interval: Duration,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Compiled include/exclude patterns
#[derive(Debug, Clone)]
pub struct PortFilter {
    include: Vec<WildMatch>,
    exclude: Vec<WildMatch>,
}

impl PortFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        Self {
            include: include.iter().map(|p| WildMatch::new(p)).collect(),
            exclude: exclude.iter().map(|p| WildMatch::new(p)).collect(),
        }
    }

    /// Whether a device file name should be attached
    pub fn accepts(&self, name: &str) -> bool {
        self.include.iter().any(|p| p.matches(name)) && !self.exclude.iter().any(|p| p.matches(name))
    }
}

/// Candidate port paths in `config.device_dir`, sorted
pub async fn list_candidate_ports(config: &ScanConfig) -> io::Result<Vec<PathBuf>> {
    let filter = PortFilter::new(&config.include, &config.exclude);
    let mut entries = tokio::fs::read_dir(&config.device_dir).await?;
    let mut ports = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if filter.accepts(name) {
            ports.push(entry.path());
        }
    }

    ports.sort();
    Ok(ports)
}

/// Periodically attach new ports and detach the ones that disappeared
pub fn spawn_scanner(
    transport: SerialTransport,
    config: ScanConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut opened: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();

        tracing::info!(
            "Scanning {} for serial ports every {:?} ({} baud, 8N1)",
            config.device_dir.display(),
            config.interval,
            transport.baud_rate()
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = interval.tick() => {
                    scan_once(&transport, &config, &mut opened, &mut failed).await;
                }
            }
        }
        tracing::debug!("Serial scanner stopped");
    })
}

async fn scan_once(
    transport: &SerialTransport,
    config: &ScanConfig,
    opened: &mut HashSet<String>,
    failed: &mut HashSet<String>,
) {
    let present: HashSet<String> = match list_candidate_ports(config).await {
        Ok(ports) => ports.iter().map(|p| p.display().to_string()).collect(),
        Err(e) => {
            tracing::warn!("Cannot list {}: {}", config.device_dir.display(), e);
            return;
        }
    };

    opened.retain(|port| {
        if present.contains(port) {
            return true;
        }
        transport.detach(port);
        false
    });
    failed.retain(|port| present.contains(port));

    let mut candidates: Vec<_> = present.iter().collect();
    candidates.sort();
    for port in candidates {
        if transport.is_attached(port) {
            continue;
        }
        match transport.open(std::path::Path::new(port)) {
            Ok(()) => {
                opened.insert(port.clone());
                failed.remove(port);
            }
            Err(e) => {
                // Only the first failure per device is worth a warning
                if failed.insert(port.clone()) {
                    tracing::warn!("Failed to open {}: {}", port, e);
                } else {
                    tracing::debug!("Still cannot open {}: {}", port, e);
                }
            }
        }
    }
}
