//! Periodic liveness probing and TTL expiry.
//!
//! Probe failures are expected signal driving the status machine, never
//! errors.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use log::debug;
use tokio::{net::TcpStream, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::registry::{DeviceEntry, DeviceRegistry};

/// Sweep timing. Defaults match production; tests shrink them.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Gap between sweeps.
    pub interval: Duration,
    /// Per-device TCP connect budget.
    pub probe_timeout: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

/// Runs the probe/expiry sweep until cancelled.
pub fn spawn_sweeper(
    registry: Arc<DeviceRegistry>,
    config: SweepConfig,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = interval.tick() => run_sweep(&registry, config.probe_timeout).await,
            }
        }
    })
}

/// One sweep: drop expired entries, then probe the remainder concurrently.
pub async fn run_sweep(registry: &DeviceRegistry, probe_timeout: Duration) {
    let now = Utc::now();
    registry.expire_before(now).await;

    let entries = registry.list(None, None).await;
    let probes = entries.iter().map(|entry| async move {
        let online = probe_entry(entry, probe_timeout).await;
        (entry.id.clone(), online)
    });

    for (id, online) in join_all(probes).await {
        registry.record_probe(&id, online, Utc::now()).await;
    }
}

/// A device is alive if its first advertised address accepts a TCP connect
/// within the budget.
async fn probe_entry(entry: &DeviceEntry, probe_timeout: Duration) -> bool {
    let Some(address) = entry.addresses.first() else {
        return false;
    };
    let target = SocketAddr::new(IpAddr::V4(*address), entry.port);
    match tokio::time::timeout(probe_timeout, TcpStream::connect(target)).await {
        Ok(Ok(_)) => {
            debug!("Probe of {} at {} succeeded", entry.id, target);
            true
        }
        Ok(Err(e)) => {
            debug!("Probe of {} at {} failed: {}", entry.id, target, e);
            false
        }
        Err(_) => {
            debug!("Probe of {} at {} timed out", entry.id, target);
            false
        }
    }
}
