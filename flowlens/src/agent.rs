//! Drives the two periodic cycles over the shared capture state.
//!
//! Discovery rebuilds the port registry and resubmits the allow-list;
//! the metrics cycle harvests flows, estimates and publishes. Both take the
//! capture lock for their kernel calls, so a harvest never runs concurrently
//! with an allow-list edit.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use arc_swap::ArcSwap;
use tokio::{
    sync::{Mutex, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    capture::{FlowCapture, PortDiff},
    discovery::Discovery,
    error::{Error, Result},
    estimator::{BootClock, FlowEstimator, SystemBootClock},
    publisher::StatsPublisher,
    registry::ServerRegistry,
};

/// Cadence of the two cycles.
#[derive(Clone, Copy, Debug)]
pub struct Schedule {
    pub discovery: Duration,
    pub metrics: Duration,
}

pub struct Agent<C, D, K = SystemBootClock> {
    capture: Mutex<C>,
    registry: ArcSwap<ServerRegistry>,
    estimator: FlowEstimator<K>,
    publisher: Arc<StatsPublisher>,
    discovery: D,
}

impl<C, D, K> Agent<C, D, K>
where
    C: FlowCapture,
    D: Discovery,
    K: BootClock,
{
    pub fn new(
        capture: C,
        discovery: D,
        estimator: FlowEstimator<K>,
        publisher: Arc<StatsPublisher>,
    ) -> Self {
        Self {
            capture: Mutex::new(capture),
            registry: ArcSwap::from_pointee(ServerRegistry::empty()),
            estimator,
            publisher,
            discovery,
        }
    }

    /// One discovery cycle: discover, swap in the new registry, then bring
    /// the allow-list in line with it.
    ///
    /// A discovery failure leaves the registry untouched. A sync failure
    /// happens after the swap; the next cycle resubmits the full set.
    pub async fn discovery_step(&self) -> Result<PortDiff> {
        let servers = self.discovery.discover().await?;

        let (registry, conflicts) = ServerRegistry::from_descriptors(&servers);
        for conflict in &conflicts {
            warn!(
                port = conflict.port,
                replaced = %conflict.replaced,
                kept = %conflict.kept,
                "port claimed by more than one server"
            );
        }
        if registry.is_empty() {
            debug!(descriptors = servers.len(), "no game servers registered");
        }
        let desired = registry.desired_ports();
        let servers_found = registry.len();
        self.registry.store(Arc::new(registry));

        let diff = self.capture.lock().await.sync_monitored_ports(&desired)?;
        if diff.is_empty() {
            debug!(servers = servers_found, "monitored ports unchanged");
        } else {
            info!(
                servers = servers_found,
                added = ?diff.added,
                removed = ?diff.removed,
                "monitored ports updated"
            );
        }
        Ok(diff)
    }

    /// One metrics cycle at wall-clock `now`. Returns the number of servers
    /// published.
    ///
    /// A harvest failure skips the cycle and leaves the previous stats in
    /// place. A clock failure publishes an empty set.
    pub async fn metrics_step(&self, now: SystemTime) -> Result<usize> {
        let flows = self.capture.lock().await.harvest()?;
        let registry = self.registry.load();

        let stats = match self.estimator.estimate(&flows, &registry, now) {
            Ok(estimation) => {
                let counts = estimation.counts;
                let config = self.estimator.config();
                debug!(
                    total = counts.total,
                    stale = counts.stale,
                    below_threshold = counts.below_threshold,
                    unregistered = counts.unregistered,
                    passed = counts.passed,
                    min_packets = config.min_packets,
                    min_bytes = config.min_bytes,
                    "flow filtering complete"
                );
                estimation.stats
            }
            Err(err @ Error::Clock(_)) => {
                warn!(error = %err, "publishing empty stats");
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        let published = stats.len();
        let players: usize = stats.iter().map(|s| s.active_players).sum();
        self.publisher.publish(stats);
        debug!(flows = flows.len(), servers = published, players, "stats published");
        Ok(published)
    }

    /// Runs an initial discovery, then both cycles until `shutdown` flips.
    pub async fn run(&self, schedule: Schedule, shutdown: watch::Receiver<bool>) {
        self.run_discovery().await;
        tokio::join!(
            self.discovery_loop(schedule.discovery, shutdown.clone()),
            self.metrics_loop(schedule.metrics, shutdown),
        );
    }

    /// Removes the classifier. Called once after `run` returns.
    pub async fn detach(&self) {
        self.capture.lock().await.detach();
    }

    async fn run_discovery(&self) {
        if let Err(err) = self.discovery_step().await {
            warn!(kind = err.kind(), error = %err, "discovery cycle failed");
        }
    }

    async fn discovery_loop(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = ticker(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_discovery().await,
                _ = stopped(&mut shutdown) => break,
            }
        }
        debug!("discovery loop stopped");
    }

    async fn metrics_loop(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = ticker(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.metrics_step(SystemTime::now()).await {
                        warn!(kind = err.kind(), error = %err, "metrics cycle skipped");
                    }
                }
                _ = stopped(&mut shutdown) => break,
            }
        }
        debug!("metrics loop stopped");
    }
}

// First tick one period from now; a slow cycle pushes the next one back
// instead of bursting.
fn ticker(period: Duration) -> time::Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
