//! Turns a harvested flow snapshot into per-server player estimates.
//!
//! Counters in the kernel table are cumulative and never reset, so activity
//! is judged by recency (`last_seen_ns` inside the window) plus minimum
//! packet/byte thresholds rather than by deltas between harvests.

use std::{
    collections::HashMap,
    net::Ipv4Addr,
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::{
    error::{Error, Result},
    model::{FlowSnapshot, ServerPlayerStats},
    registry::ServerRegistry,
};

const LOGGED_SAMPLES: usize = 5;

/// Maps wall-clock time onto the monotonic basis of `bpf_ktime_get_ns`.
pub trait BootClock: Send + Sync {
    /// Wall-clock instant at which the monotonic clock read zero.
    fn boot_epoch(&self) -> Result<SystemTime>;
}

/// Derives the epoch as `CLOCK_REALTIME - CLOCK_MONOTONIC`, read back to back.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBootClock;

impl BootClock for SystemBootClock {
    fn boot_epoch(&self) -> Result<SystemTime> {
        let realtime = read_clock(libc::CLOCK_REALTIME)?;
        let monotonic = read_clock(libc::CLOCK_MONOTONIC)?;
        let since_unix = realtime.checked_sub(monotonic).ok_or_else(|| {
            Error::Clock("monotonic clock is ahead of the wall clock".to_string())
        })?;
        SystemTime::UNIX_EPOCH
            .checked_add(since_unix)
            .ok_or_else(|| Error::Clock("boot epoch overflows SystemTime".to_string()))
    }
}

fn read_clock(clock: libc::clockid_t) -> Result<Duration> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc != 0 {
        return Err(Error::Clock(format!(
            "clock_gettime({clock}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let secs = u64::try_from(ts.tv_sec)
        .map_err(|_| Error::Clock(format!("clock {clock} returned a negative time")))?;
    Ok(Duration::new(secs, ts.tv_nsec as u32))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EstimatorConfig {
    /// A flow must have been seen within this window to count.
    pub window: Duration,
    pub min_packets: u64,
    pub min_bytes: u64,
}

/// How many flows each filter removed in one estimation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterCounts {
    pub total: usize,
    pub stale: usize,
    pub below_threshold: usize,
    pub unregistered: usize,
    pub passed: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Estimation {
    /// One entry per server with at least one surviving flow, sorted by id.
    pub stats: Vec<ServerPlayerStats>,
    pub counts: FilterCounts,
}

pub struct FlowEstimator<C = SystemBootClock> {
    config: EstimatorConfig,
    clock: C,
}

impl FlowEstimator<SystemBootClock> {
    pub fn new(config: EstimatorConfig) -> Self {
        Self::with_clock(config, SystemBootClock)
    }
}

impl<C: BootClock> FlowEstimator<C> {
    pub fn with_clock(config: EstimatorConfig, clock: C) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Estimates active players per registered server at wall-clock `now`.
    ///
    /// The boot epoch is read on every call. If it cannot be determined the
    /// call fails with [`Error::Clock`] instead of guessing an offset.
    pub fn estimate(
        &self,
        flows: &FlowSnapshot,
        registry: &ServerRegistry,
        now: SystemTime,
    ) -> Result<Estimation> {
        let epoch = self.clock.boot_epoch()?;
        let now_boot = now
            .duration_since(epoch)
            .map_err(|_| Error::Clock("current time precedes the boot epoch".to_string()))?;
        let now_boot_ns = u64::try_from(now_boot.as_nanos())
            .map_err(|_| Error::Clock("uptime does not fit in 64-bit nanoseconds".to_string()))?;
        let window_ns = u64::try_from(self.config.window.as_nanos()).unwrap_or(u64::MAX);
        let cutoff = now_boot_ns.saturating_sub(window_ns);

        // port -> source address -> bytes
        let mut by_port: HashMap<u16, HashMap<Ipv4Addr, u64>> = HashMap::new();
        let mut counts = FilterCounts {
            total: flows.len(),
            ..FilterCounts::default()
        };

        for (key, record) in flows {
            if record.last_seen_ns < cutoff {
                counts.stale += 1;
                continue;
            }

            if record.packets < self.config.min_packets || record.bytes < self.config.min_bytes {
                if counts.below_threshold < LOGGED_SAMPLES {
                    trace!(flow = %key, packets = record.packets, bytes = record.bytes, "flow below threshold");
                }
                counts.below_threshold += 1;
                continue;
            }

            if !registry.contains_port(key.dst_port) {
                counts.unregistered += 1;
                continue;
            }

            if counts.passed < LOGGED_SAMPLES {
                trace!(flow = %key, packets = record.packets, bytes = record.bytes, "flow passed");
            }
            counts.passed += 1;

            let per_addr = by_port.entry(key.dst_port).or_default();
            let bytes = per_addr.entry(key.source).or_insert(0);
            *bytes = bytes.saturating_add(record.bytes);
        }

        let computed_at: DateTime<Utc> = now.into();
        let mut stats = Vec::with_capacity(by_port.len());
        for (port, per_addr) in by_port {
            let Some(server_id) = registry.server_id(port) else {
                continue;
            };
            let mut unique_addresses: Vec<Ipv4Addr> = per_addr.keys().copied().collect();
            unique_addresses.sort_unstable();
            let total_bytes = per_addr
                .values()
                .fold(0u64, |acc, bytes| acc.saturating_add(*bytes));

            debug!(
                server_id,
                port,
                players = unique_addresses.len(),
                total_bytes,
                "server stats"
            );

            stats.push(ServerPlayerStats {
                server_id: server_id.to_string(),
                active_players: unique_addresses.len(),
                unique_addresses,
                total_bytes,
                sample_window: self.config.window,
                computed_at,
            });
        }
        stats.sort_by(|a, b| a.server_id.cmp(&b.server_id));

        Ok(Estimation { stats, counts })
    }
}
