//! The latest estimate set, shared with the HTTP read paths.
//!
//! Every metrics cycle builds a whole new [`StatsSnapshot`] and swaps it in
//! with a single pointer store, so readers see either the previous set or
//! the new one and never a mix.

use std::{collections::BTreeMap, sync::Arc};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::model::ServerPlayerStats;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub servers: BTreeMap<String, ServerPlayerStats>,
    /// `None` until the first metrics cycle publishes.
    pub published_at: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    fn empty() -> Self {
        Self {
            servers: BTreeMap::new(),
            published_at: None,
        }
    }
}

pub struct StatsPublisher {
    current: ArcSwap<StatsSnapshot>,
}

impl StatsPublisher {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(StatsSnapshot::empty()),
        }
    }

    /// Replaces the published set wholesale.
    pub fn publish(&self, stats: Vec<ServerPlayerStats>) {
        let mut servers = BTreeMap::new();
        for stat in stats {
            let server_id = stat.server_id.clone();
            if servers.insert(server_id.clone(), stat).is_some() {
                warn!(server_id = %server_id, "server reported on more than one port, keeping last");
            }
        }
        self.current.store(Arc::new(StatsSnapshot {
            servers,
            published_at: Some(Utc::now()),
        }));
    }

    pub fn snapshot(&self) -> Arc<StatsSnapshot> {
        self.current.load_full()
    }

    /// `None` means the server had no active traffic in the last cycle.
    pub fn get(&self, server_id: &str) -> Option<ServerPlayerStats> {
        self.current.load().servers.get(server_id).cloned()
    }
}

impl Default for StatsPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::Ipv4Addr, time::Duration};

    fn stat(id: &str, players: usize) -> ServerPlayerStats {
        ServerPlayerStats {
            server_id: id.to_string(),
            active_players: players,
            unique_addresses: (0..players)
                .map(|i| Ipv4Addr::new(10, 0, 0, i as u8))
                .collect(),
            total_bytes: 1000 * players as u64,
            sample_window: Duration::from_secs(300),
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn starts_empty() {
        let publisher = StatsPublisher::new();
        let snap = publisher.snapshot();
        assert!(snap.servers.is_empty());
        assert!(snap.published_at.is_none());
        assert!(publisher.get("srv1").is_none());
    }

    #[test]
    fn publish_replaces_instead_of_merging() {
        let publisher = StatsPublisher::new();
        publisher.publish(vec![stat("a", 2), stat("b", 1)]);
        publisher.publish(vec![stat("b", 3)]);

        assert!(publisher.get("a").is_none());
        assert_eq!(publisher.get("b").unwrap().active_players, 3);
        assert!(publisher.snapshot().published_at.is_some());
    }

    #[test]
    fn held_snapshot_is_unaffected_by_later_publish() {
        let publisher = StatsPublisher::new();
        publisher.publish(vec![stat("a", 2)]);
        let held = publisher.snapshot();

        publisher.publish(Vec::new());

        assert_eq!(held.servers.len(), 1);
        assert!(publisher.snapshot().servers.is_empty());
    }

    #[test]
    fn concurrent_readers_see_whole_sets() {
        let publisher = Arc::new(StatsPublisher::new());
        let writer = {
            let publisher = Arc::clone(&publisher);
            std::thread::spawn(move || {
                for round in 0..200usize {
                    let n = round % 5 + 1;
                    publisher.publish((0..n).map(|i| stat(&format!("s{i}"), n)).collect());
                }
            })
        };

        for _ in 0..200 {
            let snap = publisher.snapshot();
            // every server in one set was published with the same player count
            let counts: Vec<_> = snap.servers.values().map(|s| s.active_players).collect();
            if let Some(first) = counts.first() {
                assert!(counts.iter().all(|c| c == first));
                assert_eq!(counts.len(), *first);
            }
        }
        writer.join().unwrap();
    }
}
