use std::{collections::HashMap, fmt, net::Ipv4Addr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flowlens_common::{FlowInfo, PROTO_TCP, PROTO_UDP};

/// One flow as tracked by the kernel table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct FlowKey {
    pub source: Ipv4Addr,
    pub dst_port: u16,
    pub protocol: u8,
}

#[cfg(test)]
impl FlowKey {
    pub fn new(source: Ipv4Addr, dst_port: u16, protocol: u8) -> Self {
        Self {
            source,
            dst_port,
            protocol,
        }
    }
}

impl From<flowlens_common::FlowKey> for FlowKey {
    fn from(raw: flowlens_common::FlowKey) -> Self {
        Self {
            source: Ipv4Addr::from(raw.src_addr),
            dst_port: raw.dst_port,
            protocol: raw.proto,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> :{} proto:{}",
            self.source,
            self.dst_port,
            protocol_name(self.protocol)
        )
    }
}

pub fn protocol_name(proto: u8) -> &'static str {
    match proto {
        PROTO_TCP => "tcp",
        PROTO_UDP => "udp",
        _ => "other",
    }
}

/// Cumulative counters since the kernel first saw the flow. Never reset from
/// user space.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct FlowRecord {
    pub packets: u64,
    pub bytes: u64,
    /// CLOCK_MONOTONIC nanoseconds.
    pub last_seen_ns: u64,
}

impl From<FlowInfo> for FlowRecord {
    fn from(raw: FlowInfo) -> Self {
        Self {
            packets: raw.packets,
            bytes: raw.bytes,
            last_seen_ns: raw.last_seen_ns,
        }
    }
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packets: {} bytes: {} last_seen_ns: {}",
            self.packets, self.bytes, self.last_seen_ns
        )
    }
}

/// Result of one harvest.
pub type FlowSnapshot = HashMap<FlowKey, FlowRecord>;

/// A game server reported by discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub server_id: String,
    /// Kept wide so out-of-range values from discovery can be reported
    /// instead of silently truncated.
    pub port: i64,
    #[serde(default = "Utc::now")]
    pub discovered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

#[cfg(test)]
impl ServerDescriptor {
    pub fn new(server_id: impl Into<String>, port: i64) -> Self {
        Self {
            server_id: server_id.into(),
            port,
            discovered_at: Utc::now(),
            container_id: None,
            container_name: None,
        }
    }
}

/// Player estimate for one server over one metrics cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerPlayerStats {
    pub server_id: String,
    /// Distinct source addresses with surviving flows.
    pub active_players: usize,
    /// Sorted ascending.
    pub unique_addresses: Vec<Ipv4Addr>,
    pub total_bytes: u64,
    pub sample_window: Duration,
    pub computed_at: DateTime<Utc>,
}
