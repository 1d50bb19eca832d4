#![no_std]

// Types shared between the flowlens agent and the tc classifier.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

pub const MAP_FLOW_STATS: &str = "FLOW_STATS";
pub const MAP_MONITORED_PORTS: &str = "MONITORED_PORTS";
pub const PROGRAM_FLOW_MONITOR: &str = "flow_monitor";

pub const DEFAULT_FLOW_TABLE_ENTRIES: u32 = 100_000;
pub const DEFAULT_ALLOW_LIST_ENTRIES: u32 = 100_000;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Key of the flow table. `src_addr` holds the IPv4 source in host byte order.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub src_addr: u32,
    pub dst_port: u16,
    pub proto: u8,
    pub pad: u8,
}

/// Cumulative counters for one flow. `last_seen_ns` comes from
/// `bpf_ktime_get_ns`, i.e. CLOCK_MONOTONIC.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowInfo {
    pub packets: u64,
    pub bytes: u64,
    pub last_seen_ns: u64,
}

// When compiled for userspace with the `user` feature enabled the crate
// exposes an implementation of `aya::Pod` for these types so they can be
// used with aya's typed map APIs. We keep this behind a feature so the
// no_std eBPF side doesn't pull in userspace-only dependencies.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{FlowInfo, FlowKey};
    use aya::Pod;

    unsafe impl Pod for FlowKey {}
    unsafe impl Pod for FlowInfo {}
}
