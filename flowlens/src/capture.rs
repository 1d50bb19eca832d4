//! Lifecycle of the tc ingress classifier and access to its two tables.
//!
//! The classifier counts packets for allow-listed destination ports in
//! `FLOW_STATS`; user space never parses packets, it only attaches and
//! detaches the program, edits `MONITORED_PORTS` and reads the counters.

use std::{
    collections::BTreeSet,
    ffi::CString,
    fmt::Display,
    io,
    path::PathBuf,
};

use aya::{
    Ebpf, EbpfLoader, include_bytes_aligned,
    maps::{HashMap as BpfHashMap, MapData},
    programs::{
        SchedClassifier,
        tc::{self, NlOptions, SchedClassifierLinkId, TcAttachOptions, TcAttachType},
    },
};
use tracing::{debug, info, warn};

use flowlens_common::{FlowInfo, MAP_FLOW_STATS, MAP_MONITORED_PORTS, PROGRAM_FLOW_MONITOR};

use crate::{
    error::{Error, Result},
    model::FlowSnapshot,
};

type RawFlowKey = flowlens_common::FlowKey;

const EMBEDDED_PROGRAM: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/flowlens"));

/// Upper bound accepted for either table size.
pub const MAX_TABLE_ENTRIES: u32 = 1 << 20;

// Fixed so a re-attach lands on, and replaces, the same filter slot.
const FILTER_PRIORITY: u16 = 1;
const FILTER_HANDLE: u32 = 1;

/// The operations the agent needs from a flow capture backend.
pub trait FlowCapture: Send {
    /// Reads the whole flow table. Not transactional: the kernel keeps
    /// updating records while they are read.
    fn harvest(&mut self) -> Result<FlowSnapshot>;

    /// Declares the full desired allow-list. Safe to resubmit every cycle.
    fn sync_monitored_ports(&mut self, desired: &BTreeSet<u16>) -> Result<PortDiff>;

    /// Best-effort teardown; never fails.
    fn detach(&mut self);
}

/// Point edits applied by one sync.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortDiff {
    pub added: Vec<u16>,
    pub removed: Vec<u16>,
}

impl PortDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A membership table keyed by destination port.
pub trait PortTable {
    fn ports(&self) -> Result<BTreeSet<u16>>;
    fn insert(&mut self, port: u16) -> Result<()>;
    fn remove(&mut self, port: u16) -> Result<()>;
}

/// Brings `table` to exactly `desired` with independent point edits.
///
/// Ports present in both sets are not touched, so their flows keep being
/// counted without a gap. Removals run before inserts so a full table has
/// room for the replacements. The first failing edit aborts the call;
/// whatever was applied before it stays and the next full resubmission
/// finishes the job.
pub fn apply_port_diff<T: PortTable + ?Sized>(
    table: &mut T,
    desired: &BTreeSet<u16>,
    capacity: u32,
) -> Result<PortDiff> {
    if desired.len() > capacity as usize {
        return Err(Error::Sync(format!(
            "{} ports requested but the allow-list holds {capacity}",
            desired.len()
        )));
    }

    let current = table.ports()?;
    let mut diff = PortDiff::default();

    for &port in current.difference(desired) {
        table.remove(port)?;
        diff.removed.push(port);
    }
    for &port in desired.difference(&current) {
        table.insert(port)?;
        diff.added.push(port);
    }

    Ok(diff)
}

/// Converts raw table entries into a snapshot, failing on the first
/// iteration error.
fn collect_snapshot<I, E>(entries: I) -> Result<FlowSnapshot>
where
    I: IntoIterator<Item = std::result::Result<(RawFlowKey, FlowInfo), E>>,
    E: Display,
{
    let mut snapshot = FlowSnapshot::new();
    for item in entries {
        let (key, info) =
            item.map_err(|e| Error::Harvest(format!("flow table iteration failed: {e}")))?;
        snapshot.insert(key.into(), info.into());
    }
    Ok(snapshot)
}

#[derive(Clone, Debug)]
pub struct AttachOptions {
    pub iface: String,
    /// Object file to load instead of the embedded program.
    pub program_path: Option<PathBuf>,
    pub flow_table_entries: u32,
    pub allow_list_entries: u32,
}

struct AllowList(BpfHashMap<MapData, u16, u8>);

impl PortTable for AllowList {
    fn ports(&self) -> Result<BTreeSet<u16>> {
        self.0
            .keys()
            .map(|key| key.map_err(|e| Error::Sync(format!("failed to list monitored ports: {e}"))))
            .collect()
    }

    fn insert(&mut self, port: u16) -> Result<()> {
        self.0
            .insert(port, 1u8, 0)
            .map_err(|e| Error::Sync(format!("failed to add port {port}: {e}")))
    }

    fn remove(&mut self, port: u16) -> Result<()> {
        self.0
            .remove(&port)
            .map_err(|e| Error::Sync(format!("failed to remove port {port}: {e}")))
    }
}

/// The classifier attached to one interface plus handles to its tables.
pub struct KernelFlowCapture {
    iface: String,
    allow_list_entries: u32,
    link: Option<SchedClassifierLinkId>,
    flows: Option<BpfHashMap<MapData, RawFlowKey, FlowInfo>>,
    ports: Option<AllowList>,
    ebpf: Option<Ebpf>,
}

impl KernelFlowCapture {
    /// Loads the flow-accounting program and attaches it to the ingress path
    /// of `opts.iface`, replacing a filter left behind by an earlier run.
    pub fn attach(opts: &AttachOptions) -> Result<Self> {
        validate_attach_options(opts)?;
        let ifindex = interface_index(&opts.iface)?;

        let mut loader = EbpfLoader::new();
        #[allow(deprecated)]
        {
            // `set_max_entries` is currently the only stable API across our Aya pin.
            loader.set_max_entries(MAP_FLOW_STATS, opts.flow_table_entries);
            loader.set_max_entries(MAP_MONITORED_PORTS, opts.allow_list_entries);
        }

        let mut ebpf = match &opts.program_path {
            Some(path) => loader
                .load_file(path)
                .map_err(|e| attach_error(format!("failed to load {}", path.display()), e))?,
            None if EMBEDDED_PROGRAM.is_empty() => {
                return Err(Error::Attachment(
                    "no classifier embedded in this build; set program_path".to_string(),
                ));
            }
            None => loader
                .load(EMBEDDED_PROGRAM)
                .map_err(|e| attach_error("failed to load embedded eBPF object", e))?,
        };

        match tc::qdisc_add_clsact(&opts.iface) {
            Ok(()) => debug!(iface = %opts.iface, "added clsact qdisc"),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(attach_error(
                    format!("failed to add clsact qdisc on {}", opts.iface),
                    err,
                ));
            }
        }

        match tc::qdisc_detach_program(&opts.iface, TcAttachType::Ingress, PROGRAM_FLOW_MONITOR) {
            Ok(()) => info!(iface = %opts.iface, "replaced stale {PROGRAM_FLOW_MONITOR} filter"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(iface = %opts.iface, error = %err, "could not clear stale filter"),
        }

        let link = {
            let program: &mut SchedClassifier = ebpf
                .program_mut(PROGRAM_FLOW_MONITOR)
                .ok_or_else(|| {
                    Error::Attachment(format!("program {PROGRAM_FLOW_MONITOR} not found"))
                })?
                .try_into()
                .map_err(|e| attach_error("tc program has wrong type", e))?;
            program
                .load()
                .map_err(|e| attach_error("failed to load tc program", e))?;
            program
                .attach_with_options(
                    &opts.iface,
                    TcAttachType::Ingress,
                    TcAttachOptions::Netlink(NlOptions {
                        priority: FILTER_PRIORITY,
                        handle: FILTER_HANDLE,
                    }),
                )
                .map_err(|e| attach_error(format!("failed to attach tc on {}", opts.iface), e))?
        };

        let flows = BpfHashMap::try_from(take_map(&mut ebpf, MAP_FLOW_STATS)?)
            .map_err(|e| attach_error("flow table has unexpected type", e))?;
        let ports = BpfHashMap::try_from(take_map(&mut ebpf, MAP_MONITORED_PORTS)?)
            .map_err(|e| attach_error("allow-list has unexpected type", e))?;

        info!(
            iface = %opts.iface,
            ifindex,
            flow_table_entries = opts.flow_table_entries,
            allow_list_entries = opts.allow_list_entries,
            "attached {PROGRAM_FLOW_MONITOR} to ingress"
        );

        Ok(Self {
            iface: opts.iface.clone(),
            allow_list_entries: opts.allow_list_entries,
            link: Some(link),
            flows: Some(flows),
            ports: Some(AllowList(ports)),
            ebpf: Some(ebpf),
        })
    }

    pub fn interface(&self) -> &str {
        &self.iface
    }

    /// Most ports the allow-list accepts.
    pub fn capacity(&self) -> u32 {
        self.allow_list_entries
    }
}

impl FlowCapture for KernelFlowCapture {
    fn harvest(&mut self) -> Result<FlowSnapshot> {
        let flows = self
            .flows
            .as_ref()
            .ok_or_else(|| Error::Harvest("capture is detached".to_string()))?;
        collect_snapshot(flows.iter())
    }

    fn sync_monitored_ports(&mut self, desired: &BTreeSet<u16>) -> Result<PortDiff> {
        let ports = self
            .ports
            .as_mut()
            .ok_or_else(|| Error::Sync("capture is detached".to_string()))?;
        apply_port_diff(ports, desired, self.allow_list_entries)
    }

    fn detach(&mut self) {
        // Filter first so nothing is counted against half-released tables.
        if let (Some(link), Some(ebpf)) = (self.link.take(), self.ebpf.as_mut()) {
            let result = match ebpf.program_mut(PROGRAM_FLOW_MONITOR) {
                Some(program) => match <&mut SchedClassifier>::try_from(program) {
                    Ok(program) => program.detach(link).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                },
                None => Err(format!("program {PROGRAM_FLOW_MONITOR} not found")),
            };
            match result {
                Ok(()) => info!(iface = %self.iface, "detached {PROGRAM_FLOW_MONITOR}"),
                Err(err) => warn!(
                    iface = %self.iface,
                    error = %err,
                    "failed to remove classifier, releasing handles anyway"
                ),
            }
        }

        self.flows = None;
        self.ports = None;
        self.ebpf = None;
    }
}

impl Drop for KernelFlowCapture {
    fn drop(&mut self) {
        self.detach();
    }
}

fn validate_attach_options(opts: &AttachOptions) -> Result<()> {
    if opts.iface.is_empty() {
        return Err(Error::Attachment("interface name is empty".to_string()));
    }
    for (name, entries) in [
        ("flow table", opts.flow_table_entries),
        ("allow-list", opts.allow_list_entries),
    ] {
        if entries == 0 || entries > MAX_TABLE_ENTRIES {
            return Err(Error::Attachment(format!(
                "{name} size {entries} must be within 1..={MAX_TABLE_ENTRIES}"
            )));
        }
    }
    Ok(())
}

fn interface_index(iface: &str) -> Result<u32> {
    let ifname = CString::new(iface)
        .map_err(|_| Error::Attachment(format!("invalid interface name {iface:?}")))?;
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if ifindex == 0 {
        return Err(attach_error(
            format!("interface {iface} not found"),
            io::Error::last_os_error(),
        ));
    }
    Ok(ifindex)
}

fn take_map(ebpf: &mut Ebpf, name: &str) -> Result<aya::maps::Map> {
    ebpf.take_map(name)
        .ok_or_else(|| Error::Attachment(format!("map {name} not found")))
}

fn attach_error(context: impl Display, err: impl Display) -> Error {
    Error::Attachment(format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use crate::model::FlowKey;
    use flowlens_common::PROTO_UDP;

    #[derive(Default)]
    struct MemoryPorts {
        ports: BTreeSet<u16>,
        fail_on: Option<u16>,
        /// Rejects inserts beyond this many entries, like a full BPF hash map.
        max_entries: Option<usize>,
        edits: Vec<(char, u16)>,
    }

    impl PortTable for MemoryPorts {
        fn ports(&self) -> Result<BTreeSet<u16>> {
            Ok(self.ports.clone())
        }

        fn insert(&mut self, port: u16) -> Result<()> {
            if self.fail_on == Some(port) {
                return Err(Error::Sync(format!("failed to add port {port}: ENOSPC")));
            }
            if self.max_entries.is_some_and(|max| self.ports.len() >= max) {
                return Err(Error::Sync(format!("failed to add port {port}: E2BIG")));
            }
            self.edits.push(('+', port));
            self.ports.insert(port);
            Ok(())
        }

        fn remove(&mut self, port: u16) -> Result<()> {
            if self.fail_on == Some(port) {
                return Err(Error::Sync(format!("failed to remove port {port}: EPERM")));
            }
            self.edits.push(('-', port));
            self.ports.remove(&port);
            Ok(())
        }
    }

    fn set(ports: &[u16]) -> BTreeSet<u16> {
        ports.iter().copied().collect()
    }

    #[test]
    fn sync_applies_symmetric_difference_only() {
        let mut table = MemoryPorts {
            ports: set(&[7777, 8080, 9000]),
            ..Default::default()
        };
        let diff = apply_port_diff(&mut table, &set(&[8080, 9000, 27015]), 100).unwrap();

        assert_eq!(diff.added, vec![27015]);
        assert_eq!(diff.removed, vec![7777]);
        assert_eq!(table.ports, set(&[8080, 9000, 27015]));
        // 8080 and 9000 were never touched
        assert_eq!(table.edits, vec![('-', 7777), ('+', 27015)]);
    }

    #[test]
    fn resubmitting_same_set_is_a_no_op() {
        let mut table = MemoryPorts::default();
        let desired = set(&[8080, 8081]);
        assert_eq!(apply_port_diff(&mut table, &desired, 100).unwrap().added.len(), 2);
        table.edits.clear();

        let diff = apply_port_diff(&mut table, &desired, 100).unwrap();
        assert!(diff.is_empty());
        assert!(table.edits.is_empty());
    }

    #[test]
    fn empty_desired_set_clears_table() {
        let mut table = MemoryPorts {
            ports: set(&[1, 2, 3]),
            ..Default::default()
        };
        let diff = apply_port_diff(&mut table, &BTreeSet::new(), 100).unwrap();
        assert_eq!(diff.removed, vec![1, 2, 3]);
        assert!(table.ports.is_empty());
    }

    #[test]
    fn first_failure_aborts_and_next_sync_heals() {
        let mut table = MemoryPorts {
            ports: set(&[1000]),
            fail_on: Some(2002),
            ..Default::default()
        };
        let desired = set(&[2001, 2002, 2003]);

        let err = apply_port_diff(&mut table, &desired, 100).unwrap_err();
        assert_eq!(err.kind(), "sync");
        // 1000 went and 2001 landed, nothing after the failing insert did
        assert_eq!(table.ports, set(&[2001]));

        table.fail_on = None;
        let diff = apply_port_diff(&mut table, &desired, 100).unwrap();
        assert_eq!(diff.added, vec![2002, 2003]);
        assert!(diff.removed.is_empty());
        assert_eq!(table.ports, desired);
    }

    #[test]
    fn full_table_is_replaced_wholesale() {
        let mut table = MemoryPorts {
            ports: set(&[1, 2]),
            max_entries: Some(2),
            ..Default::default()
        };
        let desired = set(&[3, 4]);

        let diff = apply_port_diff(&mut table, &desired, 2).unwrap();
        assert_eq!(diff.removed, vec![1, 2]);
        assert_eq!(diff.added, vec![3, 4]);
        assert_eq!(table.ports, desired);

        assert!(apply_port_diff(&mut table, &desired, 2).unwrap().is_empty());
    }

    #[test]
    fn full_table_converges_after_partial_sync() {
        let mut table = MemoryPorts {
            ports: set(&[1, 2]),
            max_entries: Some(2),
            fail_on: Some(4),
            ..Default::default()
        };
        let desired = set(&[2, 3, 4]);
        assert!(apply_port_diff(&mut table, &desired, 3).is_err());

        table.max_entries = Some(3);
        table.fail_on = None;
        for _ in 0..2 {
            let _ = apply_port_diff(&mut table, &desired, 3);
        }
        assert_eq!(table.ports, desired);
    }

    #[test]
    fn over_capacity_is_rejected_before_any_edit() {
        let mut table = MemoryPorts {
            ports: set(&[1]),
            ..Default::default()
        };
        let err = apply_port_diff(&mut table, &set(&[10, 11, 12]), 2).unwrap_err();
        assert_eq!(err.kind(), "sync");
        assert!(table.edits.is_empty());
        assert_eq!(table.ports, set(&[1]));
    }

    #[test]
    fn collect_snapshot_converts_entries() {
        let raw_key = RawFlowKey {
            src_addr: u32::from(Ipv4Addr::new(192, 168, 1, 20)),
            dst_port: 27015,
            proto: PROTO_UDP,
            pad: 0,
        };
        let info = FlowInfo {
            packets: 12,
            bytes: 3400,
            last_seen_ns: 99,
        };
        let entries: Vec<std::result::Result<_, String>> = vec![Ok((raw_key, info))];

        let snapshot = collect_snapshot(entries).unwrap();
        let key = FlowKey::new(Ipv4Addr::new(192, 168, 1, 20), 27015, PROTO_UDP);
        let record = snapshot.get(&key).unwrap();
        assert_eq!(record.packets, 12);
        assert_eq!(record.bytes, 3400);
        assert_eq!(record.last_seen_ns, 99);
    }

    #[test]
    fn collect_snapshot_fails_on_iteration_error() {
        let entries: Vec<std::result::Result<(RawFlowKey, FlowInfo), String>> = vec![
            Ok((RawFlowKey::default(), FlowInfo::default())),
            Err("bad map fd".to_string()),
        ];
        let err = collect_snapshot(entries).unwrap_err();
        assert_eq!(err.kind(), "harvest");
        assert!(err.to_string().contains("bad map fd"));
    }

    fn options() -> AttachOptions {
        AttachOptions {
            iface: "eth0".to_string(),
            program_path: None,
            flow_table_entries: 100_000,
            allow_list_entries: 100_000,
        }
    }

    #[test]
    fn validate_rejects_bad_sizes() {
        assert!(validate_attach_options(&options()).is_ok());

        let mut opts = options();
        opts.flow_table_entries = 0;
        assert!(validate_attach_options(&opts).is_err());

        let mut opts = options();
        opts.allow_list_entries = MAX_TABLE_ENTRIES + 1;
        assert!(validate_attach_options(&opts).is_err());

        let mut opts = options();
        opts.iface.clear();
        assert!(validate_attach_options(&opts).is_err());
    }

    #[test]
    fn missing_interface_is_an_attachment_error() {
        let err = interface_index("flowlens-nx0").unwrap_err();
        assert_eq!(err.kind(), "attachment");
        assert!(err.to_string().contains("flowlens-nx0"));
    }

    #[test]
    fn detached_capture_keeps_identity_and_refuses_io() {
        let mut capture = KernelFlowCapture {
            iface: "eth1".to_string(),
            allow_list_entries: 512,
            link: None,
            flows: None,
            ports: None,
            ebpf: None,
        };
        assert_eq!(capture.interface(), "eth1");
        assert_eq!(capture.capacity(), 512);
        assert_eq!(capture.harvest().unwrap_err().kind(), "harvest");
        assert_eq!(
            capture.sync_monitored_ports(&set(&[7777])).unwrap_err().kind(),
            "sync"
        );
        capture.detach();
    }

    #[test]
    fn attach_to_missing_interface_fails_before_loading() {
        let mut opts = options();
        opts.iface = "flowlens-nx1".to_string();
        let err = KernelFlowCapture::attach(&opts).err().unwrap();
        assert_eq!(err.kind(), "attachment");
    }
}
