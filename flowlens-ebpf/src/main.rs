#![no_std]
#![no_main]

use aya_ebpf::bindings::TC_ACT_OK;
use aya_ebpf::helpers::bpf_ktime_get_ns;
use aya_ebpf::macros::{classifier, map};
use aya_ebpf::maps::{HashMap, LruHashMap};
use aya_ebpf::programs::TcContext;
use flowlens_common::{
    DEFAULT_ALLOW_LIST_ENTRIES, DEFAULT_FLOW_TABLE_ENTRIES, FlowInfo, FlowKey, PROTO_TCP,
    PROTO_UDP,
};

const ETH_HDR_SIZE: usize = 14;
const IPV4_MIN_HEADER_BYTES: usize = 20;
const ETH_P_IPV4: u16 = 0x0800;

// Both capacities are overridden by the loader from the agent configuration.
#[map(name = "FLOW_STATS")]
static FLOW_STATS: LruHashMap<FlowKey, FlowInfo> =
    LruHashMap::<FlowKey, FlowInfo>::with_max_entries(DEFAULT_FLOW_TABLE_ENTRIES, 0);

#[map(name = "MONITORED_PORTS")]
static MONITORED_PORTS: HashMap<u16, u8> =
    HashMap::<u16, u8>::with_max_entries(DEFAULT_ALLOW_LIST_ENTRIES, 0);

#[classifier]
pub fn flow_monitor(ctx: TcContext) -> i32 {
    let _ = process_packet(
        ctx.data() as *const u8,
        ctx.data_end() as *const u8,
        ctx.len() as u64,
    );
    TC_ACT_OK
}

fn process_packet(data: *const u8, data_end: *const u8, skb_len: u64) -> Result<(), ()> {
    if unsafe { data.add(ETH_HDR_SIZE) } > data_end {
        return Err(());
    }

    const H_PROTO_OFFSET: usize = 12;
    let h_proto = unsafe {
        let p = data.add(H_PROTO_OFFSET) as *const u16;
        u16::from_be(core::ptr::read_unaligned(p))
    };
    if h_proto != ETH_P_IPV4 {
        return Ok(());
    }

    if unsafe { data.add(ETH_HDR_SIZE + IPV4_MIN_HEADER_BYTES) } > data_end {
        return Err(());
    }

    let ip_start = unsafe { data.add(ETH_HDR_SIZE) };
    let version_ihl = unsafe { *ip_start };
    let ihl_words = (version_ihl & 0x0f) as usize;
    if ihl_words < 5 {
        return Err(());
    }
    let header_len = ihl_words * 4;

    let proto = unsafe { *ip_start.add(9) };
    if proto != PROTO_TCP && proto != PROTO_UDP {
        return Ok(());
    }

    let src_addr = unsafe {
        let ptr = ip_start.add(12) as *const u32;
        u32::from_be(core::ptr::read_unaligned(ptr))
    };

    // TCP and UDP both carry the destination port at offset 2 of the L4 header.
    let l4_offset = ETH_HDR_SIZE + header_len;
    let dst_port = parse_dst_port(data, data_end, l4_offset).ok_or(())?;

    if unsafe { MONITORED_PORTS.get(&dst_port) }.is_none() {
        return Ok(());
    }

    let key = FlowKey {
        src_addr,
        dst_port,
        proto,
        pad: 0,
    };
    update_flow(&key, skb_len);
    Ok(())
}

fn parse_dst_port(data: *const u8, data_end: *const u8, offset: usize) -> Option<u16> {
    if unsafe { data.add(offset + 4) } > data_end {
        return None;
    }

    unsafe {
        let dst_ptr = data.add(offset + 2) as *const u16;
        Some(u16::from_be(core::ptr::read_unaligned(dst_ptr)))
    }
}

fn update_flow(key: &FlowKey, skb_len: u64) {
    let now = unsafe { bpf_ktime_get_ns() };
    match FLOW_STATS.get_ptr_mut(key) {
        Some(ptr) => {
            let info = unsafe { &mut *ptr };
            info.packets = info.packets.wrapping_add(1);
            info.bytes = info.bytes.wrapping_add(skb_len);
            info.last_seen_ns = now;
        }
        None => {
            let init = FlowInfo {
                packets: 1,
                bytes: skb_len,
                last_seen_ns: now,
            };
            let _ = FLOW_STATS.insert(key, &init, 0);
        }
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 4] = *b"GPL\0";
