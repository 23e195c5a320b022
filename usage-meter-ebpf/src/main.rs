#![no_std]
#![no_main]

use core::sync::atomic::{AtomicU64, Ordering};

use aya_ebpf::bindings::{BPF_NOEXIST, TC_ACT_OK};
use aya_ebpf::macros::{classifier, map};
use aya_ebpf::maps::{Array, LruHashMap};
use aya_ebpf::programs::TcContext;
use usage_meter_common::{USAGE_MAP_ENTRIES, hwaddr_key};

const ETH_HDR_SIZE: usize = 14;
const ETH_DST_OFFSET: usize = 0;
const ETH_SRC_OFFSET: usize = 6;
const ETH_PROTO_OFFSET: usize = 12;
const ETH_P_IPV4: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;

// Map names mirror INGRESS_USAGE_MAP / EGRESS_USAGE_MAP / DROP_COUNTER_MAP in
// usage-meter-common.
#[map(name = "ingress_usage")]
static INGRESS_USAGE: LruHashMap<u64, u64> =
    LruHashMap::<u64, u64>::with_max_entries(USAGE_MAP_ENTRIES, 0);

#[map(name = "egress_usage")]
static EGRESS_USAGE: LruHashMap<u64, u64> =
    LruHashMap::<u64, u64>::with_max_entries(USAGE_MAP_ENTRIES, 0);

#[map(name = "usage_drops")]
static USAGE_DROPS: Array<u64> = Array::<u64>::with_max_entries(1, 0);

#[classifier]
pub fn ingress_usage_hook(ctx: TcContext) -> i32 {
    if account(&ctx, &INGRESS_USAGE, ETH_SRC_OFFSET).is_err() {
        record_drop();
    }
    TC_ACT_OK
}

#[classifier]
pub fn egress_usage_hook(ctx: TcContext) -> i32 {
    if account(&ctx, &EGRESS_USAGE, ETH_DST_OFFSET).is_err() {
        record_drop();
    }
    TC_ACT_OK
}

fn account(ctx: &TcContext, map: &LruHashMap<u64, u64>, addr_offset: usize) -> Result<(), ()> {
    let data = ctx.data() as *const u8;
    let data_end = ctx.data_end() as *const u8;
    if unsafe { data.add(ETH_HDR_SIZE) } > data_end {
        return Err(());
    }

    let h_proto = unsafe {
        let p = data.add(ETH_PROTO_OFFSET) as *const u16;
        u16::from_be(core::ptr::read_unaligned(p))
    };
    if h_proto != ETH_P_IPV4 && h_proto != ETH_P_IPV6 {
        return Ok(());
    }

    let octets = unsafe {
        let p = data.add(addr_offset) as *const [u8; 6];
        core::ptr::read_unaligned(p)
    };
    let key = hwaddr_key(octets);
    let len = (ctx.len() as u64).saturating_sub(ETH_HDR_SIZE as u64);

    add_bytes(map, &key, len);
    Ok(())
}

fn add_bytes(map: &LruHashMap<u64, u64>, key: &u64, len: u64) {
    if let Some(ptr) = map.get_ptr_mut(key) {
        unsafe { AtomicU64::from_ptr(ptr) }.fetch_add(len, Ordering::Relaxed);
        return;
    }
    // Another CPU may have inserted the key since the lookup.
    if map.insert(key, &len, BPF_NOEXIST as u64).is_err() {
        if let Some(ptr) = map.get_ptr_mut(key) {
            unsafe { AtomicU64::from_ptr(ptr) }.fetch_add(len, Ordering::Relaxed);
        }
    }
}

fn record_drop() {
    if let Some(ptr) = USAGE_DROPS.get_ptr_mut(0) {
        unsafe { AtomicU64::from_ptr(ptr) }.fetch_add(1, Ordering::Relaxed);
    }
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 4] = *b"GPL\0";

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
