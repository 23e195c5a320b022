#![cfg_attr(not(test), no_std)]

// Names and key layout shared between the tc programs and the userspace agent.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

/// Map counting bytes received from a host, keyed by source hardware address.
pub const INGRESS_USAGE_MAP: &str = "ingress_usage";
/// Map counting bytes sent to a host, keyed by destination hardware address.
pub const EGRESS_USAGE_MAP: &str = "egress_usage";

/// Single-slot counter of frames too short to account.
pub const DROP_COUNTER_MAP: &str = "usage_drops";

pub const INGRESS_PROGRAM: &str = "ingress_usage_hook";
pub const EGRESS_PROGRAM: &str = "egress_usage_hook";

/// Capacity of each usage map; also the page size used when draining them.
pub const USAGE_MAP_ENTRIES: u32 = 4096;

/// Only the low 48 bits of a key carry the hardware address.
pub const HWADDR_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// Packs a hardware address into a map key, first octet most significant.
#[inline(always)]
pub const fn hwaddr_key(octets: [u8; 6]) -> u64 {
    ((octets[0] as u64) << 40)
        | ((octets[1] as u64) << 32)
        | ((octets[2] as u64) << 24)
        | ((octets[3] as u64) << 16)
        | ((octets[4] as u64) << 8)
        | (octets[5] as u64)
}

#[inline(always)]
pub const fn hwaddr_octets(key: u64) -> [u8; 6] {
    [
        (key >> 40) as u8,
        (key >> 32) as u8,
        (key >> 24) as u8,
        (key >> 16) as u8,
        (key >> 8) as u8,
        key as u8,
    ]
}
