use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use usage_meter_common::{HWADDR_MASK, hwaddr_octets};

/// 48-bit link-layer address used as the accounting key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct HwAddr(u64);

impl HwAddr {
    /// Builds an address from a raw map key. Bits above 48 are dropped.
    pub fn from_key(key: u64) -> Self {
        Self(key & HWADDR_MASK)
    }

    #[cfg(test)]
    pub fn from_octets(octets: [u8; 6]) -> Self {
        Self(usage_meter_common::hwaddr_key(octets))
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = hwaddr_octets(self.0);
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl Serialize for HwAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ingress => f.write_str("ingress"),
            Direction::Egress => f.write_str("egress"),
        }
    }
}

/// Bytes attributed to one address by a single destructive read.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CounterDelta {
    pub hwaddr: HwAddr,
    pub bytes: u64,
}

/// Accumulated usage of one host since its record was created.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UsageRecord {
    pub hwaddr: HwAddr,
    pub cumulative_ingress: u64,
    pub cumulative_egress: u64,
    /// Bytes from the latest drain cycle only.
    pub instant_ingress: u64,
    pub instant_egress: u64,
    /// Last drain that saw nonzero traffic for this host.
    pub last_seen: DateTime<Utc>,
    /// Start of the interval being accumulated; set when the record is created.
    pub last_flush: DateTime<Utc>,
}

impl UsageRecord {
    pub fn new(hwaddr: HwAddr, now: DateTime<Utc>) -> Self {
        Self {
            hwaddr,
            cumulative_ingress: 0,
            cumulative_egress: 0,
            instant_ingress: 0,
            instant_egress: 0,
            last_seen: now,
            last_flush: now,
        }
    }

    pub fn record(&mut self, direction: Direction, bytes: u64, now: DateTime<Utc>) {
        match direction {
            Direction::Ingress => {
                self.instant_ingress = bytes;
                self.cumulative_ingress = self.cumulative_ingress.saturating_add(bytes);
            }
            Direction::Egress => {
                self.instant_egress = bytes;
                self.cumulative_egress = self.cumulative_egress.saturating_add(bytes);
            }
        }
        self.last_seen = now;
    }

    pub fn interval(&self) -> UsageInterval {
        UsageInterval {
            hwaddr: self.hwaddr,
            start: self.last_flush,
            stop: self.last_seen,
            ingress: self.cumulative_ingress,
            egress: self.cumulative_egress,
        }
    }
}

/// A finalized usage interval handed to the persistence gateway.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UsageInterval {
    pub hwaddr: HwAddr,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub ingress: u64,
    pub egress: u64,
}

impl UsageInterval {
    /// Stable per-interval identity so a store can drop retried duplicates.
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}@{}",
            self.hwaddr,
            self.start.timestamp_nanos_opt().unwrap_or(i64::MAX)
        )
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "kB", "MB", "GB", "TB", "PB"];
    if bytes < 1000 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hwaddr_formats_as_colon_hex() {
        let addr = HwAddr::from_octets([0x02, 0x42, 0xac, 0x11, 0x00, 0x0a]);
        assert_eq!(addr.to_string(), "02:42:ac:11:00:0a");
        assert_eq!(HwAddr::from_key(0xffff_0242_ac11_000a), addr);
    }

    #[test]
    fn record_keeps_instant_and_cumulative_apart() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap();
        let mut rec = UsageRecord::new(HwAddr::from_key(7), t0);
        rec.record(Direction::Ingress, 100, t0);
        rec.record(Direction::Ingress, 40, t1);
        rec.record(Direction::Egress, 5, t1);

        assert_eq!(rec.cumulative_ingress, 140);
        assert_eq!(rec.instant_ingress, 40);
        assert_eq!(rec.cumulative_egress, 5);
        assert_eq!(rec.last_seen, t1);
        assert_eq!(rec.last_flush, t0);
    }

    #[test]
    fn interval_spans_last_flush_to_last_seen() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 3, 0).unwrap();
        let mut rec = UsageRecord::new(HwAddr::from_key(1), t0);
        rec.record(Direction::Egress, 9, t1);

        let interval = rec.interval();
        assert_eq!(interval.start, t0);
        assert_eq!(interval.stop, t1);
        assert_eq!(interval.egress, 9);
        assert_eq!(
            interval.idempotency_key(),
            format!("00:00:00:00:00:01@{}", t0.timestamp_nanos_opt().unwrap())
        );
    }

    #[test]
    fn human_bytes_scales_units() {
        assert_eq!(human_bytes(999), "999 B");
        assert_eq!(human_bytes(1_500), "1.5 kB");
        assert_eq!(human_bytes(2_000_000_000), "2.0 GB");
    }
}
