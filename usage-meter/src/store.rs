use std::{
    collections::{HashMap, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::model::{CounterDelta, Direction, HwAddr, UsageRecord, human_bytes};

pub const LEDGER_SHARDS: usize = 64;

/// Two-tier expiry used by routine flushes.
#[derive(Copy, Clone, Debug)]
pub struct ExpiryPolicy {
    /// Idle time after which a host's interval is closed.
    pub inactivity: TimeDelta,
    /// Maximum length of an interval, even for a host that never goes idle.
    pub staleness: TimeDelta,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            inactivity: TimeDelta::minutes(1),
            staleness: TimeDelta::hours(1),
        }
    }
}

impl ExpiryPolicy {
    pub fn is_expired(&self, record: &UsageRecord, now: DateTime<Utc>) -> bool {
        now - record.last_seen > self.inactivity || now - record.last_flush > self.staleness
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlushMode {
    /// Routine tick: only records matching the expiry policy.
    Expired,
    /// Termination: every record.
    All,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HostUsage {
    pub hwaddr: HwAddr,
    pub cumulative_ingress: u64,
    pub cumulative_egress: u64,
    pub instant_ingress: u64,
    pub instant_egress: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct UsageTotals {
    pub cumulative_ingress: u64,
    pub cumulative_egress: u64,
    pub instant_ingress: u64,
    pub instant_egress: u64,
}

/// Read-only copy of the ledger for reporting collaborators.
#[derive(Clone, Debug, Default, Serialize)]
pub struct UsageSnapshot {
    pub hosts: Vec<HostUsage>,
    pub total: UsageTotals,
}

impl UsageTotals {
    fn add(&mut self, rec: &UsageRecord) {
        self.cumulative_ingress = self.cumulative_ingress.saturating_add(rec.cumulative_ingress);
        self.cumulative_egress = self.cumulative_egress.saturating_add(rec.cumulative_egress);
        self.instant_ingress = self.instant_ingress.saturating_add(rec.instant_ingress);
        self.instant_egress = self.instant_egress.saturating_add(rec.instant_egress);
    }
}

impl From<&UsageRecord> for HostUsage {
    fn from(rec: &UsageRecord) -> Self {
        Self {
            hwaddr: rec.hwaddr,
            cumulative_ingress: rec.cumulative_ingress,
            cumulative_egress: rec.cumulative_egress,
            instant_ingress: rec.instant_ingress,
            instant_egress: rec.instant_egress,
        }
    }
}

/// In-memory usage per hardware address.
///
/// Records are spread over hash-selected shards, each behind a reader-writer
/// lock. A drain cycle takes each shard's write lock once and applies the
/// instant reset plus both directions' deltas under it, so readers observe a
/// key either entirely before or entirely after a cycle.
pub struct UsageLedger {
    shards: Vec<RwLock<HashMap<HwAddr, UsageRecord>>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::with_shards(LEDGER_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let count = count.max(1);
        let mut shards = Vec::with_capacity(count);
        for _ in 0..count {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard_index(&self, key: &HwAddr) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Applies one drain cycle.
    ///
    /// Every existing record has its instant counters zeroed, then nonzero
    /// deltas update or create records. Zero deltas never create a record.
    pub fn apply_cycle(
        &self,
        now: DateTime<Utc>,
        ingress: &[CounterDelta],
        egress: &[CounterDelta],
    ) {
        let mut buckets: Vec<Vec<(Direction, CounterDelta)>> =
            vec![Vec::new(); self.shards.len()];
        for (direction, deltas) in [(Direction::Ingress, ingress), (Direction::Egress, egress)] {
            for delta in deltas.iter().filter(|d| d.bytes != 0) {
                buckets[self.shard_index(&delta.hwaddr)].push((direction, *delta));
            }
        }

        for (shard, updates) in self.shards.iter().zip(buckets) {
            let mut guard = shard.write();
            for rec in guard.values_mut() {
                rec.instant_ingress = 0;
                rec.instant_egress = 0;
            }
            for (direction, delta) in updates {
                guard
                    .entry(delta.hwaddr)
                    .or_insert_with(|| UsageRecord::new(delta.hwaddr, now))
                    .record(direction, delta.bytes, now);
            }
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let mut snapshot = UsageSnapshot::default();
        for shard in &self.shards {
            let guard = shard.read();
            for rec in guard.values() {
                snapshot.total.add(rec);
                snapshot.hosts.push(HostUsage::from(rec));
            }
        }
        snapshot
    }

    #[cfg(test)]
    pub fn get(&self, hwaddr: HwAddr) -> Option<UsageRecord> {
        self.shards[self.shard_index(&hwaddr)].read().get(&hwaddr).copied()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// Copies the records a flush pass should commit.
    pub fn flush_candidates(
        &self,
        now: DateTime<Utc>,
        policy: &ExpiryPolicy,
        mode: FlushMode,
    ) -> Vec<UsageRecord> {
        let mut candidates = Vec::new();
        for shard in &self.shards {
            let guard = shard.read();
            candidates.extend(
                guard
                    .values()
                    .filter(|rec| mode == FlushMode::All || policy.is_expired(rec, now))
                    .copied(),
            );
        }
        candidates
    }

    /// Removes a record after its interval was persisted.
    ///
    /// The record is only removed while it still describes the persisted
    /// interval; a record that gained traffic in between is left in place.
    pub fn remove_flushed(&self, flushed: &UsageRecord) -> bool {
        let mut guard = self.shards[self.shard_index(&flushed.hwaddr)].write();
        match guard.get(&flushed.hwaddr) {
            Some(current)
                if current.last_flush == flushed.last_flush
                    && current.cumulative_ingress == flushed.cumulative_ingress
                    && current.cumulative_egress == flushed.cumulative_egress =>
            {
                guard.remove(&flushed.hwaddr);
                true
            }
            _ => false,
        }
    }
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Scales bytes counted over one drain cycle to bytes per second.
pub fn per_second(bytes: u64, cycle: Duration) -> u64 {
    let micros = cycle.as_micros().max(1);
    u64::try_from(u128::from(bytes) * 1_000_000 / micros).unwrap_or(u64::MAX)
}

/// Logs the snapshot; instant counters are reported as rates over `cycle`.
pub fn log_snapshot(snapshot: &UsageSnapshot, cycle: Duration) {
    let total = &snapshot.total;
    info!(
        hosts = snapshot.hosts.len(),
        ingress = %human_bytes(total.cumulative_ingress),
        egress = %human_bytes(total.cumulative_egress),
        "usage: {}/s down {}/s up",
        human_bytes(per_second(total.instant_ingress, cycle)),
        human_bytes(per_second(total.instant_egress, cycle))
    );
    for host in &snapshot.hosts {
        debug!(
            hwaddr = %host.hwaddr,
            ingress = host.cumulative_ingress,
            egress = host.cumulative_egress,
            rate_ingress = per_second(host.instant_ingress, cycle),
            rate_egress = per_second(host.instant_egress, cycle),
            "host usage"
        );
    }
}
