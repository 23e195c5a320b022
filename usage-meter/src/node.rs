use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::drain::{CounterTable, DrainError, Drainer};
use crate::model::{Direction, HwAddr, UsageInterval};
use crate::sink::{SinkError, UsageSink};
use crate::store::{ExpiryPolicy, FlushMode, UsageLedger};

pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub drain_interval: Duration,
    pub flush_interval: Duration,
    pub expiry: ExpiryPolicy,
    /// Upper bound on one persistence call.
    pub persist_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            expiry: ExpiryPolicy::default(),
            persist_timeout: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("persisting usage of {hwaddr} failed; {flushed} records flushed before it")]
    Aborted {
        hwaddr: HwAddr,
        flushed: usize,
        #[source]
        source: SinkError,
    },

    #[error("{failed} of {total} records could not be persisted")]
    Incomplete {
        failed: usize,
        total: usize,
        #[source]
        source: SinkError,
    },
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CycleStats {
    pub ingress_deltas: usize,
    pub egress_deltas: usize,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FlushStats {
    pub flushed: usize,
    pub remaining: usize,
}

/// Drains kernel counters into the ledger and commits finished intervals.
///
/// Only the engine writes to the ledger. Readers hold their own `Arc` and
/// take snapshots at any time.
pub struct UsageEngine<T, S, C> {
    drainer: Drainer<T>,
    ledger: Arc<UsageLedger>,
    sink: S,
    clock: C,
    config: EngineConfig,
}

impl<T, S, C> UsageEngine<T, S, C>
where
    T: CounterTable,
    S: UsageSink,
    C: Clock,
{
    pub fn new(
        drainer: Drainer<T>,
        ledger: Arc<UsageLedger>,
        sink: S,
        clock: C,
        config: EngineConfig,
    ) -> Self {
        Self {
            drainer,
            ledger,
            sink,
            clock,
            config,
        }
    }

    /// One drain cycle over both directions.
    ///
    /// Deltas drained before a failure are still applied, since the kernel
    /// has already deleted them. The ingress failure wins when both
    /// directions fail; the egress one is logged.
    pub fn drain_tick(&mut self) -> Result<CycleStats, DrainError> {
        let now = self.clock.now();
        let [ingress, egress] = Direction::ALL.map(|direction| self.drainer.drain(direction));

        self.ledger.apply_cycle(now, &ingress.deltas, &egress.deltas);
        let stats = CycleStats {
            ingress_deltas: ingress.deltas.len(),
            egress_deltas: egress.deltas.len(),
        };
        debug!(
            ingress = stats.ingress_deltas,
            egress = stats.egress_deltas,
            "drain cycle applied"
        );

        match (ingress.error, egress.error) {
            (None, None) => Ok(stats),
            (Some(err), None) | (None, Some(err)) => Err(err),
            (Some(err), Some(egress_err)) => {
                warn!(error = %egress_err, "egress drain failed in the same cycle");
                Err(err)
            }
        }
    }

    /// Commits records to the sink and removes them from the ledger.
    ///
    /// A routine pass stops at the first sink error and leaves the rest for
    /// the next tick. A forced pass tries every record.
    pub async fn flush(&self, mode: FlushMode) -> Result<FlushStats, FlushError> {
        let now = self.clock.now();
        let candidates = self.ledger.flush_candidates(now, &self.config.expiry, mode);
        let total = candidates.len();
        let mut stats = FlushStats::default();
        let mut failure: Option<(usize, SinkError)> = None;

        for record in candidates {
            let interval = record.interval();
            if let Err(err) = self.persist(&interval).await {
                if mode == FlushMode::Expired {
                    return Err(FlushError::Aborted {
                        hwaddr: record.hwaddr,
                        flushed: stats.flushed,
                        source: err,
                    });
                }
                error!(hwaddr = %record.hwaddr, error = %err, "failed to persist usage");
                match &mut failure {
                    Some((failed, _)) => *failed += 1,
                    None => failure = Some((1, err)),
                }
                continue;
            }
            if !self.ledger.remove_flushed(&record) {
                warn!(hwaddr = %record.hwaddr, "record changed while being flushed; kept");
            }
            stats.flushed += 1;
        }

        stats.remaining = self.ledger.len();
        match failure {
            Some((failed, source)) => Err(FlushError::Incomplete {
                failed,
                total,
                source,
            }),
            None => Ok(stats),
        }
    }

    async fn persist(&self, interval: &UsageInterval) -> Result<(), SinkError> {
        let call = self.sink.record_usage_interval(interval);
        match self.config.persist_timeout {
            Some(limit) => time::timeout(limit, call)
                .await
                .map_err(|_| SinkError::Timeout(limit))?,
            None => call.await,
        }
    }

    /// Runs the drain and flush timers until `shutdown` resolves, then drains
    /// once more and flushes everything.
    ///
    /// Tick errors are logged and retried on the next tick. Only a failed
    /// final flush is returned.
    pub async fn run<F>(mut self, shutdown: F) -> Result<FlushStats, FlushError>
    where
        F: Future<Output = ()>,
    {
        let mut drain_ticker = time::interval(self.config.drain_interval);
        drain_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush_ticker = time::interval_at(
            time::Instant::now() + self.config.flush_interval,
            self.config.flush_interval,
        );
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            drain_interval = ?self.config.drain_interval,
            flush_interval = ?self.config.flush_interval,
            "usage engine started"
        );
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = drain_ticker.tick() => {
                    if let Err(err) = self.drain_tick() {
                        warn!(error = %err, "drain cycle failed");
                    }
                }
                _ = flush_ticker.tick() => {
                    match self.flush(FlushMode::Expired).await {
                        Ok(stats) if stats.flushed > 0 => info!(
                            flushed = stats.flushed,
                            remaining = stats.remaining,
                            "flushed expired usage"
                        ),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "flush pass aborted"),
                    }
                }
            }
        }

        info!("shutting down, flushing all usage");
        if let Err(err) = self.drain_tick() {
            warn!(error = %err, "final drain cycle failed");
        }
        let stats = self.flush(FlushMode::All).await?;
        info!(flushed = stats.flushed, "final flush complete");
        Ok(stats)
    }
}
