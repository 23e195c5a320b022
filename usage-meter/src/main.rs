use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use chrono::TimeDelta;
use clap::{Args, CommandFactory, Parser, Subcommand};
use tokio::signal::{
    self,
    unix::{SignalKind, signal},
};
use tokio::time;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use usage_meter_common::USAGE_MAP_ENTRIES;

mod drain;
mod ebpf_loader;
mod model;
mod node;
mod sink;
mod store;

use drain::{Drainer, MAX_PAGE_ENTRIES};
use ebpf_loader::{AttachmentManager, DropWatch, EbpfHooks};
use node::{EngineConfig, SystemClock, UsageEngine};
use sink::JsonLinesSink;
use store::{ExpiryPolicy, UsageLedger, log_snapshot};

#[derive(Parser)]
#[command(name = "usage-meter")]
#[command(about = "Per-host traffic usage accounting daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach the usage hooks and account traffic until interrupted
    Run(RunCommand),
}

#[derive(Args)]
struct RunCommand {
    /// Network interface to attach the ingress/egress hooks to
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// File that receives one JSON line per finished usage interval
    #[arg(long, value_name = "PATH")]
    usage_log: PathBuf,
    /// Milliseconds between drains of the kernel counters
    #[arg(long, value_name = "MILLIS", default_value_t = 1000)]
    drain_interval_ms: u64,
    /// Seconds between routine flushes of expired usage
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    flush_interval_secs: u64,
    /// Idle seconds after which a host's interval is closed
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    inactivity_secs: u32,
    /// Maximum interval length in seconds for continuously active hosts
    #[arg(long, value_name = "SECS", default_value_t = 3600)]
    staleness_secs: u32,
    /// Entries requested per batch read of a kernel table
    #[arg(long, value_name = "ENTRIES", default_value_t = USAGE_MAP_ENTRIES as usize)]
    page_size: usize,
    /// Soft limit in milliseconds for draining one table (0 disables)
    #[arg(long, value_name = "MILLIS", default_value_t = 500)]
    drain_deadline_ms: u64,
    /// Milliseconds before a usage store write is abandoned (0 disables)
    #[arg(long, value_name = "MILLIS", default_value_t = 5000)]
    persist_timeout_ms: u64,
    /// Seconds between usage reports in the log (0 disables)
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    report_interval_secs: u64,
}

impl RunCommand {
    fn engine_config(&self) -> Result<EngineConfig> {
        ensure!(self.drain_interval_ms > 0, "drain interval must be greater than zero");
        ensure!(self.flush_interval_secs > 0, "flush interval must be greater than zero");
        ensure!(self.page_size > 0, "page size must be greater than zero");
        ensure!(
            self.page_size <= MAX_PAGE_ENTRIES,
            "page size must not exceed {MAX_PAGE_ENTRIES}"
        );
        Ok(EngineConfig {
            drain_interval: Duration::from_millis(self.drain_interval_ms),
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            expiry: ExpiryPolicy {
                inactivity: TimeDelta::seconds(self.inactivity_secs.into()),
                staleness: TimeDelta::seconds(self.staleness_secs.into()),
            },
            persist_timeout: non_zero_millis(self.persist_timeout_ms),
        })
    }
}

fn non_zero_millis(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run().await {
        eprintln!("usage-meter error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(cmd)) => run_daemon(cmd).await?,
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

async fn run_daemon(cmd: RunCommand) -> Result<()> {
    let config = cmd.engine_config()?;
    let sink = JsonLinesSink::open(&cmd.usage_log)
        .await
        .with_context(|| format!("failed to open usage log {}", cmd.usage_log.display()))?;

    let mut hooks = EbpfHooks::load().context("failed to load usage programs")?;
    let (ingress, egress) = hooks.take_tables().context("failed to open usage maps")?;
    let drops = hooks
        .take_drop_counter()
        .context("failed to open drop counter")?;
    let mut attachments = AttachmentManager::new(hooks);
    attachments
        .attach(&cmd.iface)
        .with_context(|| format!("failed to attach usage hooks to {}", cmd.iface))?;

    let ledger = Arc::new(UsageLedger::new());
    let drainer = Drainer::new(ingress, egress, cmd.page_size)
        .with_deadline(non_zero_millis(cmd.drain_deadline_ms));
    let cycle = config.drain_interval;
    let engine = UsageEngine::new(drainer, ledger.clone(), sink, SystemClock, config);

    let reporter = (cmd.report_interval_secs > 0).then(|| {
        let ledger = ledger.clone();
        let interval = Duration::from_secs(cmd.report_interval_secs);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            let mut watch = DropWatch::default();
            ticker.tick().await;
            loop {
                ticker.tick().await;
                log_snapshot(&ledger.snapshot(), cycle);
                match drops.read() {
                    Ok(total) => {
                        if let Some(fresh) = watch.observe(total) {
                            warn!(fresh, total, "frames too short to account");
                        }
                    }
                    Err(err) => debug!(error = %err, "failed to read drop counter"),
                }
            }
        })
    });

    let flushed = engine.run(shutdown_signal()).await;

    if let Some(reporter) = reporter {
        reporter.abort();
        let _ = reporter.await;
    }
    let detached = attachments.close();

    let stats = flushed.context("final usage flush failed")?;
    detached.context("failed to detach usage hooks")?;
    info!(flushed = stats.flushed, "usage meter stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to wait for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("received shutdown signal, flushing usage...");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> RunCommand {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Some(Commands::Run(cmd)) => cmd,
            None => panic!("expected run command"),
        }
    }

    #[test]
    fn run_defaults_match_engine_defaults() {
        let cmd = parse(&["usage-meter", "run", "--iface", "eth0", "--usage-log", "/tmp/u"]);
        let config = cmd.engine_config().unwrap();
        let defaults = EngineConfig::default();
        assert_eq!(config.drain_interval, defaults.drain_interval);
        assert_eq!(config.flush_interval, defaults.flush_interval);
        assert_eq!(config.expiry.inactivity, defaults.expiry.inactivity);
        assert_eq!(config.expiry.staleness, defaults.expiry.staleness);
        assert_eq!(config.persist_timeout, Some(Duration::from_secs(5)));
        assert_eq!(cmd.page_size, 4096);
    }

    #[test]
    fn zero_periods_are_rejected() {
        let cmd = parse(&[
            "usage-meter",
            "run",
            "--iface",
            "eth0",
            "--usage-log",
            "/tmp/u",
            "--flush-interval-secs",
            "0",
        ]);
        assert!(cmd.engine_config().is_err());
    }

    #[test]
    fn oversized_page_is_rejected() {
        let page = (MAX_PAGE_ENTRIES + 1).to_string();
        let cmd = parse(&[
            "usage-meter",
            "run",
            "--iface",
            "eth0",
            "--usage-log",
            "/tmp/u",
            "--page-size",
            &page,
        ]);
        assert!(cmd.engine_config().is_err());
    }

    #[test]
    fn zero_timeouts_disable_limits() {
        let cmd = parse(&[
            "usage-meter",
            "run",
            "--iface",
            "eth0",
            "--usage-log",
            "/tmp/u",
            "--persist-timeout-ms",
            "0",
        ]);
        assert_eq!(cmd.engine_config().unwrap().persist_timeout, None);
    }
}
