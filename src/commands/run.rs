// ABOUTME: Queue-draining commands: one-off run, the inline hook and the scheduler loop
// ABOUTME: Each run is recorded in the run ledger

use anyhow::{bail, Result};
use clap::Args;
use std::time::Duration;

use super::{print_run, ConfigSource};
use crate::replication::{sync_on_page_load, RunLedger, Scheduler, SchedulerConfig};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Trigger label recorded with the run
    #[arg(long, default_value = "cron")]
    pub label: String,
}

#[derive(Args, Debug)]
pub struct HookArgs {
    /// Trigger label recorded with the run (usually the page or action)
    #[arg(long)]
    pub label: String,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Seconds between runs (defaults to sync.interval_secs)
    #[arg(long)]
    pub interval: Option<u64>,
}

/// One authoritative run. Fails when the run was incomplete so cron notices.
pub async fn run(source: &ConfigSource, args: RunArgs) -> Result<()> {
    let engine = source.engine()?;
    let run = engine.run_sync(&args.label).await;
    if let Err(e) = RunLedger::append(&engine.settings().ledger_path, &run).await {
        tracing::warn!("Failed to record run in ledger: {:#}", e);
    }
    print_run(&run);
    if !run.is_success() {
        bail!("Sync run '{}' did not complete ({} errors)", run.trigger, run.errors.len());
    }
    Ok(())
}

/// Inline hook: never fails the caller.
pub async fn hook(source: &ConfigSource, args: HookArgs) -> Result<()> {
    let engine = match source.engine() {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("Inline sync skipped: {:#}", e);
            return Ok(());
        }
    };
    if let Some(run) = sync_on_page_load(&engine, &args.label).await {
        if let Err(e) = RunLedger::append(&engine.settings().ledger_path, &run).await {
            tracing::warn!("Failed to record run in ledger: {:#}", e);
        }
        for err in &run.errors {
            tracing::warn!("{}", err);
        }
    }
    Ok(())
}

pub async fn watch(source: &ConfigSource, args: WatchArgs) -> Result<()> {
    let engine = source.engine()?;
    let mut config = SchedulerConfig::from_settings(engine.settings());
    if let Some(secs) = args.interval {
        if secs == 0 {
            bail!("--interval must be at least 1 second");
        }
        config.interval = Duration::from_secs(secs);
    }

    tracing::info!("Starting scheduled sync every {:?}", config.interval);
    println!("Syncing every {}s. Press Ctrl+C to stop.", config.interval.as_secs());

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    // A closed channel reads as shutdown, so the sender must outlive the loop.
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
        }
        let _ = signal_tx.send(());
    });

    let result = Scheduler::new(&engine, config).run(shutdown_rx).await;
    drop(shutdown_tx);
    result
}
