// ABOUTME: Operator repair command: converge rows changed in a trailing window
// ABOUTME: Bypasses the queues entirely, for when capture is known to be broken

use anyhow::{bail, Result};
use clap::Args;

use super::{print_run, ConfigSource};
use crate::replication::{force_sync_latest, RunLedger};

#[derive(Args, Debug)]
pub struct ForceSyncArgs {
    /// Size of the trailing window in hours
    #[arg(long)]
    pub hours: u32,
    /// Limit the pass to one configured table
    #[arg(long)]
    pub table: Option<String>,
}

pub async fn command(source: &ConfigSource, args: ForceSyncArgs) -> Result<()> {
    if args.hours == 0 {
        bail!("--hours must be at least 1");
    }
    let engine = source.engine()?;

    tracing::info!(
        "Forcing window sync of the last {}h ({})",
        args.hours,
        args.table.as_deref().unwrap_or("all tables")
    );
    let run = force_sync_latest(&engine, args.hours, args.table.as_deref()).await;
    if let Err(e) = RunLedger::append(&engine.settings().ledger_path, &run).await {
        tracing::warn!("Failed to record run in ledger: {:#}", e);
    }
    print_run(&run);

    if !run.is_success() {
        bail!("Window sync did not complete ({} errors)", run.errors.len());
    }
    Ok(())
}
