// ABOUTME: Queue diagnostics: list entries, reset failed entries, prune finished ones
// ABOUTME: Operates on one instance or both

use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};

use super::ConfigSource;
use crate::instance::Side;
use crate::replication::QueueStatus;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum SideArg {
    Local,
    Remote,
    Both,
}

impl SideArg {
    fn sides(self) -> Vec<Side> {
        match self {
            SideArg::Local => vec![Side::Local],
            SideArg::Remote => vec![Side::Remote],
            SideArg::Both => vec![Side::Local, Side::Remote],
        }
    }
}

#[derive(Args, Debug)]
pub struct QueueArgs {
    #[command(subcommand)]
    command: QueueCommands,
}

#[derive(Subcommand, Debug)]
enum QueueCommands {
    /// Show queue entries, newest first
    List {
        #[arg(long, value_enum, default_value = "both")]
        side: SideArg,
        /// pending, processing, done or failed
        #[arg(long)]
        status: Option<QueueStatus>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Return failed entries to pending with their attempts reset
    RetryFailed {
        #[arg(long, value_enum, default_value = "both")]
        side: SideArg,
        #[arg(long)]
        table: Option<String>,
    },
    /// Delete done entries older than the given number of days
    Prune {
        #[arg(long, value_enum, default_value = "both")]
        side: SideArg,
        /// Defaults to sync.done_retention_days
        #[arg(long)]
        days: Option<u32>,
    },
}

pub async fn command(source: &ConfigSource, args: QueueArgs) -> Result<()> {
    let engine = source.engine()?;
    match args.command {
        QueueCommands::List {
            side,
            status,
            limit,
            json,
        } => {
            for side in side.sides() {
                let entries = engine
                    .queue_entries(side, status, limit)
                    .await
                    .with_context(|| format!("Failed to list queue on {}", side))?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                    continue;
                }
                println!("{} ({} entries)", side, entries.len());
                for entry in entries {
                    println!(
                        "  #{:<8} {:<9} {:<6} {}:{} attempts={} {}",
                        entry.id,
                        entry.status,
                        entry.operation,
                        entry.table_name,
                        entry.record_id,
                        entry.attempts,
                        entry.error_message.unwrap_or_default()
                    );
                }
            }
        }
        QueueCommands::RetryFailed { side, table } => {
            for side in side.sides() {
                let reset = engine
                    .retry_failed(side, table.as_deref())
                    .await
                    .with_context(|| format!("Failed to reset failed entries on {}", side))?;
                println!("{}: {} entries returned to pending", side, reset);
            }
        }
        QueueCommands::Prune { side, days } => {
            let days = days.unwrap_or(engine.settings().done_retention_days);
            for side in side.sides() {
                let pruned = engine
                    .prune_done(side, days)
                    .await
                    .with_context(|| format!("Failed to prune queue on {}", side))?;
                println!("{}: {} done entries removed", side, pruned);
            }
        }
    }
    Ok(())
}
