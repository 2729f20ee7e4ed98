// ABOUTME: Status command: queue health per instance plus the last successful run
// ABOUTME: The --json form is the contract dashboards read

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use super::ConfigSource;
use crate::replication::engine::{ReplicatedTable, ResolvedKey, SideHealth};
use crate::replication::ledger::RunRecord;
use crate::replication::RunLedger;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit JSON instead of text
    #[arg(long)]
    pub json: bool,
    /// Also resolve and list each table's key on both instances
    #[arg(long)]
    pub tables: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub instances: Vec<SideHealth>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_run: Option<RunRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<ReplicatedTable>>,
}

fn describe_key(key: &ResolvedKey) -> String {
    match key {
        ResolvedKey::Resolved { table, key_column } => format!("{}.{}", table, key_column),
        ResolvedKey::Unresolved { error } => format!("unresolved ({})", error),
        ResolvedKey::Unreachable { .. } => "unreachable".to_string(),
    }
}

pub async fn command(source: &ConfigSource, args: StatusArgs) -> Result<()> {
    let engine = source.engine()?;
    let ledger = match RunLedger::load_or_default(&engine.settings().ledger_path).await {
        Ok(ledger) => ledger,
        Err(e) => {
            tracing::warn!("Ignoring unreadable run ledger: {:#}", e);
            RunLedger::new()
        }
    };

    let report = StatusReport {
        instances: engine.queue_health().await,
        last_success_at: ledger.last_success_at(),
        last_run: ledger.last_run.clone(),
        tables: if args.tables {
            Some(engine.replicated_tables().await)
        } else {
            None
        },
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for instance in &report.instances {
        match (&instance.health, &instance.error) {
            (Some(health), _) => {
                let age = health
                    .oldest_pending_age_secs
                    .map(|secs| format!("{}s", secs))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<7} pending {:>6}  processing {:>4}  failed {:>4}  oldest pending {}",
                    instance.side, health.pending, health.processing, health.failed, age
                );
            }
            (None, Some(error)) => println!("{:<7} {}", instance.side, error),
            (None, None) => println!("{:<7} no data", instance.side),
        }
    }
    match report.last_success_at {
        Some(at) => println!("Last successful run: {}", at.to_rfc3339()),
        None => println!("Last successful run: never"),
    }
    if let Some(last) = &report.last_run {
        if !last.success {
            println!(
                "Last run '{}' at {} was incomplete ({} errors)",
                last.trigger,
                last.finished_at.to_rfc3339(),
                last.errors
            );
        }
    }
    if let Some(tables) = &report.tables {
        println!();
        for table in tables {
            println!(
                "{}{}: local {}, remote {}",
                table.name,
                if table.enabled { "" } else { " (disabled)" },
                describe_key(&table.local),
                describe_key(&table.remote)
            );
        }
    }
    Ok(())
}
