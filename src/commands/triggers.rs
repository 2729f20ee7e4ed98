// ABOUTME: Trigger management commands: install/repair capture triggers and probe capture
// ABOUTME: Both act on the local and the remote instance

use anyhow::{bail, Result};
use clap::Args;

use super::ConfigSource;
use crate::instance::ProbeOutcome;

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Only this configured table
    #[arg(long)]
    pub table: Option<String>,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Only this configured table
    #[arg(long)]
    pub table: Option<String>,
    /// Emit the probe reports as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn install(source: &ConfigSource, args: InstallArgs) -> Result<()> {
    let engine = source.engine()?;
    let outcome = engine.install_or_repair_triggers(args.table.as_deref()).await?;

    for report in &outcome.reports {
        println!(
            "{} {}: {} ({})",
            report.side,
            report.table,
            report.triggers.join(", "),
            if report.multiple_triggers {
                "multiple triggers"
            } else {
                "single trigger per event"
            }
        );
        if !report.merged.is_empty() {
            println!("  merged: {}", report.merged.join(", "));
        }
        if !report.repaired_definers.is_empty() {
            println!("  definer repaired: {}", report.repaired_definers.join(", "));
        }
    }
    for err in &outcome.errors {
        println!("error: {}", err);
    }

    if !outcome.errors.is_empty() {
        bail!("Trigger installation incomplete ({} errors)", outcome.errors.len());
    }
    Ok(())
}

pub async fn probe(source: &ConfigSource, args: ProbeArgs) -> Result<()> {
    let engine = source.engine()?;
    let outcome = engine.probe(args.table.as_deref()).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        for report in &outcome.reports {
            let state = match report.outcome {
                Some(ProbeOutcome::Captured) => "captured",
                Some(ProbeOutcome::Missing) => "NOT CAPTURED",
                Some(ProbeOutcome::NoRows) => "no rows to probe",
                None => "probe failed",
            };
            println!("{} {}: {}", report.side, report.table, state);
            for gap in &report.gaps {
                println!("  - {}", gap);
            }
        }
        for err in outcome.errors.iter().filter(|e| e.is_run_level()) {
            println!("error: {}", err);
        }
    }

    if !outcome.errors.is_empty() {
        bail!(
            "Capture problems found ({}); run install-triggers or force-sync",
            outcome.errors.len()
        );
    }
    Ok(())
}
