// ABOUTME: Command implementations for each CLI entry point
// ABOUTME: Shared helpers: loading configuration into an engine and printing run reports

pub mod force_sync;
pub mod queue;
pub mod run;
pub mod status;
pub mod triggers;

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::ReplicatorConfig;
use crate::instance::mysql::MySqlConnector;
use crate::replication::{ApplyEngine, DirectionStats, SyncRun};
use crate::utils::strip_password_from_url;

/// Where the configuration comes from, as given on the command line.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    pub local_url: Option<String>,
    pub remote_url: Option<String>,
}

impl ConfigSource {
    /// Read the file, apply URL overrides and validate the result.
    pub fn load(&self) -> Result<ReplicatorConfig> {
        let mut config = ReplicatorConfig::load(&self.path)?;
        if let Some(url) = &self.local_url {
            config.local.url = url.clone();
        }
        if let Some(url) = &self.remote_url {
            config.remote.url = url.clone();
        }
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", self.path))?;
        tracing::debug!(
            "Loaded {} tables; local={}, remote={}",
            config.tables.len(),
            strip_password_from_url(&config.local.url),
            strip_password_from_url(&config.remote.url)
        );
        Ok(config)
    }

    pub fn engine(&self) -> Result<ApplyEngine<MySqlConnector>> {
        let config = self.load()?;
        let connector = MySqlConnector::from_config(&config);
        Ok(ApplyEngine::new(config, connector))
    }
}

fn print_direction(label: &str, stats: &DirectionStats) {
    println!(
        "  {}: {} applied, {} deleted, {} skipped, {} retried, {} failed",
        label, stats.applied, stats.deleted, stats.skipped, stats.retried, stats.failed
    );
    if stats.released > 0 {
        println!("    {} claims released after a lost connection", stats.released);
    }
}

/// Human-readable run summary.
pub fn print_run(run: &SyncRun) {
    println!();
    println!("Run '{}' ({}ms)", run.trigger, run.duration_ms);
    print_direction("local -> remote", &run.local_to_remote);
    print_direction("remote -> local", &run.remote_to_local);
    if !run.local_reachable {
        println!("  local instance unreachable");
    }
    if !run.remote_reachable {
        println!("  remote instance unreachable");
    }
    if !run.errors.is_empty() {
        println!("  Errors ({}):", run.errors.len());
        for err in &run.errors {
            println!("    - {}", err);
        }
    }
}
