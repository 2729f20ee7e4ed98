// ABOUTME: Scheduled entry point: runs the apply engine at a fixed interval until shutdown
// ABOUTME: Records every run in the run ledger so health checks see the last successful sync

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::interval;

use super::engine::{ApplyEngine, SyncRun};
use super::ledger::RunLedger;
use crate::instance::Connector;

/// Configuration for the Scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between runs
    pub interval: Duration,
    /// Where each run is recorded
    pub ledger_path: PathBuf,
    /// Trigger label passed to every run
    pub label: String,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &crate::config::SyncSettings) -> Self {
        Self {
            interval: settings.interval(),
            ledger_path: settings.ledger_path.clone(),
            label: "scheduled".to_string(),
        }
    }
}

pub struct Scheduler<'a, C: Connector> {
    engine: &'a ApplyEngine<C>,
    config: SchedulerConfig,
}

impl<'a, C: Connector> Scheduler<'a, C> {
    pub fn new(engine: &'a ApplyEngine<C>, config: SchedulerConfig) -> Self {
        Self { engine, config }
    }

    /// One run, recorded in the ledger. A ledger write failure is logged and
    /// does not fail the run.
    pub async fn run_once(&self) -> SyncRun {
        let run = self.engine.run_sync(&self.config.label).await;
        if let Err(e) = RunLedger::append(&self.config.ledger_path, &run).await {
            tracing::warn!("Failed to record run in ledger: {:#}", e);
        }
        run
    }

    /// Run until `shutdown` fires. The first run starts immediately.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = interval(self.config.interval);
        let mut cycles = 0u64;

        tracing::info!(
            "Starting scheduler with interval={:?}, ledger={:?}",
            self.config.interval,
            self.config.ledger_path
        );

        loop {
            tokio::select! {
                biased; // Check shutdown first

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping scheduler");
                    break;
                }
                _ = ticker.tick() => {
                    cycles += 1;
                    tracing::debug!("Starting scheduled run {}", cycles);

                    // An interrupted run leaves its remaining entries pending.
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("Shutdown signal received during run {}, aborting", cycles);
                            break;
                        }
                        run = self.run_once() => {
                            if !run.is_success() {
                                tracing::warn!(
                                    "Scheduled run {} incomplete: {} errors",
                                    cycles,
                                    run.errors.len()
                                );
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReplicatorConfig, SyncSettings};
    use crate::instance::memory::MemoryConnector;
    use tempfile::tempdir;

    #[test]
    fn test_config_from_settings() {
        let settings = SyncSettings::default();
        let config = SchedulerConfig::from_settings(&settings);
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.label, "scheduled");
    }

    #[tokio::test]
    async fn test_runs_until_shutdown_and_records_ledger() {
        let dir = tempdir().unwrap();
        let ledger_path = dir.path().join("ledger.json");
        let engine = ApplyEngine::new(ReplicatorConfig::new(Vec::new()), MemoryConnector::new());
        let scheduler = Scheduler::new(
            &engine,
            SchedulerConfig {
                interval: Duration::from_millis(20),
                ledger_path: ledger_path.clone(),
                label: "scheduled".to_string(),
            },
        );

        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(70)).await;
            tx.send(()).unwrap();
        };
        let (result, _) = tokio::join!(scheduler.run(rx), stop);
        result.unwrap();

        let ledger = RunLedger::load(&ledger_path).await.unwrap();
        assert_eq!(ledger.last_run.as_ref().unwrap().trigger, "scheduled");
        assert!(ledger.last_success_at().is_some());
    }
}
