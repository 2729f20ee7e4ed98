// ABOUTME: Run ledger persisted as JSON: the last run and the last successful run
// ABOUTME: Feeds the "last successful run" field of the health contract

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::fs;

use crate::replication::engine::SyncRun;

/// Summary of one run as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub trigger: String,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub applied_to_remote: u64,
    pub applied_to_local: u64,
    pub failed: u64,
    pub errors: usize,
    pub success: bool,
}

impl RunRecord {
    pub fn from_run(run: &SyncRun) -> Self {
        Self {
            trigger: run.trigger.clone(),
            finished_at: run.started_at + chrono::Duration::milliseconds(run.duration_ms as i64),
            duration_ms: run.duration_ms,
            applied_to_remote: run.local_to_remote.changes(),
            applied_to_local: run.remote_to_local.changes(),
            failed: run.local_to_remote.failed + run.remote_to_local.failed,
            errors: run.errors.len(),
            success: run.is_success(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLedger {
    pub last_run: Option<RunRecord>,
    pub last_success: Option<RunRecord>,
    /// Version of the ledger format
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl RunLedger {
    pub fn new() -> Self {
        Self {
            last_run: None,
            last_success: None,
            version: default_version(),
        }
    }

    /// Record a finished run.
    pub fn record(&mut self, run: &SyncRun) {
        let record = RunRecord::from_run(run);
        if record.success {
            self.last_success = Some(record.clone());
        }
        self.last_run = Some(record);
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success.as_ref().map(|r| r.finished_at)
    }

    /// Load the ledger from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read run ledger from {:?}", path))?;
        let ledger: RunLedger = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse run ledger from {:?}", path))?;
        Ok(ledger)
    }

    /// Load the ledger, starting fresh when the file does not exist yet.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            Ok(Self::new())
        }
    }

    /// Save the ledger to a JSON file. The file is replaced by rename, so a
    /// concurrent reader or writer never sees a partial ledger.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize run ledger")?;
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || replace_file(&target, contents.as_bytes()))
            .await
            .context("Run ledger write task failed")?
            .with_context(|| format!("Failed to write run ledger to {:?}", path))?;
        Ok(())
    }

    /// Load, record and save in one step.
    pub async fn append(path: &Path, run: &SyncRun) -> Result<Self> {
        let mut ledger = Self::load_or_default(path).await?;
        ledger.record(run);
        ledger.save(path).await?;
        Ok(ledger)
    }
}

/// Write `contents` to a temporary file beside `path`, then rename it over `path`.
fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::instance::Side;
    use crate::replication::engine::DirectionStats;
    use tempfile::tempdir;

    fn run(success: bool) -> SyncRun {
        let mut run = SyncRun::new("scheduled");
        run.local_to_remote = DirectionStats {
            applied: 3,
            deleted: 1,
            ..Default::default()
        };
        if !success {
            run.remote_reachable = false;
            run.errors.push(SyncError::Connectivity {
                side: Side::Remote,
                message: "timed out".into(),
            });
        }
        run
    }

    #[test]
    fn test_record_keeps_last_success() {
        let mut ledger = RunLedger::new();
        ledger.record(&run(true));
        ledger.record(&run(false));

        let last = ledger.last_run.as_ref().unwrap();
        assert!(!last.success);
        let success = ledger.last_success.as_ref().unwrap();
        assert!(success.success);
        assert_eq!(success.applied_to_remote, 4);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.json");

        let ledger = RunLedger::append(&path, &run(true)).await.unwrap();
        let loaded = RunLedger::load(&path).await.unwrap();
        assert_eq!(ledger, loaded);
        assert!(loaded.last_success_at().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_leave_a_readable_ledger() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let mut writers = Vec::new();
        for i in 0..16 {
            let path = path.clone();
            writers.push(tokio::spawn(async move {
                // Racing appends may drop each other's record, never corrupt the file.
                RunLedger::append(&path, &run(i % 2 == 0)).await.unwrap();
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let loaded = RunLedger::load(&path).await.unwrap();
        assert!(loaded.last_run.is_some());
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("ledger.json")]);
    }

    #[tokio::test]
    async fn test_missing_file_starts_fresh() {
        let dir = tempdir().unwrap();
        let ledger = RunLedger::load_or_default(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(ledger.last_run.is_none());
        assert_eq!(ledger.version, 1);
    }
}
