// ABOUTME: TOML configuration for the two instances, the replicated tables and run tuning
// ABOUTME: Validates identifiers and bounds at load time so the engine can trust them

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::instance::Side;
use crate::utils::{validate_identifier, validate_source_target_different};

/// Default location of the configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "replicator.toml";

/// Top-level configuration, as read from `replicator.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicatorConfig {
    /// The on-premises instance next to the point-of-sale hardware.
    pub local: InstanceConfig,
    /// The hosted instance backing the public website.
    pub remote: InstanceConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    /// Tables kept in sync between the two instances.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    /// mysql:// connection URL. May be left empty and supplied via the CLI/env.
    #[serde(default)]
    pub url: String,
    /// A `user@host` known to exist on this instance, used when recreating
    /// triggers whose recorded definer is invalid here.
    #[serde(default)]
    pub definer: Option<String>,
    /// Force (or forbid) multiple triggers per table/event. Detected from the
    /// server version when absent.
    #[serde(default)]
    pub multiple_triggers: Option<bool>,
}

/// Run tuning shared by every entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Maximum queue entries drained per side per scheduled/manual run.
    pub batch_size: usize,
    /// Retries allowed after the first failed apply; an entry is marked
    /// `failed` once its attempts exceed this.
    pub max_retries: u32,
    /// Session variable acting as the loop guard (without the leading `@`).
    pub loop_guard: String,
    pub queue_table: String,
    /// Entries stuck in `processing` longer than this are returned to `pending`.
    pub claim_timeout_secs: u64,
    /// Batch size used by the inline hook called from web requests.
    pub inline_batch_size: usize,
    /// Time budget of the inline hook.
    pub inline_budget_ms: u64,
    /// Interval of the scheduled job.
    pub interval_secs: u64,
    /// Default last-modified column used by the window reconciler.
    pub timestamp_column: String,
    pub connect_timeout_secs: u64,
    /// Connection retries for scheduled and manual runs (the inline hook never retries).
    pub connect_retries: u32,
    pub ledger_path: PathBuf,
    /// Age after which `done` entries may be pruned.
    pub done_retention_days: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 200,
            max_retries: 5,
            loop_guard: "sync_in_progress".to_string(),
            queue_table: "sync_queue".to_string(),
            claim_timeout_secs: 600,
            inline_batch_size: 25,
            inline_budget_ms: 1500,
            interval_secs: 60,
            timestamp_column: "updated_at".to_string(),
            connect_timeout_secs: 5,
            connect_retries: 2,
            ledger_path: PathBuf::from(".booking-replicator/ledger.json"),
            done_retention_days: 7,
        }
    }
}

impl SyncSettings {
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }

    pub fn inline_budget(&self) -> Duration {
        Duration::from_millis(self.inline_budget_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// One replicated table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,
    /// Expected identifier column, used only when an instance declares no
    /// usable key. Matched case-insensitively.
    #[serde(default)]
    pub key_hint: Option<String>,
    /// Overrides `sync.timestamp_column` for the window reconciler.
    #[serde(default)]
    pub timestamp_column: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TableConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            key_hint: None,
            timestamp_column: None,
            enabled: true,
        }
    }

    pub fn with_key_hint(mut self, hint: &str) -> Self {
        self.key_hint = Some(hint.to_string());
        self
    }
}

impl ReplicatorConfig {
    /// Build a configuration in code (tests, embedding callers).
    pub fn new(tables: Vec<TableConfig>) -> Self {
        Self {
            local: InstanceConfig::default(),
            remote: InstanceConfig::default(),
            sync: SyncSettings::default(),
            tables,
        }
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;
        let config = Self::parse(&contents)
            .with_context(|| format!("Invalid configuration in {:?}", path))?;
        Ok(config)
    }

    /// Parse configuration text. Validation of URLs is deferred to
    /// [`ReplicatorConfig::validate`] because they may be supplied later.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: ReplicatorConfig =
            toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate_settings()?;
        Ok(config)
    }

    pub fn instance(&self, side: Side) -> &InstanceConfig {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    /// Tables that take part in replication.
    pub fn enabled_tables(&self) -> impl Iterator<Item = &TableConfig> {
        self.tables.iter().filter(|t| t.enabled)
    }

    /// Find a configured, enabled table by name (case-insensitive, since the
    /// instances disagree on table-name casing as well).
    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.enabled_tables()
            .find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Full validation, including both connection URLs.
    pub fn validate(&self) -> Result<()> {
        self.validate_settings()?;
        if self.local.url.is_empty() {
            bail!("No local instance URL configured (set [local].url or --local-url)");
        }
        if self.remote.url.is_empty() {
            bail!("No remote instance URL configured (set [remote].url or --remote-url)");
        }
        validate_source_target_different(&self.local.url, &self.remote.url)?;
        Ok(())
    }

    fn validate_settings(&self) -> Result<()> {
        let sync = &self.sync;
        validate_identifier(&sync.loop_guard).context("Invalid sync.loop_guard")?;
        validate_identifier(&sync.queue_table).context("Invalid sync.queue_table")?;
        validate_identifier(&sync.timestamp_column).context("Invalid sync.timestamp_column")?;
        if sync.batch_size == 0 {
            bail!("sync.batch_size must be at least 1");
        }
        if sync.inline_batch_size == 0 {
            bail!("sync.inline_batch_size must be at least 1");
        }
        if sync.max_retries == 0 {
            bail!("sync.max_retries must be at least 1");
        }
        if sync.interval_secs == 0 {
            bail!("sync.interval_secs must be at least 1");
        }

        let mut seen: Vec<String> = Vec::new();
        for table in &self.tables {
            validate_identifier(&table.name)
                .with_context(|| format!("Invalid table name '{}'", table.name))?;
            if let Some(hint) = &table.key_hint {
                validate_identifier(hint)
                    .with_context(|| format!("Invalid key_hint for table '{}'", table.name))?;
            }
            if let Some(column) = &table.timestamp_column {
                validate_identifier(column).with_context(|| {
                    format!("Invalid timestamp_column for table '{}'", table.name)
                })?;
            }
            if table.name.eq_ignore_ascii_case(&sync.queue_table) {
                bail!(
                    "Table '{}' is the queue table and cannot be replicated",
                    table.name
                );
            }
            let lowered = table.name.to_lowercase();
            if seen.contains(&lowered) {
                bail!("Table '{}' is configured more than once", table.name);
            }
            seen.push(lowered);
        }

        for side in [Side::Local, Side::Remote] {
            if let Some(definer) = &self.instance(side).definer {
                validate_definer(definer)
                    .with_context(|| format!("Invalid [{}].definer", side))?;
            }
        }

        Ok(())
    }
}

/// Definers are `user@host`; both halves must be plain identifiers, `%` and
/// `.` are allowed in the host.
fn validate_definer(definer: &str) -> Result<()> {
    let (user, host) = definer
        .split_once('@')
        .ok_or_else(|| anyhow::anyhow!("Definer '{}' must be user@host", definer))?;
    validate_identifier(user)?;
    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '%' | '.' | '_' | '-'))
    {
        bail!("Definer host '{}' contains invalid characters", host);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [local]
        url = "mysql://pos:pw@10.0.0.5/huts"

        [remote]
        url = "mysql://web:pw@db.example.com/huts"
        definer = "web@%"
        multiple_triggers = false

        [sync]
        batch_size = 50
        max_retries = 3

        [[tables]]
        name = "Guests"

        [[tables]]
        name = "Reservations"
        key_hint = "ID"
        timestamp_column = "modified"

        [[tables]]
        name = "Rooms"
        enabled = false
    "#;

    #[test]
    fn test_parse_sample() {
        let config = ReplicatorConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.loop_guard, "sync_in_progress");
        assert_eq!(config.remote.definer.as_deref(), Some("web@%"));
        assert_eq!(config.remote.multiple_triggers, Some(false));
        assert_eq!(config.enabled_tables().count(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_table_lookup_is_case_insensitive() {
        let config = ReplicatorConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.table("guests").unwrap().name, "Guests");
        assert_eq!(
            config.table("RESERVATIONS").unwrap().key_hint.as_deref(),
            Some("ID")
        );
        assert!(config.table("Rooms").is_none());
    }

    #[test]
    fn test_defaults() {
        let settings = SyncSettings::default();
        assert_eq!(settings.batch_size, 200);
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.queue_table, "sync_queue");
        assert_eq!(settings.inline_budget(), Duration::from_millis(1500));
    }

    #[test]
    fn test_rejects_bad_table_name() {
        let text = r#"
            [local]
            [remote]
            [[tables]]
            name = "Guests; DROP TABLE x"
        "#;
        assert!(ReplicatorConfig::parse(text).is_err());
    }

    #[test]
    fn test_rejects_zero_retries() {
        let text = r#"
            [local]
            [remote]
            [sync]
            max_retries = 0
        "#;
        let err = ReplicatorConfig::parse(text).unwrap_err();
        assert!(format!("{:#}", err).contains("sync.max_retries must be at least 1"));
    }

    #[test]
    fn test_rejects_duplicate_tables() {
        let text = r#"
            [local]
            [remote]
            [[tables]]
            name = "Guests"
            [[tables]]
            name = "guests"
        "#;
        let err = ReplicatorConfig::parse(text).unwrap_err();
        assert!(format!("{:#}", err).contains("more than once"));
    }

    #[test]
    fn test_rejects_replicating_queue_table() {
        let text = r#"
            [local]
            [remote]
            [[tables]]
            name = "sync_queue"
        "#;
        assert!(ReplicatorConfig::parse(text).is_err());
    }

    #[test]
    fn test_validate_requires_urls() {
        let config = ReplicatorConfig::new(vec![TableConfig::new("Guests")]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("local instance URL"));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let text = r#"
            [local]
            [remote]
            [sync]
            batchsize = 10
        "#;
        assert!(ReplicatorConfig::parse(text).is_err());
    }

    #[test]
    fn test_definer_validation() {
        assert!(validate_definer("web@%").is_ok());
        assert!(validate_definer("pos@10.0.0.5").is_ok());
        assert!(validate_definer("web").is_err());
        assert!(validate_definer("web@host'; --").is_err());
    }
}
