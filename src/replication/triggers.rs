// ABOUTME: Capture trigger DDL: rendering, idempotent install, single-trigger merging and definer repair
// ABOUTME: Also inspects installed triggers to report capture gaps

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::config::{InstanceConfig, SyncSettings, TableConfig};
use crate::instance::{Instance, Side, TriggerInfo};
use crate::replication::queue::Operation;
use crate::replication::resolver::TableKey;
use crate::utils::{quote_literal, quote_mysql_ident};

pub const MERGED_BEGIN: &str = "/* merged:begin */";
pub const MERGED_END: &str = "/* merged:end */";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TriggerTiming {
    Before,
    After,
}

impl TriggerTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerTiming::Before => "BEFORE",
            TriggerTiming::After => "AFTER",
        }
    }
}

impl FromStr for TriggerTiming {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "BEFORE" => Ok(TriggerTiming::Before),
            "AFTER" => Ok(TriggerTiming::After),
            other => Err(anyhow!("unknown trigger timing: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
}

/// The three capture triggers of every replicated table.
pub const CAPTURE_EVENTS: [TriggerEvent; 3] =
    [TriggerEvent::Insert, TriggerEvent::Update, TriggerEvent::Delete];

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::Insert => "INSERT",
            TriggerEvent::Update => "UPDATE",
            TriggerEvent::Delete => "DELETE",
        }
    }

    /// Deletes are captured before the row disappears, the rest after.
    pub fn capture_timing(&self) -> TriggerTiming {
        match self {
            TriggerEvent::Delete => TriggerTiming::Before,
            _ => TriggerTiming::After,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            TriggerEvent::Insert => Operation::Insert,
            TriggerEvent::Update => Operation::Update,
            TriggerEvent::Delete => Operation::Delete,
        }
    }
}

impl FromStr for TriggerEvent {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(TriggerEvent::Insert),
            "UPDATE" => Ok(TriggerEvent::Update),
            "DELETE" => Ok(TriggerEvent::Delete),
            other => Err(anyhow!("unknown trigger event: {other}")),
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a capture trigger writes into the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSpec {
    pub queue_table: String,
    pub loop_guard: String,
    /// Value written to `table_name`: the configured table name.
    pub table_label: String,
    pub key_column: String,
    /// Columns snapshotted into `old_data` on delete. Empty when the
    /// instance has no JSON_OBJECT.
    pub snapshot_columns: Vec<String>,
}

/// A trigger to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDefinition {
    pub name: String,
    pub table: String,
    pub timing: TriggerTiming,
    pub event: TriggerEvent,
    /// `user@host`, or `None` to run as CURRENT_USER.
    pub definer: Option<String>,
    /// Full action statement (`BEGIN ... END`).
    pub body: String,
    /// Set for capture triggers; `None` when restoring a foreign trigger.
    pub capture: Option<CaptureSpec>,
}

impl TriggerDefinition {
    pub fn create_sql(&self) -> String {
        let definer = match &self.definer {
            Some(definer) => format!("DEFINER={} ", render_definer(definer)),
            None => String::new(),
        };
        format!(
            "CREATE {}TRIGGER {} {} {} ON {} FOR EACH ROW {}",
            definer,
            quote_mysql_ident(&self.name),
            self.timing.as_str(),
            self.event.as_str(),
            quote_mysql_ident(&self.table),
            self.body
        )
    }
}

/// Result of installing the triggers of one table on one instance.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerReport {
    pub side: Side,
    pub table: String,
    pub triggers: Vec<String>,
    /// Foreign triggers folded into a capture trigger's preamble.
    pub merged: Vec<String>,
    /// Capture triggers recreated because their definer did not exist.
    pub repaired_definers: Vec<String>,
    pub multiple_triggers: bool,
    pub definer: Option<String>,
}

pub fn trigger_name(table: &str, event: TriggerEvent) -> String {
    format!("{}_queue_{}", table, event.as_str().to_ascii_lowercase())
}

/// `user@host` -> `` `user`@`host` ``.
pub fn render_definer(definer: &str) -> String {
    match definer.rsplit_once('@') {
        Some((user, host)) => format!(
            "{}@{}",
            quote_mysql_ident(user.trim_matches('`')),
            quote_mysql_ident(host.trim_matches('`'))
        ),
        None => quote_mysql_ident(definer),
    }
}

/// Parse `8.0.36`, `5.6.51-log`, `10.4.27-MariaDB-log` (optionally with the
/// `5.5.5-` replication prefix) into (is_mariadb, major, minor, patch).
fn parse_version(version: &str) -> Option<(bool, u32, u32, u32)> {
    let mariadb = version.to_ascii_lowercase().contains("mariadb");
    let trimmed = if mariadb {
        version.strip_prefix("5.5.5-").unwrap_or(version)
    } else {
        version
    };
    let numeric: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.').map(|p| p.parse::<u32>().ok());
    let major = parts.next().flatten()?;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((mariadb, major, minor, patch))
}

/// Multiple triggers per table, timing and event: MySQL 5.7.2+, MariaDB 10.2.3+.
///
/// Unparseable versions are treated as unsupported; merged triggers work
/// everywhere.
pub fn supports_multiple_triggers(version: &str) -> bool {
    match parse_version(version) {
        Some((true, major, minor, patch)) => (major, minor, patch) >= (10, 2, 3),
        Some((false, major, minor, patch)) => (major, minor, patch) >= (5, 7, 2),
        None => false,
    }
}

/// JSON_OBJECT(): MySQL 5.7.8+, MariaDB 10.2.3+.
pub fn supports_json_object(version: &str) -> bool {
    match parse_version(version) {
        Some((true, major, minor, patch)) => (major, minor, patch) >= (10, 2, 3),
        Some((false, major, minor, patch)) => (major, minor, patch) >= (5, 7, 8),
        None => false,
    }
}

fn enqueue_statement(spec: &CaptureSpec, row: &str, operation: Operation, snapshot: bool) -> String {
    let old_data = if snapshot && !spec.snapshot_columns.is_empty() {
        let pairs: Vec<String> = spec
            .snapshot_columns
            .iter()
            .map(|c| format!("{}, {}.{}", quote_literal(c), row, quote_mysql_ident(c)))
            .collect();
        format!("JSON_OBJECT({})", pairs.join(", "))
    } else {
        "NULL".to_string()
    };
    format!(
        "INSERT INTO {} (table_name, record_id, operation, old_data) VALUES ({}, {}.{}, {}, {});",
        quote_mysql_ident(&spec.queue_table),
        quote_literal(&spec.table_label),
        row,
        quote_mysql_ident(&spec.key_column),
        quote_literal(operation.as_str()),
        old_data
    )
}

/// The enqueue statements for one event. An update that changes the key
/// also queues a delete of the old key, ahead of the update.
pub fn capture_statement(spec: &CaptureSpec, event: TriggerEvent) -> String {
    match event {
        TriggerEvent::Insert => enqueue_statement(spec, "NEW", Operation::Insert, false),
        TriggerEvent::Delete => enqueue_statement(spec, "OLD", Operation::Delete, true),
        TriggerEvent::Update => {
            let key = quote_mysql_ident(&spec.key_column);
            format!(
                "IF NOT (OLD.{key} <=> NEW.{key}) THEN\n      {}\n    END IF;\n    {}",
                enqueue_statement(spec, "OLD", Operation::Delete, true),
                enqueue_statement(spec, "NEW", Operation::Update, false),
                key = key
            )
        }
    }
}

/// Capture trigger body, with an optional preamble carrying the statements
/// of foreign triggers merged into it.
pub fn render_body(spec: &CaptureSpec, event: TriggerEvent, preamble: Option<&str>) -> String {
    let mut body = String::from("BEGIN\n");
    if let Some(preamble) = preamble.filter(|p| !p.trim().is_empty()) {
        body.push_str(MERGED_BEGIN);
        body.push('\n');
        body.push_str(preamble.trim());
        body.push('\n');
        body.push_str(MERGED_END);
        body.push('\n');
    }
    body.push_str(&format!(
        "  IF @{} IS NULL THEN\n    {}\n  END IF;\nEND",
        spec.loop_guard,
        capture_statement(spec, event)
    ));
    body
}

/// The merged preamble of a capture trigger, if any.
pub fn extract_preamble(body: &str) -> Option<String> {
    let start = body.find(MERGED_BEGIN)? + MERGED_BEGIN.len();
    let end = body[start..].find(MERGED_END)? + start;
    let preamble = body[start..end].trim();
    if preamble.is_empty() {
        None
    } else {
        Some(preamble.to_string())
    }
}

/// Turn a foreign trigger's action statement into preamble statements:
/// strip an outer `BEGIN ... END` and terminate with `;`.
pub fn merge_statements(body: &str) -> String {
    let trimmed = body.trim();
    let upper = trimmed.to_ascii_uppercase();
    let inner = if upper.starts_with("BEGIN") && upper.ends_with("END") {
        trimmed[5..trimmed.len() - 3].trim()
    } else {
        trimmed
    };
    let inner = inner.trim_end_matches(';').trim_end();
    format!("{};", inner)
}

/// Whether a trigger body is a capture trigger for this queue and guard.
pub fn is_capture_body(body: &str, sync: &SyncSettings) -> bool {
    body.contains(&format!("@{} IS NULL", sync.loop_guard))
        && body.contains(&quote_mysql_ident(&sync.queue_table))
}

fn is_multiple_triggers_error(err: &anyhow::Error) -> bool {
    format!("{:#}", err)
        .to_ascii_lowercase()
        .contains("multiple triggers")
}

fn is_definer_privilege_error(err: &anyhow::Error) -> bool {
    let text = format!("{:#}", err);
    text.contains("SUPER") || text.contains("SET_USER_ID") || text.contains("SET_ANY_DEFINER")
}

/// Pick the definer new triggers are created under.
async fn choose_definer(
    session: &mut dyn Instance,
    instance: &InstanceConfig,
) -> Result<Option<String>> {
    let Some(configured) = &instance.definer else {
        return Ok(None);
    };
    match session.definer_exists(configured).await? {
        Some(false) => {
            warn!(
                "Configured definer {} does not exist on {}; using CURRENT_USER",
                configured,
                session.side()
            );
            Ok(None)
        }
        _ => Ok(Some(configured.clone())),
    }
}

fn restore_definition(foreign: &TriggerInfo) -> TriggerDefinition {
    TriggerDefinition {
        name: foreign.name.clone(),
        table: foreign.table.clone(),
        timing: foreign.timing,
        event: foreign.event,
        definer: Some(foreign.definer.clone()),
        body: foreign.body.clone(),
        capture: None,
    }
}

/// Install (or reinstall) the three capture triggers of one table.
///
/// Each trigger is dropped and recreated, so running this repeatedly
/// converges on the same set. Where the instance allows one trigger per
/// table, timing and event, foreign triggers in the way are merged into the
/// capture trigger's preamble; a preamble already present is carried over
/// on reinstall.
pub async fn install_capture_triggers(
    session: &mut dyn Instance,
    table: &TableConfig,
    key: &TableKey,
    instance: &InstanceConfig,
    sync: &SyncSettings,
) -> Result<TriggerReport> {
    let side = session.side();
    let version = session
        .server_version()
        .await
        .context("Failed to read server version")?;
    let mut multiple = instance
        .multiple_triggers
        .unwrap_or_else(|| supports_multiple_triggers(&version));
    let snapshot_columns = if supports_json_object(&version) {
        key.columns.clone()
    } else {
        Vec::new()
    };
    let mut definer = choose_definer(session, instance).await?;

    debug!(
        "Installing triggers for {} on {} (version {}, multiple triggers: {})",
        key.table, side, version, multiple
    );

    let existing = session
        .list_triggers(&key.table)
        .await
        .with_context(|| format!("Failed to list triggers on {}", key.table))?;

    let mut report = TriggerReport {
        side,
        table: table.name.clone(),
        triggers: Vec::new(),
        merged: Vec::new(),
        repaired_definers: Vec::new(),
        multiple_triggers: multiple,
        definer: definer.clone(),
    };

    let spec = CaptureSpec {
        queue_table: sync.queue_table.clone(),
        loop_guard: sync.loop_guard.clone(),
        table_label: table.name.clone(),
        key_column: key.key_column.clone(),
        snapshot_columns,
    };

    for event in CAPTURE_EVENTS {
        let name = trigger_name(&key.table, event);
        let timing = event.capture_timing();
        let ours = existing.iter().find(|t| t.name.eq_ignore_ascii_case(&name));
        let foreign: Vec<&TriggerInfo> = existing
            .iter()
            .filter(|t| !t.name.eq_ignore_ascii_case(&name))
            .filter(|t| t.timing == timing && t.event == event)
            .collect();

        let preamble = ours.and_then(|t| extract_preamble(&t.body));
        if let Some(current) = ours {
            if session.definer_exists(&current.definer).await? == Some(false) {
                warn!(
                    "Trigger {} on {} has definer {} which does not exist there; recreating",
                    current.name, side, current.definer
                );
                report.repaired_definers.push(current.name.clone());
            }
        }

        let mut merged: Vec<&TriggerInfo> = Vec::new();
        if !multiple && !foreign.is_empty() {
            merged = foreign.clone();
        }

        loop {
            let mut combined = preamble.clone().unwrap_or_default();
            for f in &merged {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&merge_statements(&f.body));
            }
            let definition = TriggerDefinition {
                name: name.clone(),
                table: key.table.clone(),
                timing,
                event,
                definer: definer.clone(),
                body: render_body(&spec, event, Some(&combined)),
                capture: Some(spec.clone()),
            };

            session.drop_trigger(&name).await?;
            for f in &merged {
                session.drop_trigger(&f.name).await?;
            }

            match session.create_trigger(&definition).await {
                Ok(()) => {
                    report.merged.extend(merged.iter().map(|f| f.name.clone()));
                    report.triggers.push(name.clone());
                    break;
                }
                Err(e) if merged.is_empty() && !foreign.is_empty() && is_multiple_triggers_error(&e) => {
                    info!(
                        "{} rejects multiple {} {} triggers on {}; merging",
                        side,
                        timing.as_str(),
                        event,
                        key.table
                    );
                    multiple = false;
                    report.multiple_triggers = false;
                    merged = foreign.clone();
                }
                Err(e) if definer.is_some() && is_definer_privilege_error(&e) => {
                    warn!(
                        "Cannot create triggers as {:?} on {}; using CURRENT_USER",
                        definer, side
                    );
                    definer = None;
                    report.definer = None;
                }
                Err(e) => {
                    for f in &merged {
                        if let Err(restore) = session.create_trigger(&restore_definition(f)).await {
                            warn!("Failed to restore trigger {}: {:#}", f.name, restore);
                        }
                    }
                    return Err(e).with_context(|| {
                        format!("Failed to create trigger {} on {}", name, side)
                    });
                }
            }
        }

        info!("Installed trigger {} on {}", name, side);
    }

    Ok(report)
}

/// Static checks of a table's capture triggers. Returns one description
/// per problem found.
pub async fn inspect_capture(
    session: &mut dyn Instance,
    key: &TableKey,
    sync: &SyncSettings,
) -> Result<Vec<String>> {
    let triggers = session.list_triggers(&key.table).await?;
    let mut gaps = Vec::new();

    for event in CAPTURE_EVENTS {
        let timing = event.capture_timing();
        let capture = triggers.iter().find(|t| {
            t.event == event && t.timing == timing && is_capture_body(&t.body, sync)
        });
        match capture {
            None => gaps.push(format!(
                "no {} {} capture trigger",
                timing.as_str(),
                event
            )),
            Some(trigger) => {
                if session.definer_exists(&trigger.definer).await? == Some(false) {
                    gaps.push(format!(
                        "trigger {} runs as {} which does not exist",
                        trigger.name, trigger.definer
                    ));
                }
            }
        }
    }

    Ok(gaps)
}
