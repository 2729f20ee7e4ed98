// ABOUTME: The database seam: one trait over a live session with either booking instance
// ABOUTME: Shared row/metadata types plus the MySQL and in-memory backends

pub mod memory;
pub mod mysql;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use crate::replication::queue::{QueueEntry, QueueHealth, QueueStatus};
use crate::replication::triggers::{TriggerDefinition, TriggerEvent, TriggerTiming};

pub use mysql_async::Value;

/// A full row as column name -> value, keyed with the casing of the
/// instance it was read from.
pub type RowImage = BTreeMap<String, Value>;

/// Which of the two independently writable instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// On-premises, next to the point-of-sale hardware.
    Local,
    /// Hosted, backing the public website. Restricted privileges.
    Remote,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What an instance reports about one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    /// Table name with the casing the instance uses.
    pub name: String,
    /// Columns in ordinal order.
    pub columns: Vec<String>,
    /// Columns of the PRIMARY index, empty when none is declared.
    pub primary_key: Vec<String>,
    /// Column lists of every other unique index.
    pub unique_keys: Vec<Vec<String>>,
}

impl TableMetadata {
    /// Look a column up case-insensitively, returning the instance's spelling.
    pub fn column(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.as_str() == name)
            .or_else(|| self.columns.iter().find(|c| c.eq_ignore_ascii_case(name)))
            .map(String::as_str)
    }
}

/// A trigger as recorded by the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerInfo {
    pub name: String,
    pub table: String,
    pub timing: TriggerTiming,
    pub event: TriggerEvent,
    /// `user@host` the trigger runs as.
    pub definer: String,
    /// The trigger's action statement, usually a `BEGIN ... END` block.
    pub body: String,
}

/// Result of touching a row and watching the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// A queue row appeared for the touched record.
    Captured,
    /// The write went through but nothing was queued.
    Missing,
    /// The table is empty so nothing could be touched.
    NoRows,
}

/// An open session with one instance.
///
/// Sessions are opened per run and never shared between runs, so the loop
/// guard's session flag cannot leak from one run into another. Every method
/// takes `&mut self` because session state (the loop guard) is part of the
/// contract.
#[async_trait]
pub trait Instance: Send {
    fn side(&self) -> Side;

    /// Version string as reported by `SELECT VERSION()`.
    async fn server_version(&mut self) -> Result<String>;

    /// The account this session authenticated as, `user@host`.
    async fn current_user(&mut self) -> Result<String>;

    /// Metadata for a table, matched case-insensitively. `None` when the
    /// table does not exist on this instance.
    async fn describe_table(&mut self, table: &str) -> Result<Option<TableMetadata>>;

    /// Read the current row by key.
    async fn fetch_row(&mut self, table: &str, key_column: &str, key: &str)
        -> Result<Option<RowImage>>;

    /// Insert the row, or overwrite every given column when the key exists.
    async fn upsert_row(&mut self, table: &str, key_column: &str, row: &RowImage) -> Result<()>;

    /// Delete by key. Returns the number of rows removed (0 is not an error).
    async fn delete_row(&mut self, table: &str, key_column: &str, key: &str) -> Result<u64>;

    /// All rows whose timestamp column falls within the trailing window,
    /// measured against the instance's own clock.
    async fn rows_modified_within(
        &mut self,
        table: &str,
        timestamp_column: &str,
        hours: u32,
    ) -> Result<Vec<RowImage>>;

    /// Set the session variable `@name` to 1.
    async fn set_session_flag(&mut self, name: &str) -> Result<()>;

    /// Reset the session variable `@name` to NULL.
    async fn clear_session_flag(&mut self, name: &str) -> Result<()>;

    /// Mark the session unusable. Called when a flag could not be cleared
    /// through the normal path; every later call must fail.
    fn poison(&mut self);

    /// Create the queue table when missing and add columns introduced later.
    async fn ensure_queue_table(&mut self) -> Result<()>;

    /// Oldest pending entries with an id above `after_id`, at most `limit`.
    /// Entries of `skipped_tables` (lowercased names) are left out.
    async fn pending_entries(
        &mut self,
        after_id: u64,
        limit: usize,
        skipped_tables: &BTreeSet<String>,
    ) -> Result<Vec<QueueEntry>>;

    /// Move one entry pending -> processing. `false` when another run got it first.
    async fn claim_entry(&mut self, id: u64) -> Result<bool>;

    /// processing -> done.
    async fn complete_entry(&mut self, id: u64) -> Result<()>;

    /// Count a failed attempt. The entry goes back to pending, or to failed
    /// once its attempts exceed `max_retries`. Returns the new status.
    async fn record_failure(&mut self, id: u64, message: &str, max_retries: u32)
        -> Result<QueueStatus>;

    /// processing -> pending without counting an attempt.
    async fn release_entry(&mut self, id: u64) -> Result<()>;

    /// Return entries stuck in processing longer than `older_than` to pending.
    async fn reclaim_stale(&mut self, older_than: Duration) -> Result<u64>;

    async fn queue_health(&mut self) -> Result<QueueHealth>;

    /// Entries for diagnostics, newest first.
    async fn list_entries(&mut self, status: Option<QueueStatus>, limit: usize)
        -> Result<Vec<QueueEntry>>;

    /// failed -> pending with attempts reset, optionally for one table.
    async fn retry_failed(&mut self, table: Option<&str>) -> Result<u64>;

    /// Delete done entries older than the given number of days.
    async fn prune_done(&mut self, older_than_days: u32) -> Result<u64>;

    /// Triggers defined on a table (any owner).
    async fn list_triggers(&mut self, table: &str) -> Result<Vec<TriggerInfo>>;

    /// Whether a `user@host` definer exists here. `None` when the session
    /// lacks the privilege to find out.
    async fn definer_exists(&mut self, definer: &str) -> Result<Option<bool>>;

    async fn create_trigger(&mut self, definition: &TriggerDefinition) -> Result<()>;

    /// Drop a trigger if it exists.
    async fn drop_trigger(&mut self, name: &str) -> Result<()>;

    /// Touch one row of the table without changing it, inside a transaction
    /// that is rolled back, and report whether a queue row appeared.
    async fn probe_capture(&mut self, table: &str, key_column: &str) -> Result<ProbeOutcome>;
}

/// Opens sessions. One connector serves a whole engine; every run asks it
/// for fresh sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session, retrying connection failures up to `retries` times.
    async fn connect(&self, side: Side, retries: u32) -> Result<Box<dyn Instance>>;
}

/// Render a key value the way the capture triggers store it in `record_id`.
pub fn render_key(value: &Value) -> String {
    match value {
        Value::NULL => "NULL".to_string(),
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Date(..) => match value_to_datetime(value) {
            Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => format!("{:?}", value),
        },
        Value::Time(neg, days, h, m, s, _) => {
            let hours = u32::from(*h) + days * 24;
            format!("{}{:02}:{:02}:{:02}", if *neg { "-" } else { "" }, hours, m, s)
        }
    }
}

/// Interpret a DATETIME/TIMESTAMP value, whether it arrived typed (binary
/// protocol) or as text.
pub fn value_to_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::Date(year, month, day, hour, minute, second, micros) => {
            NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day))?
                .and_hms_micro_opt(
                    u32::from(*hour),
                    u32::from(*minute),
                    u32::from(*second),
                    *micros,
                )
        }
        Value::Bytes(bytes) => {
            let text = std::str::from_utf8(bytes).ok()?;
            NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
                .ok()
                .or_else(|| {
                    NaiveDate::parse_from_str(text, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })
        }
        _ => None,
    }
}

/// Build a typed DATETIME value.
pub fn datetime_value(ts: NaiveDateTime) -> Value {
    use chrono::{Datelike, Timelike};
    Value::Date(
        ts.year() as u16,
        ts.month() as u8,
        ts.day() as u8,
        ts.hour() as u8,
        ts.minute() as u8,
        ts.second() as u8,
        ts.nanosecond() / 1_000,
    )
}

/// JSON rendering used for `old_data` snapshots and operator output.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,
        Value::Int(v) => serde_json::Value::from(*v),
        Value::UInt(v) => serde_json::Value::from(*v),
        Value::Float(v) => serde_json::Value::from(f64::from(*v)),
        Value::Double(v) => serde_json::Value::from(*v),
        _ => serde_json::Value::String(render_key(value)),
    }
}

pub fn row_to_json(row: &RowImage) -> serde_json::Value {
    serde_json::Value::Object(
        row.iter()
            .map(|(column, value)| (column.clone(), value_to_json(value)))
            .collect(),
    )
}

/// Whether two values are the same once protocol differences (typed vs text,
/// signed vs unsigned) are ignored.
pub fn values_equivalent(a: &Value, b: &Value) -> bool {
    a == b || render_key(a) == render_key(b)
}

/// Look a column up in a row image case-insensitively.
pub fn row_value<'r>(row: &'r RowImage, column: &str) -> Option<&'r Value> {
    row.get(column).or_else(|| {
        row.iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_key_matches_trigger_text() {
        assert_eq!(render_key(&Value::Int(500)), "500");
        assert_eq!(render_key(&Value::UInt(7)), "7");
        assert_eq!(render_key(&Value::Bytes(b"AB-12".to_vec())), "AB-12");
    }

    #[test]
    fn test_datetime_from_typed_and_text() {
        let typed = Value::Date(2024, 6, 1, 12, 30, 0, 0);
        let text = Value::Bytes(b"2024-06-01 12:30:00".to_vec());
        assert_eq!(value_to_datetime(&typed), value_to_datetime(&text));
        assert!(value_to_datetime(&Value::Int(3)).is_none());

        let ts = value_to_datetime(&typed).unwrap();
        assert_eq!(datetime_value(ts), typed);
    }

    #[test]
    fn test_values_equivalent_across_protocols() {
        assert!(values_equivalent(&Value::Int(5), &Value::UInt(5)));
        assert!(values_equivalent(&Value::Int(5), &Value::Bytes(b"5".to_vec())));
        assert!(!values_equivalent(&Value::Int(5), &Value::Int(6)));
    }

    #[test]
    fn test_column_lookup_prefers_exact_case() {
        let meta = TableMetadata {
            name: "Guests".into(),
            columns: vec!["ID".into(), "name".into()],
            primary_key: vec!["ID".into()],
            unique_keys: vec![],
        };
        assert_eq!(meta.column("id"), Some("ID"));
        assert_eq!(meta.column("Name"), Some("name"));
        assert_eq!(meta.column("email"), None);
    }

    #[test]
    fn test_side_other_and_display() {
        assert_eq!(Side::Local.other(), Side::Remote);
        assert_eq!(Side::Remote.to_string(), "remote");
    }
}
