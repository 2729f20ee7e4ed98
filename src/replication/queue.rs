// ABOUTME: Queue entry model and the SQL that manages the per-instance sync_queue table
// ABOUTME: Status moves pending -> processing -> done|failed, guarded by row-level WHERE clauses

use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::quote_mysql_ident;

/// Longest error message stored on a queue row.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1000;

/// Captured mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(anyhow!("unknown queue operation: {other}")),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "done" => Ok(QueueStatus::Done),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(anyhow!("unknown queue status: {other}")),
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One row of `sync_queue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: u64,
    pub table_name: String,
    /// Key of the affected row as text. Only meaningful with `table_name`.
    pub record_id: String,
    pub operation: Operation,
    /// Best-effort JSON snapshot of the row, written by the delete trigger.
    pub old_data: Option<String>,
    pub created_at: NaiveDateTime,
    pub status: QueueStatus,
    pub attempts: u32,
    pub error_message: Option<String>,
    /// When the entry last changed status; used to spot abandoned claims.
    pub processed_at: Option<NaiveDateTime>,
}

/// Queue health of one instance, the contract dashboards rely on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueHealth {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
    pub oldest_pending_at: Option<NaiveDateTime>,
    pub oldest_pending_age_secs: Option<i64>,
}

/// Clip an error message to what the queue row stores.
pub fn truncate_error(message: &str) -> String {
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

/// Columns selected for every entry read, in `QueueEntry` field order.
pub const ENTRY_COLUMNS: &str = "id, table_name, record_id, operation, old_data, created_at, \
     status, attempts, error_message, processed_at";

pub fn create_queue_table_sql(queue_table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
            table_name VARCHAR(64) NOT NULL,
            record_id VARCHAR(255) NOT NULL,
            operation ENUM('insert', 'update', 'delete') NOT NULL,
            old_data TEXT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            status ENUM('pending', 'processing', 'done', 'failed') NOT NULL DEFAULT 'pending',
            attempts INT UNSIGNED NOT NULL DEFAULT 0,
            error_message TEXT NULL,
            processed_at TIMESTAMP NULL DEFAULT NULL,
            KEY idx_status_id (status, id),
            KEY idx_table_record (table_name, record_id)
        )",
        quote_mysql_ident(queue_table)
    )
}

/// Queue tables created before claim tracking lack `processed_at`.
pub fn add_processed_at_sql(queue_table: &str) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN processed_at TIMESTAMP NULL DEFAULT NULL",
        quote_mysql_ident(queue_table)
    )
}

/// Params: last id already read, one lowercased table name per
/// `skipped_tables`, then limit.
pub fn select_pending_sql(queue_table: &str, skipped_tables: usize) -> String {
    let filter = if skipped_tables == 0 {
        String::new()
    } else {
        format!(
            " AND LOWER(table_name) NOT IN ({})",
            vec!["?"; skipped_tables].join(", ")
        )
    };
    format!(
        "SELECT {} FROM {} WHERE status = 'pending' AND id > ?{} ORDER BY id LIMIT ?",
        ENTRY_COLUMNS,
        quote_mysql_ident(queue_table),
        filter
    )
}

/// Params: id. Affects one row only if nobody else claimed it.
pub fn claim_sql(queue_table: &str) -> String {
    format!(
        "UPDATE {} SET status = 'processing', processed_at = NOW() \
         WHERE id = ? AND status = 'pending'",
        quote_mysql_ident(queue_table)
    )
}

/// Params: id.
pub fn complete_sql(queue_table: &str) -> String {
    format!(
        "UPDATE {} SET status = 'done', processed_at = NOW(), error_message = NULL \
         WHERE id = ? AND status = 'processing'",
        quote_mysql_ident(queue_table)
    )
}

/// Params: error message, max retries, id.
///
/// MySQL evaluates single-table UPDATE assignments left to right, so the
/// status expression sees the incremented attempt count.
pub fn record_failure_sql(queue_table: &str) -> String {
    format!(
        "UPDATE {} SET attempts = attempts + 1, error_message = ?, \
         status = IF(attempts > ?, 'failed', 'pending'), processed_at = NOW() \
         WHERE id = ? AND status = 'processing'",
        quote_mysql_ident(queue_table)
    )
}

/// Params: id.
pub fn select_status_sql(queue_table: &str) -> String {
    format!(
        "SELECT status FROM {} WHERE id = ?",
        quote_mysql_ident(queue_table)
    )
}

/// Params: id.
pub fn release_sql(queue_table: &str) -> String {
    format!(
        "UPDATE {} SET status = 'pending', processed_at = NULL \
         WHERE id = ? AND status = 'processing'",
        quote_mysql_ident(queue_table)
    )
}

/// Params: timeout in seconds.
pub fn reclaim_stale_sql(queue_table: &str) -> String {
    format!(
        "UPDATE {} SET status = 'pending', processed_at = NULL \
         WHERE status = 'processing' \
         AND (processed_at IS NULL OR processed_at < NOW() - INTERVAL ? SECOND)",
        quote_mysql_ident(queue_table)
    )
}

pub fn status_counts_sql(queue_table: &str) -> String {
    format!(
        "SELECT status, COUNT(*) FROM {} GROUP BY status",
        quote_mysql_ident(queue_table)
    )
}

pub fn oldest_pending_sql(queue_table: &str) -> String {
    format!(
        "SELECT MIN(created_at), TIMESTAMPDIFF(SECOND, MIN(created_at), NOW()) \
         FROM {} WHERE status = 'pending'",
        quote_mysql_ident(queue_table)
    )
}

/// Params: [status,] limit.
pub fn list_entries_sql(queue_table: &str, filter_status: bool) -> String {
    let filter = if filter_status { "WHERE status = ? " } else { "" };
    format!(
        "SELECT {} FROM {} {}ORDER BY id DESC LIMIT ?",
        ENTRY_COLUMNS,
        quote_mysql_ident(queue_table),
        filter
    )
}

/// Params: [table_name].
pub fn retry_failed_sql(queue_table: &str, filter_table: bool) -> String {
    let filter = if filter_table { " AND table_name = ?" } else { "" };
    format!(
        "UPDATE {} SET status = 'pending', attempts = 0, error_message = NULL, \
         processed_at = NULL WHERE status = 'failed'{}",
        quote_mysql_ident(queue_table),
        filter
    )
}

/// Params: days.
pub fn prune_done_sql(queue_table: &str) -> String {
    format!(
        "DELETE FROM {} WHERE status = 'done' AND created_at < NOW() - INTERVAL ? DAY",
        quote_mysql_ident(queue_table)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_parsing() {
        assert_eq!("insert".parse::<Operation>().unwrap(), Operation::Insert);
        assert_eq!("DELETE".parse::<Operation>().unwrap(), Operation::Delete);
        assert!("upsert".parse::<Operation>().is_err());
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Done,
            QueueStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_claim_only_moves_pending_rows() {
        let sql = claim_sql("sync_queue");
        assert!(sql.starts_with("UPDATE `sync_queue` SET status = 'processing'"));
        assert!(sql.contains("WHERE id = ? AND status = 'pending'"));
    }

    #[test]
    fn test_failure_bound_is_checked_after_increment() {
        let sql = record_failure_sql("sync_queue");
        let increment = sql.find("attempts = attempts + 1").unwrap();
        let bound = sql.find("IF(attempts > ?").unwrap();
        assert!(increment < bound);
        assert!(sql.contains("status = 'processing'"));
    }

    #[test]
    fn test_pending_is_fifo() {
        let sql = select_pending_sql("sync_queue", 0);
        assert!(sql.contains("WHERE status = 'pending' AND id > ? ORDER BY id LIMIT ?"));
    }

    #[test]
    fn test_pending_leaves_out_skipped_tables() {
        let sql = select_pending_sql("sync_queue", 2);
        assert!(sql.contains(
            "WHERE status = 'pending' AND id > ? AND LOWER(table_name) NOT IN (?, ?) ORDER BY id LIMIT ?"
        ));
    }

    #[test]
    fn test_retry_failed_filter() {
        assert!(!retry_failed_sql("q", false).contains("table_name = ?"));
        assert!(retry_failed_sql("q", true).ends_with("AND table_name = ?"));
    }

    #[test]
    fn test_queue_table_schema() {
        let sql = create_queue_table_sql("sync_queue");
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS `sync_queue`"));
        assert!(sql.contains("status ENUM('pending', 'processing', 'done', 'failed')"));
        assert!(sql.contains("attempts INT UNSIGNED NOT NULL DEFAULT 0"));
        assert!(sql.contains("processed_at TIMESTAMP NULL"));
    }

    #[test]
    fn test_truncate_error_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_MESSAGE_LEN);
        let clipped = truncate_error(&long);
        assert!(clipped.ends_with("..."));
        assert!(clipped.len() <= MAX_ERROR_MESSAGE_LEN + 3);
        assert_eq!(truncate_error("short"), "short");
    }
}
