// ABOUTME: MySQL/MariaDB backend for the instance seam using mysql_async
// ABOUTME: Metadata from information_schema, queue SQL from replication::queue, one Conn per session

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, Params, Row};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

use super::{
    value_to_datetime, Connector, Instance, ProbeOutcome, RowImage, Side, TableMetadata,
    TriggerInfo, Value,
};
use crate::config::ReplicatorConfig;
use crate::error::{is_connectivity, ConnectionLost};
use crate::replication::queue::{self, truncate_error, QueueEntry, QueueHealth, QueueStatus};
use crate::replication::triggers::TriggerDefinition;
use crate::replication::writer;
use crate::utils::{quote_mysql_ident, retry_with_backoff, strip_password_from_url};

/// Opens `mysql_async` connections to the two configured instances.
pub struct MySqlConnector {
    local_url: String,
    remote_url: String,
    queue_table: String,
    connect_timeout: Duration,
}

impl MySqlConnector {
    pub fn from_config(config: &ReplicatorConfig) -> Self {
        Self {
            local_url: config.local.url.clone(),
            remote_url: config.remote.url.clone(),
            queue_table: config.sync.queue_table.clone(),
            connect_timeout: config.sync.connect_timeout(),
        }
    }

    fn url(&self, side: Side) -> &str {
        match side {
            Side::Local => &self.local_url,
            Side::Remote => &self.remote_url,
        }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self, side: Side, retries: u32) -> Result<Box<dyn Instance>> {
        let url = self.url(side).to_string();
        let opts = Opts::from_url(&url)
            .with_context(|| format!("Invalid {} URL {}", side, strip_password_from_url(&url)))?;
        let timeout = self.connect_timeout;

        let conn = retry_with_backoff(
            || {
                let opts = opts.clone();
                async move {
                    let conn = tokio::time::timeout(timeout, Conn::new(opts))
                        .await
                        .context("Connection attempt timed out")??;
                    Ok(conn)
                }
            },
            retries,
            Duration::from_millis(500),
        )
        .await
        .with_context(|| {
            format!(
                "Failed to connect to {} instance at {}",
                side,
                strip_password_from_url(&url)
            )
        })?;

        debug!("Connected to {} instance", side);
        Ok(Box::new(MySqlInstance {
            side,
            conn,
            queue_table: self.queue_table.clone(),
            poisoned: false,
        }))
    }
}

/// One `mysql_async` connection. Session variables (the loop guard) live
/// on this connection only.
pub struct MySqlInstance {
    side: Side,
    conn: Conn,
    queue_table: String,
    poisoned: bool,
}

fn take<T: FromValue>(row: &Row, index: usize, column: &str) -> Result<T> {
    row.get_opt::<T, usize>(index)
        .ok_or_else(|| anyhow!("Missing column {}", column))?
        .map_err(|e| anyhow!("Unexpected value in column {}: {:?}", column, e))
}

fn take_datetime(row: &Row, index: usize) -> Option<chrono::NaiveDateTime> {
    row.as_ref(index).and_then(value_to_datetime)
}

fn row_image(row: &Row) -> RowImage {
    let columns = row.columns();
    columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let value = row.as_ref(i).cloned().unwrap_or(Value::NULL);
            (column.name_str().into_owned(), value)
        })
        .collect()
}

fn parse_entry(row: &Row) -> Result<QueueEntry> {
    let operation: String = take(row, 3, "operation")?;
    let status: String = take(row, 6, "status")?;
    Ok(QueueEntry {
        id: take(row, 0, "id")?,
        table_name: take(row, 1, "table_name")?,
        record_id: take(row, 2, "record_id")?,
        operation: operation.parse()?,
        old_data: take(row, 4, "old_data")?,
        created_at: take_datetime(row, 5).ok_or_else(|| anyhow!("Invalid created_at"))?,
        status: status.parse()?,
        attempts: take(row, 7, "attempts")?,
        error_message: take(row, 8, "error_message")?,
        processed_at: take_datetime(row, 9),
    })
}

fn split_definer(definer: &str) -> (&str, &str) {
    definer
        .rsplit_once('@')
        .map(|(user, host)| (user.trim_matches('`'), host.trim_matches('`')))
        .unwrap_or((definer, "%"))
}

impl MySqlInstance {
    fn conn(&mut self) -> Result<&mut Conn> {
        if self.poisoned {
            return Err(ConnectionLost(
                "session discarded after an unreleased loop guard".to_string(),
            )
            .into());
        }
        Ok(&mut self.conn)
    }

    async fn resolve_table_name(&mut self, table: &str) -> Result<Option<String>> {
        let names: Vec<String> = self
            .conn()?
            .exec(
                "SELECT TABLE_NAME FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
                 AND LOWER(TABLE_NAME) = LOWER(?)",
                (table,),
            )
            .await
            .with_context(|| format!("Failed to look up table {}", table))?;
        Ok(names
            .iter()
            .find(|n| n.as_str() == table)
            .or_else(|| names.first())
            .cloned())
    }

    async fn touch_and_count(&mut self, table: &str, key_column: &str) -> Result<ProbeOutcome> {
        let queue_table = quote_mysql_ident(&self.queue_table);
        let conn = self.conn()?;
        let key: Option<Value> = conn
            .query_first(format!(
                "SELECT {} FROM {} LIMIT 1",
                quote_mysql_ident(key_column),
                quote_mysql_ident(table)
            ))
            .await?;
        let Some(key) = key else {
            return Ok(ProbeOutcome::NoRows);
        };

        let before: Option<u64> = conn
            .query_first(format!("SELECT COALESCE(MAX(id), 0) FROM {}", queue_table))
            .await?;
        conn.exec_drop(writer::build_touch_query(table, key_column), (key,))
            .await?;
        let queued: Option<u64> = conn
            .exec_first(
                format!("SELECT COUNT(*) FROM {} WHERE id > ?", queue_table),
                (before.unwrap_or(0),),
            )
            .await?;

        Ok(if queued.unwrap_or(0) > 0 {
            ProbeOutcome::Captured
        } else {
            ProbeOutcome::Missing
        })
    }
}

#[async_trait]
impl Instance for MySqlInstance {
    fn side(&self) -> Side {
        self.side
    }

    async fn server_version(&mut self) -> Result<String> {
        let version: Option<String> = self.conn()?.query_first("SELECT VERSION()").await?;
        version.ok_or_else(|| anyhow!("Server returned no version"))
    }

    async fn current_user(&mut self) -> Result<String> {
        let user: Option<String> = self.conn()?.query_first("SELECT CURRENT_USER()").await?;
        user.ok_or_else(|| anyhow!("Server returned no CURRENT_USER()"))
    }

    async fn describe_table(&mut self, table: &str) -> Result<Option<TableMetadata>> {
        let Some(name) = self.resolve_table_name(table).await? else {
            return Ok(None);
        };
        let conn = self.conn()?;

        let columns: Vec<String> = conn
            .exec(
                "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (name.as_str(),),
            )
            .await
            .with_context(|| format!("Failed to read columns of {}", name))?;

        let index_rows: Vec<Row> = conn
            .exec(
                "SELECT INDEX_NAME, COLUMN_NAME, NON_UNIQUE FROM information_schema.STATISTICS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                 ORDER BY INDEX_NAME, SEQ_IN_INDEX",
                (name.as_str(),),
            )
            .await
            .with_context(|| format!("Failed to read indexes of {}", name))?;

        let mut indexes: BTreeMap<String, (bool, Vec<String>)> = BTreeMap::new();
        for row in &index_rows {
            let index_name: String = take(row, 0, "INDEX_NAME")?;
            let column: String = take(row, 1, "COLUMN_NAME")?;
            let non_unique: i64 = take(row, 2, "NON_UNIQUE")?;
            indexes
                .entry(index_name)
                .or_insert_with(|| (non_unique == 0, Vec::new()))
                .1
                .push(column);
        }

        let primary_key = indexes
            .get("PRIMARY")
            .map(|(_, cols)| cols.clone())
            .unwrap_or_default();
        let unique_keys = indexes
            .iter()
            .filter(|(index_name, (unique, _))| *unique && index_name.as_str() != "PRIMARY")
            .map(|(_, (_, cols))| cols.clone())
            .collect();

        Ok(Some(TableMetadata {
            name,
            columns,
            primary_key,
            unique_keys,
        }))
    }

    async fn fetch_row(&mut self, table: &str, key_column: &str, key: &str) -> Result<Option<RowImage>> {
        let row: Option<Row> = self
            .conn()?
            .exec_first(writer::build_select_row_query(table, key_column), (key,))
            .await
            .with_context(|| format!("Failed to read {} {}", table, key))?;
        Ok(row.as_ref().map(row_image))
    }

    async fn upsert_row(&mut self, table: &str, key_column: &str, row: &RowImage) -> Result<()> {
        let columns: Vec<String> = row.keys().cloned().collect();
        let values: Vec<Value> = row.values().cloned().collect();
        let sql = writer::build_upsert_query(table, key_column, &columns);
        self.conn()?
            .exec_drop(sql, Params::Positional(values))
            .await
            .with_context(|| format!("Failed to upsert into {}", table))?;
        Ok(())
    }

    async fn delete_row(&mut self, table: &str, key_column: &str, key: &str) -> Result<u64> {
        let conn = self.conn()?;
        conn.exec_drop(writer::build_delete_query(table, key_column), (key,))
            .await
            .with_context(|| format!("Failed to delete from {}", table))?;
        Ok(conn.affected_rows())
    }

    async fn rows_modified_within(&mut self, table: &str, timestamp_column: &str, hours: u32) -> Result<Vec<RowImage>> {
        let rows: Vec<Row> = self
            .conn()?
            .exec(writer::build_window_query(table, timestamp_column), (hours,))
            .await
            .with_context(|| format!("Failed to read recent rows of {}", table))?;
        Ok(rows.iter().map(row_image).collect())
    }

    async fn set_session_flag(&mut self, name: &str) -> Result<()> {
        self.conn()?.query_drop(format!("SET @{} = 1", name)).await?;
        Ok(())
    }

    async fn clear_session_flag(&mut self, name: &str) -> Result<()> {
        self.conn()?
            .query_drop(format!("SET @{} = NULL", name))
            .await?;
        Ok(())
    }

    fn poison(&mut self) {
        self.poisoned = true;
    }

    async fn ensure_queue_table(&mut self) -> Result<()> {
        let queue_table = self.queue_table.clone();
        let conn = self.conn()?;
        conn.query_drop(queue::create_queue_table_sql(&queue_table))
            .await
            .context("Failed to create queue table")?;

        let has_processed_at: Option<u64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND COLUMN_NAME = 'processed_at'",
                (queue_table.as_str(),),
            )
            .await?;
        if has_processed_at.unwrap_or(0) == 0 {
            conn.query_drop(queue::add_processed_at_sql(&queue_table))
                .await
                .context("Failed to add processed_at to queue table")?;
        }
        Ok(())
    }

    async fn pending_entries(
        &mut self,
        after_id: u64,
        limit: usize,
        skipped_tables: &BTreeSet<String>,
    ) -> Result<Vec<QueueEntry>> {
        let sql = queue::select_pending_sql(&self.queue_table, skipped_tables.len());
        let mut params: Vec<Value> = vec![after_id.into()];
        params.extend(skipped_tables.iter().map(|t| Value::from(t.as_str())));
        params.push((limit as u64).into());
        let rows: Vec<Row> = self
            .conn()?
            .exec(sql, Params::Positional(params))
            .await
            .context("Failed to read pending queue entries")?;
        rows.iter().map(parse_entry).collect()
    }

    async fn claim_entry(&mut self, id: u64) -> Result<bool> {
        let sql = queue::claim_sql(&self.queue_table);
        let conn = self.conn()?;
        conn.exec_drop(sql, (id,)).await?;
        Ok(conn.affected_rows() == 1)
    }

    async fn complete_entry(&mut self, id: u64) -> Result<()> {
        let sql = queue::complete_sql(&self.queue_table);
        self.conn()?.exec_drop(sql, (id,)).await?;
        Ok(())
    }

    async fn record_failure(&mut self, id: u64, message: &str, max_retries: u32) -> Result<QueueStatus> {
        let update = queue::record_failure_sql(&self.queue_table);
        let select = queue::select_status_sql(&self.queue_table);
        let conn = self.conn()?;
        conn.exec_drop(update, (truncate_error(message), max_retries, id))
            .await?;
        let status: Option<String> = conn.exec_first(select, (id,)).await?;
        status
            .ok_or_else(|| anyhow!("Queue entry {} vanished", id))?
            .parse()
    }

    async fn release_entry(&mut self, id: u64) -> Result<()> {
        let sql = queue::release_sql(&self.queue_table);
        self.conn()?.exec_drop(sql, (id,)).await?;
        Ok(())
    }

    async fn reclaim_stale(&mut self, older_than: Duration) -> Result<u64> {
        let sql = queue::reclaim_stale_sql(&self.queue_table);
        let conn = self.conn()?;
        conn.exec_drop(sql, (older_than.as_secs(),)).await?;
        Ok(conn.affected_rows())
    }

    async fn queue_health(&mut self) -> Result<QueueHealth> {
        let counts_sql = queue::status_counts_sql(&self.queue_table);
        let oldest_sql = queue::oldest_pending_sql(&self.queue_table);
        let conn = self.conn()?;

        let counts: Vec<(String, u64)> = conn.query(counts_sql).await?;
        let mut health = QueueHealth::default();
        for (status, count) in counts {
            match status.parse::<QueueStatus>()? {
                QueueStatus::Pending => health.pending = count,
                QueueStatus::Processing => health.processing = count,
                QueueStatus::Done => health.done = count,
                QueueStatus::Failed => health.failed = count,
            }
        }

        let oldest: Option<Row> = conn.query_first(oldest_sql).await?;
        if let Some(row) = oldest {
            health.oldest_pending_at = take_datetime(&row, 0);
            health.oldest_pending_age_secs = take(&row, 1, "age")?;
        }
        Ok(health)
    }

    async fn list_entries(&mut self, status: Option<QueueStatus>, limit: usize) -> Result<Vec<QueueEntry>> {
        let sql = queue::list_entries_sql(&self.queue_table, status.is_some());
        let mut params: Vec<Value> = Vec::new();
        if let Some(status) = status {
            params.push(status.as_str().into());
        }
        params.push((limit as u64).into());
        let rows: Vec<Row> = self.conn()?.exec(sql, Params::Positional(params)).await?;
        rows.iter().map(parse_entry).collect()
    }

    async fn retry_failed(&mut self, table: Option<&str>) -> Result<u64> {
        let sql = queue::retry_failed_sql(&self.queue_table, table.is_some());
        let params = match table {
            Some(table) => Params::Positional(vec![table.into()]),
            None => Params::Empty,
        };
        let conn = self.conn()?;
        conn.exec_drop(sql, params).await?;
        Ok(conn.affected_rows())
    }

    async fn prune_done(&mut self, older_than_days: u32) -> Result<u64> {
        let sql = queue::prune_done_sql(&self.queue_table);
        let conn = self.conn()?;
        conn.exec_drop(sql, (older_than_days,)).await?;
        Ok(conn.affected_rows())
    }

    async fn list_triggers(&mut self, table: &str) -> Result<Vec<TriggerInfo>> {
        let rows: Vec<Row> = self
            .conn()?
            .exec(
                "SELECT TRIGGER_NAME, EVENT_OBJECT_TABLE, ACTION_TIMING, EVENT_MANIPULATION, \
                 DEFINER, ACTION_STATEMENT FROM information_schema.TRIGGERS \
                 WHERE TRIGGER_SCHEMA = DATABASE() AND LOWER(EVENT_OBJECT_TABLE) = LOWER(?)",
                (table,),
            )
            .await
            .with_context(|| format!("Failed to list triggers of {}", table))?;

        let mut triggers = Vec::with_capacity(rows.len());
        for row in &rows {
            let timing: String = take(row, 2, "ACTION_TIMING")?;
            let event: String = take(row, 3, "EVENT_MANIPULATION")?;
            triggers.push(TriggerInfo {
                name: take(row, 0, "TRIGGER_NAME")?,
                table: take(row, 1, "EVENT_OBJECT_TABLE")?,
                timing: timing.parse()?,
                event: event.parse()?,
                definer: take(row, 4, "DEFINER")?,
                body: take(row, 5, "ACTION_STATEMENT")?,
            });
        }
        Ok(triggers)
    }

    async fn definer_exists(&mut self, definer: &str) -> Result<Option<bool>> {
        let (user, host) = split_definer(definer);
        let lookup: std::result::Result<Option<u64>, mysql_async::Error> = self
            .conn()?
            .exec_first(
                "SELECT COUNT(*) FROM mysql.user WHERE User = ? AND Host = ?",
                (user, host),
            )
            .await;

        match lookup {
            Ok(count) => Ok(Some(count.unwrap_or(0) > 0)),
            Err(e) => {
                let err = anyhow::Error::new(e);
                if is_connectivity(&err) {
                    return Err(err);
                }
                // The hosted instance denies access to mysql.user.
                debug!("Cannot read mysql.user on {}: {:#}", self.side, err);
                let current = self.current_user().await?;
                Ok(if current == definer { Some(true) } else { None })
            }
        }
    }

    async fn create_trigger(&mut self, definition: &TriggerDefinition) -> Result<()> {
        self.conn()?
            .query_drop(definition.create_sql())
            .await
            .with_context(|| format!("Failed to create trigger {}", definition.name))?;
        Ok(())
    }

    async fn drop_trigger(&mut self, name: &str) -> Result<()> {
        self.conn()?
            .query_drop(format!("DROP TRIGGER IF EXISTS {}", quote_mysql_ident(name)))
            .await
            .with_context(|| format!("Failed to drop trigger {}", name))?;
        Ok(())
    }

    async fn probe_capture(&mut self, table: &str, key_column: &str) -> Result<ProbeOutcome> {
        self.conn()?.query_drop("START TRANSACTION").await?;
        let outcome = self.touch_and_count(table, key_column).await;
        let rollback = self.conn()?.query_drop("ROLLBACK").await;
        let outcome = outcome?;
        rollback.context("Failed to roll back capture probe")?;
        Ok(outcome)
    }
}
