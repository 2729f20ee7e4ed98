// ABOUTME: In-memory booking instance with trigger simulation for tests and dry runs
// ABOUTME: Models per-session loop guard flags, definer validity, single-trigger limits and outages

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{
    render_key, row_to_json, row_value, value_to_datetime, Connector, Instance, ProbeOutcome,
    RowImage, Side, TableMetadata, TriggerInfo,
};
use crate::error::ConnectionLost;
use crate::replication::queue::{truncate_error, Operation, QueueEntry, QueueHealth, QueueStatus};
use crate::replication::triggers::{
    supports_multiple_triggers, CaptureSpec, TriggerDefinition, TriggerEvent, TriggerTiming,
};

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

fn hours(h: u32) -> chrono::Duration {
    chrono_duration(Duration::from_secs(u64::from(h) * 3600))
}

struct MemoryTable {
    meta: TableMetadata,
    rows: Vec<RowImage>,
    /// Column stamped with the clock on application writes, like
    /// `ON UPDATE CURRENT_TIMESTAMP`.
    auto_timestamp: Option<String>,
}

impl MemoryTable {
    fn position(&self, key_column: &str, key: &str) -> Option<usize> {
        self.rows.iter().position(|row| {
            row_value(row, key_column)
                .map(|v| render_key(v) == key)
                .unwrap_or(false)
        })
    }

    fn check_columns(&self, row: &RowImage) -> Result<()> {
        for column in row.keys() {
            if self.meta.column(column).is_none() {
                bail!("Unknown column '{}' in 'field list'", column);
            }
        }
        Ok(())
    }

    /// Store values under the table's own column spelling.
    fn normalize(&self, row: &RowImage) -> RowImage {
        row.iter()
            .map(|(column, value)| {
                let name = self.meta.column(column).unwrap_or(column).to_string();
                (name, value.clone())
            })
            .collect()
    }
}

struct MemoryTrigger {
    info: TriggerInfo,
    capture: Option<CaptureSpec>,
}

struct DbState {
    version: String,
    tables: Vec<MemoryTable>,
    queue_exists: bool,
    queue: Vec<QueueEntry>,
    next_queue_id: u64,
    triggers: Vec<MemoryTrigger>,
    users: BTreeSet<String>,
    current_user: String,
    can_read_users: bool,
    can_set_definer: bool,
    reachable: bool,
    now: NaiveDateTime,
    failing_tables: BTreeMap<String, String>,
}

impl DbState {
    fn table(&self, name: &str) -> Option<&MemoryTable> {
        self.tables
            .iter()
            .find(|t| t.meta.name == name)
            .or_else(|| self.tables.iter().find(|t| t.meta.name.eq_ignore_ascii_case(name)))
    }

    fn table_index(&self, name: &str) -> Result<usize> {
        self.tables
            .iter()
            .position(|t| t.meta.name == name)
            .or_else(|| {
                self.tables
                    .iter()
                    .position(|t| t.meta.name.eq_ignore_ascii_case(name))
            })
            .ok_or_else(|| anyhow!("Table '{}' doesn't exist", name))
    }

    /// Queue rows the table's triggers would write for one row event. `row`
    /// is NEW for inserts and updates and OLD for deletes; `old` is the
    /// previous image of an updated row.
    fn fire(
        &self,
        table: &str,
        timing: TriggerTiming,
        event: TriggerEvent,
        old: Option<&RowImage>,
        row: &RowImage,
        flags: &HashSet<String>,
    ) -> Result<Vec<QueueEntry>> {
        let mut captured = Vec::new();
        for trigger in &self.triggers {
            let info = &trigger.info;
            if !info.table.eq_ignore_ascii_case(table) || info.timing != timing || info.event != event {
                continue;
            }
            // A trigger whose definer is missing never runs here.
            if !self.users.contains(&info.definer) {
                continue;
            }
            let Some(spec) = &trigger.capture else {
                continue;
            };
            if flags.contains(&spec.loop_guard) {
                continue;
            }
            if !self.queue_exists {
                bail!("Table '{}' doesn't exist", spec.queue_table);
            }
            let key = row_value(row, &spec.key_column)
                .map(render_key)
                .ok_or_else(|| anyhow!("Unknown column '{}' in 'NEW'", spec.key_column))?;
            // A changed key retires the old row on the other side.
            if let Some(old) = old.filter(|_| event == TriggerEvent::Update) {
                let old_key = row_value(old, &spec.key_column).map(render_key);
                if let Some(old_key) = old_key.filter(|k| *k != key) {
                    captured.push(self.captured_entry(spec, old_key, Operation::Delete, Some(old)));
                }
            }
            let snapshot = (event == TriggerEvent::Delete).then_some(row);
            captured.push(self.captured_entry(spec, key, event.operation(), snapshot));
        }
        Ok(captured)
    }

    fn captured_entry(
        &self,
        spec: &CaptureSpec,
        record_id: String,
        operation: Operation,
        snapshot: Option<&RowImage>,
    ) -> QueueEntry {
        let old_data = snapshot.filter(|_| !spec.snapshot_columns.is_empty()).map(|row| {
            let snapshot: RowImage = spec
                .snapshot_columns
                .iter()
                .filter_map(|c| row_value(row, c).map(|v| (c.clone(), v.clone())))
                .collect();
            row_to_json(&snapshot).to_string()
        });
        QueueEntry {
            id: 0,
            table_name: spec.table_label.clone(),
            record_id,
            operation,
            old_data,
            created_at: self.now,
            status: QueueStatus::Pending,
            attempts: 0,
            error_message: None,
            processed_at: None,
        }
    }

    fn enqueue(&mut self, entries: Vec<QueueEntry>) {
        for mut entry in entries {
            self.next_queue_id += 1;
            entry.id = self.next_queue_id;
            self.queue.push(entry);
        }
    }

    fn insert(&mut self, table: &str, row: RowImage, key_column: &str, flags: &HashSet<String>) -> Result<()> {
        let index = self.table_index(table)?;
        let t = &self.tables[index];
        t.check_columns(&row)?;
        let row = t.normalize(&row);
        let key = row_value(&row, key_column)
            .map(render_key)
            .ok_or_else(|| anyhow!("Field '{}' doesn't have a default value", key_column))?;
        if t.position(key_column, &key).is_some() {
            bail!("Duplicate entry '{}' for key 'PRIMARY'", key);
        }
        let name = t.meta.name.clone();
        let captured = self.fire(&name, TriggerTiming::After, TriggerEvent::Insert, None, &row, flags)?;
        self.tables[index].rows.push(row);
        self.enqueue(captured);
        Ok(())
    }

    fn update(
        &mut self,
        table: &str,
        key_column: &str,
        key: &str,
        changes: &RowImage,
        flags: &HashSet<String>,
    ) -> Result<bool> {
        let index = self.table_index(table)?;
        let t = &self.tables[index];
        t.check_columns(changes)?;
        let changes = t.normalize(changes);
        let Some(pos) = t.position(key_column, key) else {
            return Ok(false);
        };
        let mut updated = t.rows[pos].clone();
        for (column, value) in changes {
            updated.insert(column, value);
        }
        let name = t.meta.name.clone();
        let captured = self.fire(
            &name,
            TriggerTiming::After,
            TriggerEvent::Update,
            Some(&self.tables[index].rows[pos]),
            &updated,
            flags,
        )?;
        self.tables[index].rows[pos] = updated;
        self.enqueue(captured);
        Ok(true)
    }

    fn delete(&mut self, table: &str, key_column: &str, key: &str, flags: &HashSet<String>) -> Result<u64> {
        let index = self.table_index(table)?;
        let t = &self.tables[index];
        let Some(pos) = t.position(key_column, key) else {
            return Ok(0);
        };
        let name = t.meta.name.clone();
        let captured = self.fire(
            &name,
            TriggerTiming::Before,
            TriggerEvent::Delete,
            None,
            &t.rows[pos],
            flags,
        )?;
        self.enqueue(captured);
        self.tables[index].rows.remove(pos);
        Ok(1)
    }

    fn entry_mut(&mut self, id: u64) -> Option<&mut QueueEntry> {
        self.queue.iter_mut().find(|e| e.id == id)
    }
}

/// Shared state of one simulated instance. Clones refer to the same instance.
#[derive(Clone)]
pub struct MemoryDatabase {
    side: Side,
    state: Arc<Mutex<DbState>>,
}

impl MemoryDatabase {
    pub fn new(side: Side) -> Self {
        let current_user = match side {
            Side::Local => "pos@localhost",
            Side::Remote => "web@%",
        }
        .to_string();
        let mut users = BTreeSet::new();
        users.insert(current_user.clone());
        Self {
            side,
            state: Arc::new(Mutex::new(DbState {
                version: "8.0.36".to_string(),
                tables: Vec::new(),
                queue_exists: false,
                queue: Vec::new(),
                next_queue_id: 0,
                triggers: Vec::new(),
                users,
                current_user,
                can_read_users: true,
                can_set_definer: true,
                reachable: true,
                now: chrono::Utc::now().naive_utc(),
                failing_tables: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DbState> {
        // A panic in another test thread must not hide this instance's state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Open a new session.
    pub fn session(&self) -> MemoryInstance {
        MemoryInstance {
            db: self.clone(),
            flags: HashSet::new(),
            poisoned: false,
        }
    }

    pub fn set_version(&self, version: &str) {
        self.lock().version = version.to_string();
    }

    pub fn create_table(&self, meta: TableMetadata) {
        let mut state = self.lock();
        state.tables.retain(|t| !t.meta.name.eq_ignore_ascii_case(&meta.name));
        state.tables.push(MemoryTable {
            meta,
            rows: Vec::new(),
            auto_timestamp: None,
        });
    }

    pub fn set_auto_timestamp(&self, table: &str, column: &str) {
        let mut state = self.lock();
        if let Ok(index) = state.table_index(table) {
            state.tables[index].auto_timestamp = Some(column.to_string());
        }
    }

    pub fn drop_table(&self, table: &str) {
        let mut state = self.lock();
        state.tables.retain(|t| !t.meta.name.eq_ignore_ascii_case(table));
        state.triggers.retain(|t| !t.info.table.eq_ignore_ascii_case(table));
    }

    fn stamp(state: &DbState, table: &str, row: &mut RowImage) {
        if let Some(column) = state.table(table).and_then(|t| t.auto_timestamp.clone()) {
            if row_value(row, &column).is_none() {
                row.insert(column, super::datetime_value(state.now));
            }
        }
    }

    /// Application insert, as done by the booking endpoints. Fires triggers.
    pub fn insert_row(&self, table: &str, mut row: RowImage) -> Result<()> {
        let mut state = self.lock();
        Self::stamp(&state, table, &mut row);
        let key_column = Self::application_key(&state, table)?;
        state.insert(table, row, &key_column, &HashSet::new())
    }

    /// Application update of selected columns. Fires triggers.
    pub fn update_row(&self, table: &str, key: &str, mut changes: RowImage) -> Result<()> {
        let mut state = self.lock();
        Self::stamp(&state, table, &mut changes);
        let key_column = Self::application_key(&state, table)?;
        if !state.update(table, &key_column, key, &changes, &HashSet::new())? {
            bail!("No row {} in {}", key, table);
        }
        Ok(())
    }

    /// Application delete. Fires triggers.
    pub fn delete_row(&self, table: &str, key: &str) -> Result<()> {
        let mut state = self.lock();
        let key_column = Self::application_key(&state, table)?;
        state.delete(table, &key_column, key, &HashSet::new())?;
        Ok(())
    }

    /// Write a row directly, bypassing triggers (a restore, a bulk import).
    pub fn put_row_silently(&self, table: &str, row: RowImage) -> Result<()> {
        let mut state = self.lock();
        let key_column = Self::application_key(&state, table)?;
        let index = state.table_index(table)?;
        let t = &mut state.tables[index];
        t.check_columns(&row)?;
        let row = t.normalize(&row);
        let key = row_value(&row, &key_column)
            .map(render_key)
            .ok_or_else(|| anyhow!("Row has no {}", key_column))?;
        match t.position(&key_column, &key) {
            Some(pos) => t.rows[pos] = row,
            None => t.rows.push(row),
        }
        Ok(())
    }

    fn application_key(state: &DbState, table: &str) -> Result<String> {
        let t = state
            .table(table)
            .ok_or_else(|| anyhow!("Table '{}' doesn't exist", table))?;
        t.meta
            .primary_key
            .first()
            .or_else(|| t.meta.unique_keys.iter().find(|u| u.len() == 1).map(|u| &u[0]))
            .or_else(|| t.meta.columns.first())
            .cloned()
            .ok_or_else(|| anyhow!("Table '{}' has no columns", table))
    }

    pub fn row(&self, table: &str, key: &str) -> Option<RowImage> {
        let state = self.lock();
        let key_column = Self::application_key(&state, table).ok()?;
        let t = state.table(table)?;
        t.position(&key_column, key).map(|pos| t.rows[pos].clone())
    }

    pub fn rows(&self, table: &str) -> Vec<RowImage> {
        self.lock()
            .table(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn queue_entries(&self) -> Vec<QueueEntry> {
        self.lock().queue.clone()
    }

    /// Put an entry back to pending whatever its status, as if the run that
    /// applied it had died before recording the outcome.
    pub fn requeue(&self, id: u64) {
        let mut state = self.lock();
        if let Some(entry) = state.entry_mut(id) {
            entry.status = QueueStatus::Pending;
            entry.processed_at = None;
        }
    }

    /// Queue entries for one record, matched case-insensitively on the table.
    pub fn queue_entries_for(&self, table: &str, record_id: &str) -> Vec<QueueEntry> {
        self.lock()
            .queue
            .iter()
            .filter(|e| e.table_name.eq_ignore_ascii_case(table) && e.record_id == record_id)
            .cloned()
            .collect()
    }

    pub fn triggers(&self) -> Vec<TriggerInfo> {
        self.lock().triggers.iter().map(|t| t.info.clone()).collect()
    }

    /// Install a trigger that is not ours (an audit trigger written by
    /// someone else, or one imported from another instance).
    pub fn add_foreign_trigger(&self, info: TriggerInfo) {
        self.lock().triggers.push(MemoryTrigger {
            info,
            capture: None,
        });
    }

    /// Rewrite the recorded definer of a trigger, as an import would.
    pub fn set_trigger_definer(&self, name: &str, definer: &str) {
        let mut state = self.lock();
        for trigger in state.triggers.iter_mut() {
            if trigger.info.name.eq_ignore_ascii_case(name) {
                trigger.info.definer = definer.to_string();
            }
        }
    }

    pub fn remove_trigger(&self, name: &str) {
        self.lock()
            .triggers
            .retain(|t| !t.info.name.eq_ignore_ascii_case(name));
    }

    pub fn add_user(&self, definer: &str) {
        self.lock().users.insert(definer.to_string());
    }

    pub fn set_can_read_users(&self, allowed: bool) {
        self.lock().can_read_users = allowed;
    }

    pub fn set_can_set_definer(&self, allowed: bool) {
        self.lock().can_set_definer = allowed;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Make every destination write to a table fail with `message`.
    pub fn fail_writes_to(&self, table: &str, message: &str) {
        self.lock()
            .failing_tables
            .insert(table.to_ascii_lowercase(), message.to_string());
    }

    pub fn clear_write_failures(&self) {
        self.lock().failing_tables.clear();
    }

    pub fn now(&self) -> NaiveDateTime {
        self.lock().now
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.now += chrono_duration(by);
    }
}

/// One session with a [`MemoryDatabase`].
pub struct MemoryInstance {
    db: MemoryDatabase,
    flags: HashSet<String>,
    poisoned: bool,
}

impl MemoryInstance {
    pub fn flag_is_set(&self, name: &str) -> bool {
        self.flags.contains(name)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Yield to other tasks, then fail if the session cannot be used.
    async fn enter(&self) -> Result<MutexGuard<'_, DbState>> {
        tokio::task::yield_now().await;
        if self.poisoned {
            return Err(ConnectionLost("session discarded after an unreleased loop guard".into()).into());
        }
        let state = self.db.lock();
        if !state.reachable {
            return Err(ConnectionLost(format!("{} instance is unreachable", self.db.side)).into());
        }
        Ok(state)
    }
}

#[async_trait]
impl Instance for MemoryInstance {
    fn side(&self) -> Side {
        self.db.side
    }

    async fn server_version(&mut self) -> Result<String> {
        Ok(self.enter().await?.version.clone())
    }

    async fn current_user(&mut self) -> Result<String> {
        Ok(self.enter().await?.current_user.clone())
    }

    async fn describe_table(&mut self, table: &str) -> Result<Option<TableMetadata>> {
        let state = self.enter().await?;
        Ok(state.table(table).map(|t| t.meta.clone()))
    }

    async fn fetch_row(&mut self, table: &str, key_column: &str, key: &str) -> Result<Option<RowImage>> {
        let state = self.enter().await?;
        let t = state
            .table(table)
            .ok_or_else(|| anyhow!("Table '{}' doesn't exist", table))?;
        Ok(t.position(key_column, key).map(|pos| t.rows[pos].clone()))
    }

    async fn upsert_row(&mut self, table: &str, key_column: &str, row: &RowImage) -> Result<()> {
        let flags = self.flags.clone();
        let mut state = self.enter().await?;
        if let Some(message) = state.failing_tables.get(&table.to_ascii_lowercase()) {
            bail!("{}", message);
        }
        let key = row_value(row, key_column)
            .map(render_key)
            .ok_or_else(|| anyhow!("Row has no value for {}", key_column))?;
        let index = state.table_index(table)?;
        if state.tables[index].position(key_column, &key).is_some() {
            state.update(table, key_column, &key, row, &flags)?;
        } else {
            state.insert(table, row.clone(), key_column, &flags)?;
        }
        Ok(())
    }

    async fn delete_row(&mut self, table: &str, key_column: &str, key: &str) -> Result<u64> {
        let flags = self.flags.clone();
        let mut state = self.enter().await?;
        if let Some(message) = state.failing_tables.get(&table.to_ascii_lowercase()) {
            bail!("{}", message);
        }
        state.delete(table, key_column, key, &flags)
    }

    async fn rows_modified_within(&mut self, table: &str, timestamp_column: &str, window: u32) -> Result<Vec<RowImage>> {
        let state = self.enter().await?;
        let t = state
            .table(table)
            .ok_or_else(|| anyhow!("Table '{}' doesn't exist", table))?;
        if t.meta.column(timestamp_column).is_none() {
            bail!("Unknown column '{}' in 'where clause'", timestamp_column);
        }
        let since = state.now - hours(window);
        Ok(t.rows
            .iter()
            .filter(|row| {
                row_value(row, timestamp_column)
                    .and_then(value_to_datetime)
                    .map(|ts| ts >= since)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn set_session_flag(&mut self, name: &str) -> Result<()> {
        self.enter().await?;
        self.flags.insert(name.to_string());
        Ok(())
    }

    async fn clear_session_flag(&mut self, name: &str) -> Result<()> {
        self.enter().await?;
        self.flags.remove(name);
        Ok(())
    }

    fn poison(&mut self) {
        self.poisoned = true;
    }

    async fn ensure_queue_table(&mut self) -> Result<()> {
        self.enter().await?.queue_exists = true;
        Ok(())
    }

    async fn pending_entries(
        &mut self,
        after_id: u64,
        limit: usize,
        skipped_tables: &BTreeSet<String>,
    ) -> Result<Vec<QueueEntry>> {
        let state = self.enter().await?;
        if !state.queue_exists {
            bail!("Queue table doesn't exist");
        }
        let mut pending: Vec<QueueEntry> = state
            .queue
            .iter()
            .filter(|e| e.status == QueueStatus::Pending && e.id > after_id)
            .filter(|e| !skipped_tables.contains(&e.table_name.to_ascii_lowercase()))
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.id);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn claim_entry(&mut self, id: u64) -> Result<bool> {
        let mut state = self.enter().await?;
        let now = state.now;
        match state.entry_mut(id) {
            Some(entry) if entry.status == QueueStatus::Pending => {
                entry.status = QueueStatus::Processing;
                entry.processed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_entry(&mut self, id: u64) -> Result<()> {
        let mut state = self.enter().await?;
        let now = state.now;
        if let Some(entry) = state.entry_mut(id) {
            if entry.status == QueueStatus::Processing {
                entry.status = QueueStatus::Done;
                entry.processed_at = Some(now);
                entry.error_message = None;
            }
        }
        Ok(())
    }

    async fn record_failure(&mut self, id: u64, message: &str, max_retries: u32) -> Result<QueueStatus> {
        let mut state = self.enter().await?;
        let now = state.now;
        let entry = state
            .entry_mut(id)
            .ok_or_else(|| anyhow!("Queue entry {} vanished", id))?;
        if entry.status == QueueStatus::Processing {
            entry.attempts += 1;
            entry.error_message = Some(truncate_error(message));
            entry.processed_at = Some(now);
            entry.status = if entry.attempts > max_retries {
                QueueStatus::Failed
            } else {
                QueueStatus::Pending
            };
        }
        Ok(entry.status)
    }

    async fn release_entry(&mut self, id: u64) -> Result<()> {
        let mut state = self.enter().await?;
        if let Some(entry) = state.entry_mut(id) {
            if entry.status == QueueStatus::Processing {
                entry.status = QueueStatus::Pending;
                entry.processed_at = None;
            }
        }
        Ok(())
    }

    async fn reclaim_stale(&mut self, older_than: Duration) -> Result<u64> {
        let mut state = self.enter().await?;
        let cutoff = state.now - chrono_duration(older_than);
        let mut reclaimed = 0;
        for entry in state.queue.iter_mut() {
            let stale = entry.processed_at.map(|at| at < cutoff).unwrap_or(true);
            if entry.status == QueueStatus::Processing && stale {
                entry.status = QueueStatus::Pending;
                entry.processed_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn queue_health(&mut self) -> Result<QueueHealth> {
        let state = self.enter().await?;
        let mut health = QueueHealth::default();
        for entry in &state.queue {
            match entry.status {
                QueueStatus::Pending => health.pending += 1,
                QueueStatus::Processing => health.processing += 1,
                QueueStatus::Done => health.done += 1,
                QueueStatus::Failed => health.failed += 1,
            }
        }
        health.oldest_pending_at = state
            .queue
            .iter()
            .filter(|e| e.status == QueueStatus::Pending)
            .map(|e| e.created_at)
            .min();
        health.oldest_pending_age_secs = health
            .oldest_pending_at
            .map(|at| (state.now - at).num_seconds());
        Ok(health)
    }

    async fn list_entries(&mut self, status: Option<QueueStatus>, limit: usize) -> Result<Vec<QueueEntry>> {
        let state = self.enter().await?;
        let mut entries: Vec<QueueEntry> = state
            .queue
            .iter()
            .filter(|e| status.map(|s| e.status == s).unwrap_or(true))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn retry_failed(&mut self, table: Option<&str>) -> Result<u64> {
        let mut state = self.enter().await?;
        let mut reset = 0;
        for entry in state.queue.iter_mut() {
            let table_matches = table
                .map(|t| entry.table_name.eq_ignore_ascii_case(t))
                .unwrap_or(true);
            if entry.status == QueueStatus::Failed && table_matches {
                entry.status = QueueStatus::Pending;
                entry.attempts = 0;
                entry.error_message = None;
                entry.processed_at = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn prune_done(&mut self, older_than_days: u32) -> Result<u64> {
        let mut state = self.enter().await?;
        let cutoff = state.now - hours(older_than_days.saturating_mul(24));
        let before = state.queue.len();
        state
            .queue
            .retain(|e| !(e.status == QueueStatus::Done && e.created_at < cutoff));
        Ok((before - state.queue.len()) as u64)
    }

    async fn list_triggers(&mut self, table: &str) -> Result<Vec<TriggerInfo>> {
        let state = self.enter().await?;
        Ok(state
            .triggers
            .iter()
            .filter(|t| t.info.table.eq_ignore_ascii_case(table))
            .map(|t| t.info.clone())
            .collect())
    }

    async fn definer_exists(&mut self, definer: &str) -> Result<Option<bool>> {
        let state = self.enter().await?;
        if state.can_read_users {
            return Ok(Some(state.users.contains(definer)));
        }
        if definer == state.current_user {
            Ok(Some(true))
        } else {
            Ok(None)
        }
    }

    async fn create_trigger(&mut self, definition: &TriggerDefinition) -> Result<()> {
        let mut state = self.enter().await?;
        if state
            .triggers
            .iter()
            .any(|t| t.info.name.eq_ignore_ascii_case(&definition.name))
        {
            bail!("Trigger already exists");
        }
        let table = state
            .table(&definition.table)
            .ok_or_else(|| anyhow!("Table '{}' doesn't exist", definition.table))?
            .meta
            .name
            .clone();
        if !supports_multiple_triggers(&state.version)
            && state.triggers.iter().any(|t| {
                t.info.table.eq_ignore_ascii_case(&table)
                    && t.info.timing == definition.timing
                    && t.info.event == definition.event
            })
        {
            bail!(
                "This version of MySQL doesn't yet support 'multiple triggers with the same \
                 action time and event for one table'"
            );
        }
        let definer = match &definition.definer {
            Some(d) if *d != state.current_user && !state.can_set_definer => {
                bail!("Access denied; you need (at least one of) the SUPER or SET_USER_ID privilege(s) for this operation");
            }
            Some(d) => d.clone(),
            None => state.current_user.clone(),
        };
        state.triggers.push(MemoryTrigger {
            info: TriggerInfo {
                name: definition.name.clone(),
                table,
                timing: definition.timing,
                event: definition.event,
                definer,
                body: definition.body.clone(),
            },
            capture: definition.capture.clone(),
        });
        Ok(())
    }

    async fn drop_trigger(&mut self, name: &str) -> Result<()> {
        self.enter()
            .await?
            .triggers
            .retain(|t| !t.info.name.eq_ignore_ascii_case(name));
        Ok(())
    }

    async fn probe_capture(&mut self, table: &str, key_column: &str) -> Result<ProbeOutcome> {
        let flags = self.flags.clone();
        let state = self.enter().await?;
        let t = state
            .table(table)
            .ok_or_else(|| anyhow!("Table '{}' doesn't exist", table))?;
        let Some(row) = t.rows.first() else {
            return Ok(ProbeOutcome::NoRows);
        };
        if row_value(row, key_column).is_none() {
            bail!("Unknown column '{}' in 'field list'", key_column);
        }
        // Rolled back: the queue rows are computed but never stored.
        let captured = state.fire(
            &t.meta.name,
            TriggerTiming::After,
            TriggerEvent::Update,
            Some(row),
            row,
            &flags,
        )?;
        Ok(if captured.is_empty() {
            ProbeOutcome::Missing
        } else {
            ProbeOutcome::Captured
        })
    }
}

/// Hands out sessions on a pair of in-memory instances.
#[derive(Clone)]
pub struct MemoryConnector {
    pub local: MemoryDatabase,
    pub remote: MemoryDatabase,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            local: MemoryDatabase::new(Side::Local),
            remote: MemoryDatabase::new(Side::Remote),
        }
    }

    pub fn database(&self, side: Side) -> &MemoryDatabase {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, side: Side, _retries: u32) -> Result<Box<dyn Instance>> {
        let db = self.database(side);
        if !db.lock().reachable {
            return Err(ConnectionLost(format!("cannot connect to {} instance", side)).into());
        }
        Ok(Box::new(db.session()))
    }
}
