// ABOUTME: Apply engine: drains each side's queue onto the other instance and reports a SyncRun
// ABOUTME: Also hosts the window sync, trigger installation, probes and queue diagnostics

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ReplicatorConfig, SyncSettings, TableConfig};
use crate::error::{describe, SideFailure, SyncError};
use crate::instance::{Connector, Instance, ProbeOutcome, Side};
use crate::replication::guard::LoopGuard;
use crate::replication::queue::{Operation, QueueEntry, QueueHealth, QueueStatus};
use crate::replication::reconciler::{reconcile_window, WindowResult, WindowSide};
use crate::replication::resolver::{KeyResolver, ResolveError, TableKey};
use crate::replication::triggers::{inspect_capture, install_capture_triggers, TriggerReport};
use crate::replication::writer::reshape_row;

/// Counts for one direction of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectionStats {
    /// Rows upserted on the destination.
    pub applied: u64,
    /// Rows deleted on the destination (including no-op deletes).
    pub deleted: u64,
    /// Entries left alone: claimed by a concurrent run, or for a table
    /// excluded from replication.
    pub skipped: u64,
    /// Failed attempts returned to pending.
    pub retried: u64,
    /// Entries that exhausted their retries.
    pub failed: u64,
    /// Claims handed back because a connection dropped mid-entry.
    pub released: u64,
}

impl DirectionStats {
    pub fn changes(&self) -> u64 {
        self.applied + self.deleted
    }
}

/// Result of one invocation, consumed by the CLI, the ledger and dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub local_to_remote: DirectionStats,
    pub remote_to_local: DirectionStats,
    pub local_reachable: bool,
    pub remote_reachable: bool,
    pub errors: Vec<SyncError>,
}

impl SyncRun {
    pub fn new(trigger: &str) -> Self {
        Self {
            trigger: trigger.to_string(),
            started_at: Utc::now(),
            duration_ms: 0,
            local_to_remote: DirectionStats::default(),
            remote_to_local: DirectionStats::default(),
            local_reachable: true,
            remote_reachable: true,
            errors: Vec::new(),
        }
    }

    /// Both instances were reachable and nothing excluded a table or cut a
    /// direction short. Individual row failures do not count against it.
    pub fn is_success(&self) -> bool {
        self.local_reachable
            && self.remote_reachable
            && !self.errors.iter().any(SyncError::is_run_level)
    }

    fn set_unreachable(&mut self, side: Side) {
        match side {
            Side::Local => self.local_reachable = false,
            Side::Remote => self.remote_reachable = false,
        }
    }

    fn both_reachable(&self) -> bool {
        self.local_reachable && self.remote_reachable
    }

    fn stats_mut(&mut self, source: Side) -> &mut DirectionStats {
        match source {
            Side::Local => &mut self.local_to_remote,
            Side::Remote => &mut self.remote_to_local,
        }
    }

    /// Fold a table's window result into the run.
    pub fn absorb(&mut self, result: WindowResult) {
        add(&mut self.local_to_remote, &result.to_remote);
        add(&mut self.remote_to_local, &result.to_local);
        self.errors.extend(result.errors);
    }

    fn lost(&mut self, failure: SideFailure) {
        let message = describe(&failure.error);
        error!("Lost connection to {} instance: {}", failure.side, message);
        self.set_unreachable(failure.side);
        self.errors.push(SyncError::Connectivity {
            side: failure.side,
            message,
        });
    }
}

fn add(into: &mut DirectionStats, from: &DirectionStats) {
    into.applied += from.applied;
    into.deleted += from.deleted;
    into.skipped += from.skipped;
    into.retried += from.retried;
    into.failed += from.failed;
    into.released += from.released;
}

/// Limits for one `run_sync`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum entries drained per side.
    pub limit: usize,
    pub connect_retries: u32,
    /// Stop starting new entries after this instant. Entries not reached
    /// stay pending.
    pub deadline: Option<Instant>,
}

impl RunOptions {
    pub fn scheduled(settings: &SyncSettings) -> Self {
        Self {
            limit: settings.batch_size,
            connect_retries: settings.connect_retries,
            deadline: None,
        }
    }

    /// Inline calls never retry a connection and stop at the budget.
    pub fn inline(settings: &SyncSettings) -> Self {
        Self {
            limit: settings.inline_batch_size,
            connect_retries: 0,
            deadline: Some(Instant::now() + settings.inline_budget()),
        }
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Per-run bookkeeping shared by both directions.
#[derive(Default)]
struct RunState {
    /// Lowercased tables that cannot replicate this run: no usable key on
    /// some instance, disabled, or not configured. Their entries stay
    /// pending and are left out of later queue reads.
    blocked: BTreeSet<String>,
    /// Lowercased tables whose configuration problem was already reported.
    reported: HashSet<String>,
}

enum Disposition {
    /// The entry used a batch slot.
    Handled,
    /// The entry's table is blocked for the rest of the run.
    Blocked,
}

enum Applied {
    Upserted,
    Deleted,
}

enum EntryFailure {
    /// Attributed to the entry; it counts an attempt.
    Entry(anyhow::Error),
    /// A connection dropped; the direction stops.
    Connection(SideFailure),
}

impl From<SideFailure> for EntryFailure {
    fn from(failure: SideFailure) -> Self {
        if failure.is_connectivity() {
            EntryFailure::Connection(failure)
        } else {
            EntryFailure::Entry(failure.error)
        }
    }
}

/// Key resolution of one table on one instance, as published to diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResolvedKey {
    Resolved { table: String, key_column: String },
    Unresolved { error: String },
    Unreachable { error: String },
}

/// A configured table with its key on each instance.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicatedTable {
    pub name: String,
    pub enabled: bool,
    pub local: ResolvedKey,
    pub remote: ResolvedKey,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TriggerRun {
    pub reports: Vec<TriggerReport>,
    pub errors: Vec<SyncError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub side: Side,
    pub table: String,
    /// `None` when the active probe could not run.
    pub outcome: Option<ProbeOutcome>,
    pub gaps: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeRun {
    pub reports: Vec<ProbeReport>,
    pub errors: Vec<SyncError>,
}

/// Queue health of one instance, or why it could not be read.
#[derive(Debug, Clone, Serialize)]
pub struct SideHealth {
    pub side: Side,
    pub reachable: bool,
    pub health: Option<QueueHealth>,
    pub error: Option<String>,
}

/// Replays captured changes between the two instances.
///
/// Every method takes `&self` and opens its own sessions, so one engine can
/// serve the inline hook and the scheduler concurrently. The only shared
/// state is the key resolver's cache.
pub struct ApplyEngine<C: Connector> {
    config: ReplicatorConfig,
    connector: C,
    resolver: KeyResolver,
}

impl<C: Connector> ApplyEngine<C> {
    pub fn new(config: ReplicatorConfig, connector: C) -> Self {
        Self {
            config,
            connector,
            resolver: KeyResolver::new(),
        }
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.config.sync
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    async fn open(&self, side: Side, retries: u32) -> Result<Box<dyn Instance>, SyncError> {
        self.connector.connect(side, retries).await.map_err(|e| {
            let message = describe(&e);
            warn!("{} instance unreachable: {}", side, message);
            SyncError::Connectivity { side, message }
        })
    }

    /// Drain both queues with the scheduled limits.
    pub async fn run_sync(&self, trigger: &str) -> SyncRun {
        self.run_sync_with_options(trigger, &RunOptions::scheduled(&self.config.sync))
            .await
    }

    /// Drain local -> remote, then remote -> local.
    ///
    /// Never fails: unreachable instances and row failures are reported in
    /// the returned run. When either instance cannot be reached neither
    /// queue is touched.
    pub async fn run_sync_with_options(&self, trigger: &str, options: &RunOptions) -> SyncRun {
        let started = Instant::now();
        let mut run = SyncRun::new(trigger);
        debug!("Starting sync run '{}' (limit {})", trigger, options.limit);

        let local = self.open(Side::Local, options.connect_retries).await;
        let remote = self.open(Side::Remote, options.connect_retries).await;
        let (mut local, mut remote) = match (local, remote) {
            (Ok(local), Ok(remote)) => (local, remote),
            (local, remote) => {
                for (side, result) in [(Side::Local, local.err()), (Side::Remote, remote.err())] {
                    if let Some(err) = result {
                        run.set_unreachable(side);
                        run.errors.push(err);
                    }
                }
                return self.finish(run, started);
            }
        };

        let mut state = RunState::default();
        self.drain(local.as_mut(), remote.as_mut(), options, &mut state, &mut run)
            .await;
        if run.both_reachable() && !options.expired() {
            self.drain(remote.as_mut(), local.as_mut(), options, &mut state, &mut run)
                .await;
        }

        self.finish(run, started)
    }

    fn finish(&self, mut run: SyncRun, started: Instant) -> SyncRun {
        run.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Sync run '{}' finished in {}ms: local->remote {} applied, {} deleted, {} failed; remote->local {} applied, {} deleted, {} failed; {} errors",
            run.trigger,
            run.duration_ms,
            run.local_to_remote.applied,
            run.local_to_remote.deleted,
            run.local_to_remote.failed,
            run.remote_to_local.applied,
            run.remote_to_local.deleted,
            run.remote_to_local.failed,
            run.errors.len()
        );
        run
    }

    /// Replay the source side's pending entries onto the destination.
    async fn drain(
        &self,
        source: &mut dyn Instance,
        destination: &mut dyn Instance,
        options: &RunOptions,
        state: &mut RunState,
        run: &mut SyncRun,
    ) {
        let side = source.side();
        let settings = &self.config.sync;

        match source.reclaim_stale(settings.claim_timeout()).await {
            Ok(0) => {}
            Ok(n) => info!("Returned {} abandoned claims on {} to pending", n, side),
            Err(e) => return self.abort_direction(SideFailure::new(side, e), &settings.queue_table, run),
        }

        let mut remaining = options.limit;
        let mut after = 0;
        while remaining > 0 {
            let entries = match source.pending_entries(after, remaining, &state.blocked).await {
                Ok(entries) => entries,
                Err(e) => return self.abort_direction(SideFailure::new(side, e), &settings.queue_table, run),
            };
            debug!("{} pending entries on {}", entries.len(), side);
            let exhausted = entries.len() < remaining;

            for entry in entries {
                if options.expired() {
                    debug!("Run budget spent; leaving remaining entries on {} pending", side);
                    return;
                }
                after = entry.id;
                match self.process_entry(source, destination, &entry, state, run).await {
                    Ok(Disposition::Handled) => remaining -= 1,
                    Ok(Disposition::Blocked) => {}
                    Err(failure) => return self.abort_direction(failure, &settings.queue_table, run),
                }
            }

            // Blocked entries gave their batch slots back; read on past them.
            if exhausted {
                break;
            }
        }
    }

    /// Stop a direction: the connection dropped or its queue is unusable.
    fn abort_direction(&self, failure: SideFailure, queue_table: &str, run: &mut SyncRun) {
        if failure.is_connectivity() {
            run.lost(failure);
        } else {
            let detail = describe(&failure.error);
            error!("Cannot read queue on {}: {}", failure.side, detail);
            run.errors.push(SyncError::CaptureGap {
                side: failure.side,
                table: queue_table.to_string(),
                detail,
            });
        }
    }

    fn exclude(&self, table: &str, message: String, side: Side, state: &mut RunState, run: &mut SyncRun) {
        let lowered = table.to_ascii_lowercase();
        if state.reported.insert(lowered) {
            error!("Excluding {} from replication: {} on {}", table, message, side);
            run.errors.push(SyncError::Configuration {
                side,
                table: table.to_string(),
                message,
            });
        }
    }

    /// Handle one entry. Returns `Err` when the direction cannot continue:
    /// a connection was lost or the source queue rejected a status change.
    async fn process_entry(
        &self,
        source: &mut dyn Instance,
        destination: &mut dyn Instance,
        entry: &QueueEntry,
        state: &mut RunState,
        run: &mut SyncRun,
    ) -> Result<Disposition, SideFailure> {
        let side = source.side();
        let lowered = entry.table_name.to_ascii_lowercase();
        if state.blocked.contains(&lowered) {
            run.stats_mut(side).skipped += 1;
            return Ok(Disposition::Blocked);
        }

        let table = match self.config.table(&entry.table_name) {
            Some(table) => table,
            None => {
                run.stats_mut(side).skipped += 1;
                state.blocked.insert(lowered);
                if self.config.tables.iter().any(|t| t.name.eq_ignore_ascii_case(&entry.table_name)) {
                    debug!("Skipping entry {} for disabled table {}", entry.id, entry.table_name);
                } else {
                    self.exclude(
                        &entry.table_name,
                        "table is captured but not configured for replication".to_string(),
                        side,
                        state,
                        run,
                    );
                }
                return Ok(Disposition::Blocked);
            }
        };

        let keys = match self.resolve_pair(source, destination, table).await {
            Ok(keys) => Ok(keys),
            Err((failed_side, ResolveError::NoUsableKey { reason, .. })) => {
                state.blocked.insert(lowered);
                run.stats_mut(side).skipped += 1;
                self.exclude(&table.name, reason, failed_side, state, run);
                return Ok(Disposition::Blocked);
            }
            Err((failed_side, ResolveError::Backend(e))) => {
                let failure = SideFailure::new(failed_side, e);
                if failure.is_connectivity() {
                    return Err(failure);
                }
                Err(failure.error)
            }
            Err((_, missing @ ResolveError::TableMissing { .. })) => Err(missing.into()),
        };

        match source.claim_entry(entry.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Entry {} on {} already claimed by another run", entry.id, side);
                run.stats_mut(side).skipped += 1;
                return Ok(Disposition::Handled);
            }
            Err(e) => return Err(SideFailure::new(side, e)),
        }

        let outcome = match keys {
            Ok((source_key, destination_key)) => self
                .apply_entry(source, destination, entry, &source_key, &destination_key)
                .await
                .map_err(EntryFailure::from),
            Err(e) => Err(EntryFailure::Entry(e)),
        };

        match outcome {
            Ok(applied) => {
                source
                    .complete_entry(entry.id)
                    .await
                    .map_err(SideFailure::on(side))?;
                let stats = run.stats_mut(side);
                match applied {
                    Applied::Upserted => stats.applied += 1,
                    Applied::Deleted => stats.deleted += 1,
                }
                Ok(Disposition::Handled)
            }
            Err(EntryFailure::Connection(failure)) => {
                // The entry did not fail; hand it back untouched if we still can.
                if failure.side != side {
                    if let Err(e) = source.release_entry(entry.id).await {
                        warn!("Could not release entry {} on {}: {:#}", entry.id, side, e);
                    } else {
                        run.stats_mut(side).released += 1;
                    }
                }
                Err(failure)
            }
            Err(EntryFailure::Entry(e)) => {
                self.resolver.invalidate(Side::Local, &table.name);
                self.resolver.invalidate(Side::Remote, &table.name);
                let message = describe(&e);
                let status = source
                    .record_failure(entry.id, &message, self.config.sync.max_retries)
                    .await
                    .map_err(SideFailure::on(side))?;
                let attempt = entry.attempts + 1;
                if status == QueueStatus::Failed {
                    error!(
                        "Entry {} ({} {} {}) from {} failed permanently after {} attempts: {}",
                        entry.id, entry.operation, entry.table_name, entry.record_id, side, attempt, message
                    );
                    run.stats_mut(side).failed += 1;
                } else {
                    warn!(
                        "Entry {} ({} {} {}) from {} failed on attempt {}: {}",
                        entry.id, entry.operation, entry.table_name, entry.record_id, side, attempt, message
                    );
                    run.stats_mut(side).retried += 1;
                }
                run.errors.push(SyncError::Apply {
                    side,
                    table: entry.table_name.clone(),
                    entry_id: Some(entry.id),
                    record_id: entry.record_id.clone(),
                    message,
                });
                Ok(Disposition::Handled)
            }
        }
    }

    async fn resolve_pair(
        &self,
        source: &mut dyn Instance,
        destination: &mut dyn Instance,
        table: &TableConfig,
    ) -> Result<(TableKey, TableKey), (Side, ResolveError)> {
        let source_side = source.side();
        let destination_side = destination.side();
        let source_key = self
            .resolver
            .resolve(source, table)
            .await
            .map_err(|e| (source_side, e))?;
        let destination_key = self
            .resolver
            .resolve(destination, table)
            .await
            .map_err(|e| (destination_side, e))?;
        Ok((source_key, destination_key))
    }

    /// Replay one claimed entry under the destination's loop guard.
    async fn apply_entry(
        &self,
        source: &mut dyn Instance,
        destination: &mut dyn Instance,
        entry: &QueueEntry,
        source_key: &TableKey,
        destination_key: &TableKey,
    ) -> Result<Applied, SideFailure> {
        let source_side = source.side();
        let dest_side = destination.side();
        let current = match entry.operation {
            Operation::Delete => None,
            Operation::Insert | Operation::Update => source
                .fetch_row(&source_key.table, &source_key.key_column, &entry.record_id)
                .await
                .map_err(SideFailure::on(source_side))?,
        };
        let shaped = match &current {
            Some(row) => Some(
                reshape_row(row, source_key, destination_key).map_err(SideFailure::on(source_side))?,
            ),
            None => None,
        };

        let flag = self.config.sync.loop_guard.as_str();
        let mut guard = LoopGuard::acquire(destination, flag)
            .await
            .map_err(SideFailure::on(dest_side))?;
        let written = match &shaped {
            Some(row) => guard
                .session()
                .upsert_row(&destination_key.table, &destination_key.key_column, row)
                .await
                .map(|_| Applied::Upserted),
            None => guard
                .session()
                .delete_row(&destination_key.table, &destination_key.key_column, &entry.record_id)
                .await
                .map(|removed| {
                    if removed == 0 {
                        debug!("{} {} already absent on {}", destination_key.table, entry.record_id, dest_side);
                    }
                    Applied::Deleted
                }),
        };
        let released = guard.release().await;
        let applied = written.map_err(SideFailure::on(dest_side))?;
        released.map_err(SideFailure::on(dest_side))?;
        Ok(applied)
    }

    /// Converge rows modified within the last `hours` on both instances,
    /// ignoring the queues. `table` limits the pass to one configured table.
    pub async fn force_window_sync(&self, table: Option<&str>, hours: u32) -> SyncRun {
        let started = Instant::now();
        let mut run = SyncRun::new("force-window");
        let retries = self.config.sync.connect_retries;

        let tables = match self.select_tables(table) {
            Ok(tables) => tables,
            Err(e) => {
                run.errors.push(SyncError::Configuration {
                    side: Side::Local,
                    table: table.unwrap_or_default().to_string(),
                    message: describe(&e),
                });
                return self.finish(run, started);
            }
        };

        let local = self.open(Side::Local, retries).await;
        let remote = self.open(Side::Remote, retries).await;
        let (mut local, mut remote) = match (local, remote) {
            (Ok(local), Ok(remote)) => (local, remote),
            (local, remote) => {
                for (side, result) in [(Side::Local, local.err()), (Side::Remote, remote.err())] {
                    if let Some(err) = result {
                        run.set_unreachable(side);
                        run.errors.push(err);
                    }
                }
                return self.finish(run, started);
            }
        };

        for table in tables {
            let keys = self.resolve_pair(local.as_mut(), remote.as_mut(), table).await;
            let (local_key, remote_key) = match keys {
                Ok(keys) => keys,
                Err((side, ResolveError::Backend(e))) => {
                    let failure = SideFailure::new(side, e);
                    if failure.is_connectivity() {
                        run.lost(failure);
                        break;
                    }
                    run.errors.push(SyncError::Configuration {
                        side,
                        table: table.name.clone(),
                        message: describe(&failure.error),
                    });
                    continue;
                }
                Err((side, e)) => {
                    error!("Skipping window sync of {}: {}", table.name, e);
                    run.errors.push(SyncError::Configuration {
                        side,
                        table: table.name.clone(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let wanted = table
                .timestamp_column
                .as_deref()
                .unwrap_or(&self.config.sync.timestamp_column);
            let (local_ts, remote_ts) = match (local_key.column(wanted), remote_key.column(wanted)) {
                (Some(l), Some(r)) => (l.to_string(), r.to_string()),
                (l, _) => {
                    let side = if l.is_none() { Side::Local } else { Side::Remote };
                    let message = format!("timestamp column {} not found", wanted);
                    error!("Skipping window sync of {}: {} on {}", table.name, message, side);
                    run.errors.push(SyncError::Configuration {
                        side,
                        table: table.name.clone(),
                        message,
                    });
                    continue;
                }
            };

            let local_side = WindowSide {
                key: &local_key,
                timestamp_column: &local_ts,
            };
            let remote_side = WindowSide {
                key: &remote_key,
                timestamp_column: &remote_ts,
            };
            match reconcile_window(
                local.as_mut(),
                remote.as_mut(),
                &table.name,
                &local_side,
                &remote_side,
                hours,
                &self.config.sync.loop_guard,
            )
            .await
            {
                Ok(result) => run.absorb(result),
                Err(failure) if failure.is_connectivity() => {
                    run.lost(failure);
                    break;
                }
                Err(failure) => {
                    let message = describe(&failure.error);
                    warn!("Window sync of {} failed on {}: {}", table.name, failure.side, message);
                    run.errors.push(SyncError::Apply {
                        side: failure.side.other(),
                        table: table.name.clone(),
                        entry_id: None,
                        record_id: "*".to_string(),
                        message,
                    });
                }
            }
        }

        self.finish(run, started)
    }

    /// The enabled tables, or the one named (which must be configured and enabled).
    fn select_tables(&self, name: Option<&str>) -> Result<Vec<&TableConfig>> {
        match name {
            Some(name) => match self.config.table(name) {
                Some(table) => Ok(vec![table]),
                None => bail!("table {} is not configured for replication (or is disabled)", name),
            },
            None => Ok(self.config.enabled_tables().collect()),
        }
    }

    /// Create the queue table and (re)install capture triggers on both instances.
    pub async fn install_or_repair_triggers(&self, table: Option<&str>) -> Result<TriggerRun> {
        let tables = self.select_tables(table)?;
        let mut outcome = TriggerRun::default();

        for side in [Side::Local, Side::Remote] {
            let mut session = match self.open(side, self.config.sync.connect_retries).await {
                Ok(session) => session,
                Err(err) => {
                    outcome.errors.push(err);
                    continue;
                }
            };
            if let Err(e) = session.ensure_queue_table().await {
                let message = describe(&e);
                error!("Cannot create queue table on {}: {}", side, message);
                outcome.errors.push(SyncError::CaptureGap {
                    side,
                    table: self.config.sync.queue_table.clone(),
                    detail: message,
                });
                continue;
            }

            for table in &tables {
                self.resolver.invalidate(side, &table.name);
                let key = match self.resolver.resolve(session.as_mut(), table).await {
                    Ok(key) => key,
                    Err(e) => {
                        error!("Not installing triggers for {} on {}: {}", table.name, side, e);
                        outcome.errors.push(SyncError::Configuration {
                            side,
                            table: table.name.clone(),
                            message: e.to_string(),
                        });
                        continue;
                    }
                };
                match install_capture_triggers(
                    session.as_mut(),
                    table,
                    &key,
                    self.config.instance(side),
                    &self.config.sync,
                )
                .await
                {
                    Ok(report) => outcome.reports.push(report),
                    Err(e) => {
                        let detail = describe(&e);
                        error!("Trigger installation for {} on {} failed: {}", table.name, side, detail);
                        outcome.errors.push(SyncError::CaptureGap {
                            side,
                            table: table.name.clone(),
                            detail,
                        });
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Check capture on both instances: trigger presence, definer validity
    /// and an active touch-and-roll-back probe.
    pub async fn probe(&self, table: Option<&str>) -> Result<ProbeRun> {
        let tables = self.select_tables(table)?;
        let mut outcome = ProbeRun::default();

        for side in [Side::Local, Side::Remote] {
            let mut session = match self.open(side, self.config.sync.connect_retries).await {
                Ok(session) => session,
                Err(err) => {
                    outcome.errors.push(err);
                    continue;
                }
            };
            for table in &tables {
                let key = match self.resolver.resolve(session.as_mut(), table).await {
                    Ok(key) => key,
                    Err(e) => {
                        outcome.errors.push(SyncError::Configuration {
                            side,
                            table: table.name.clone(),
                            message: e.to_string(),
                        });
                        continue;
                    }
                };

                let mut gaps = inspect_capture(session.as_mut(), &key, &self.config.sync).await?;
                let outcome_of_probe = match session.probe_capture(&key.table, &key.key_column).await {
                    Ok(ProbeOutcome::Missing) => {
                        gaps.push("a write to the table was not captured".to_string());
                        Some(ProbeOutcome::Missing)
                    }
                    Ok(result) => Some(result),
                    Err(e) => {
                        gaps.push(format!("probe failed: {}", describe(&e)));
                        None
                    }
                };

                for detail in &gaps {
                    warn!("Capture gap on {} for {}: {}", side, table.name, detail);
                    outcome.errors.push(SyncError::CaptureGap {
                        side,
                        table: table.name.clone(),
                        detail: detail.clone(),
                    });
                }
                outcome.reports.push(ProbeReport {
                    side,
                    table: table.name.clone(),
                    outcome: outcome_of_probe,
                    gaps,
                });
            }
        }

        Ok(outcome)
    }

    /// Queue health of both instances. An unreachable instance is reported,
    /// not raised.
    pub async fn queue_health(&self) -> Vec<SideHealth> {
        let mut out = Vec::new();
        for side in [Side::Local, Side::Remote] {
            let health = match self.open(side, 0).await {
                Ok(mut session) => session.queue_health().await.map_err(|e| describe(&e)),
                Err(err) => {
                    out.push(SideHealth {
                        side,
                        reachable: false,
                        health: None,
                        error: Some(err.to_string()),
                    });
                    continue;
                }
            };
            out.push(match health {
                Ok(health) => SideHealth {
                    side,
                    reachable: true,
                    health: Some(health),
                    error: None,
                },
                Err(error) => SideHealth {
                    side,
                    reachable: true,
                    health: None,
                    error: Some(error),
                },
            });
        }
        out
    }

    pub async fn queue_entries(
        &self,
        side: Side,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Result<Vec<QueueEntry>> {
        let mut session = self.connector.connect(side, self.config.sync.connect_retries).await?;
        session.list_entries(status, limit).await
    }

    pub async fn retry_failed(&self, side: Side, table: Option<&str>) -> Result<u64> {
        let mut session = self.connector.connect(side, self.config.sync.connect_retries).await?;
        let reset = session.retry_failed(table).await?;
        info!("Reset {} failed entries on {} to pending", reset, side);
        Ok(reset)
    }

    pub async fn prune_done(&self, side: Side, older_than_days: u32) -> Result<u64> {
        let mut session = self.connector.connect(side, self.config.sync.connect_retries).await?;
        let pruned = session.prune_done(older_than_days).await?;
        info!("Pruned {} done entries older than {} days on {}", pruned, older_than_days, side);
        Ok(pruned)
    }

    /// The configured tables with their resolved key on each instance.
    pub async fn replicated_tables(&self) -> Vec<ReplicatedTable> {
        let mut local = self.open(Side::Local, 0).await;
        let mut remote = self.open(Side::Remote, 0).await;
        let mut out = Vec::new();
        for table in &self.config.tables {
            out.push(ReplicatedTable {
                name: table.name.clone(),
                enabled: table.enabled,
                local: self.resolved_key(&mut local, table).await,
                remote: self.resolved_key(&mut remote, table).await,
            });
        }
        out
    }

    async fn resolved_key(
        &self,
        session: &mut Result<Box<dyn Instance>, SyncError>,
        table: &TableConfig,
    ) -> ResolvedKey {
        match session {
            Err(err) => ResolvedKey::Unreachable {
                error: err.to_string(),
            },
            Ok(session) => match self.resolver.resolve(session.as_mut(), table).await {
                Ok(key) => ResolvedKey::Resolved {
                    table: key.table,
                    key_column: key.key_column,
                },
                Err(e) => ResolvedKey::Unresolved {
                    error: e.to_string(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_requires_reachability() {
        let mut run = SyncRun::new("test");
        assert!(run.is_success());
        run.errors.push(SyncError::Apply {
            side: Side::Local,
            table: "Guests".into(),
            entry_id: Some(1),
            record_id: "1".into(),
            message: "bad".into(),
        });
        assert!(run.is_success());
        run.set_unreachable(Side::Remote);
        assert!(!run.is_success());
    }

    #[test]
    fn test_absorb_window_result() {
        let mut run = SyncRun::new("force-window");
        let mut result = WindowResult::default();
        result.to_remote.applied = 2;
        result.to_local.applied = 1;
        run.absorb(result);
        assert_eq!(run.local_to_remote.changes(), 2);
        assert_eq!(run.remote_to_local.changes(), 1);
    }

    #[test]
    fn test_inline_options_never_retry() {
        let settings = SyncSettings::default();
        let options = RunOptions::inline(&settings);
        assert_eq!(options.connect_retries, 0);
        assert_eq!(options.limit, settings.inline_batch_size);
        assert!(options.deadline.is_some());
        assert!(!RunOptions::scheduled(&settings).expired());
    }
}
