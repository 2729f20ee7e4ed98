// ABOUTME: Fallback window reconciler: converges rows modified in a trailing window by key and timestamp
// ABOUTME: Ignores the queue entirely; the newer row wins, ties with differing content go to local

use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::error::{describe, SideFailure, SyncError};
use crate::instance::{render_key, row_value, value_to_datetime, values_equivalent, Instance, RowImage, Side};
use crate::replication::engine::DirectionStats;
use crate::replication::guard::LoopGuard;
use crate::replication::resolver::TableKey;
use crate::replication::writer::reshape_row;

/// How to converge one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    InSync,
    CopyToRemote,
    CopyToLocal,
}

/// One side's view of a table during reconciliation.
pub struct WindowSide<'a> {
    pub key: &'a TableKey,
    pub timestamp_column: &'a str,
}

fn timestamp(row: &RowImage, column: &str) -> Option<NaiveDateTime> {
    row_value(row, column).and_then(value_to_datetime)
}

/// Whether the local row, shaped for the remote, matches the remote row on
/// every column the remote has.
fn same_content(local: &RowImage, remote: &RowImage, local_side: &WindowSide, remote_side: &WindowSide) -> bool {
    match reshape_row(local, local_side.key, remote_side.key) {
        Ok(shaped) => shaped.iter().all(|(column, value)| {
            row_value(remote, column)
                .map(|other| values_equivalent(value, other))
                .unwrap_or(false)
        }),
        Err(_) => false,
    }
}

/// Decide which side's version of a key to keep.
///
/// A row present on one side only is copied to the other. When both exist
/// the later timestamp wins; a row without a readable timestamp loses to one
/// with a timestamp. Equal timestamps with differing content keep local,
/// the point-of-sale instance.
pub fn decide(
    local: Option<&RowImage>,
    remote: Option<&RowImage>,
    local_side: &WindowSide,
    remote_side: &WindowSide,
) -> WindowDecision {
    match (local, remote) {
        (None, None) => WindowDecision::InSync,
        (Some(_), None) => WindowDecision::CopyToRemote,
        (None, Some(_)) => WindowDecision::CopyToLocal,
        (Some(l), Some(r)) => {
            if same_content(l, r, local_side, remote_side) {
                return WindowDecision::InSync;
            }
            let lt = timestamp(l, local_side.timestamp_column);
            let rt = timestamp(r, remote_side.timestamp_column);
            match (lt, rt) {
                (Some(lt), Some(rt)) if rt > lt => WindowDecision::CopyToLocal,
                (None, Some(_)) => WindowDecision::CopyToLocal,
                _ => WindowDecision::CopyToRemote,
            }
        }
    }
}

fn index_rows(rows: Vec<RowImage>, key_column: &str) -> BTreeMap<String, RowImage> {
    rows.into_iter()
        .filter_map(|row| {
            let key = row_value(&row, key_column).map(render_key)?;
            Some((key, row))
        })
        .collect()
}

/// Outcome of reconciling one table.
#[derive(Debug, Default)]
pub struct WindowResult {
    pub to_remote: DirectionStats,
    pub to_local: DirectionStats,
    pub compared: u64,
    pub errors: Vec<SyncError>,
}

async fn copy_row(
    destination: &mut dyn Instance,
    row: &RowImage,
    source_key: &TableKey,
    destination_key: &TableKey,
    loop_guard: &str,
) -> Result<()> {
    let shaped = reshape_row(row, source_key, destination_key)?;
    let mut guard = LoopGuard::acquire(destination, loop_guard).await?;
    let written = guard
        .session()
        .upsert_row(&destination_key.table, &destination_key.key_column, &shaped)
        .await;
    let released = guard.release().await;
    written?;
    released
}

/// Converge one table over the trailing window of `hours`.
///
/// Rows modified within the window on either side are compared by key; a
/// key seen on one side only is looked up on the other (its row there may
/// be older than the window). A connectivity failure aborts the table and is
/// returned with the side it happened on; row failures are collected and the
/// pass continues.
pub async fn reconcile_window(
    local: &mut dyn Instance,
    remote: &mut dyn Instance,
    table: &str,
    local_side: &WindowSide<'_>,
    remote_side: &WindowSide<'_>,
    hours: u32,
    loop_guard: &str,
) -> Result<WindowResult, SideFailure> {
    let local_rows = local
        .rows_modified_within(&local_side.key.table, local_side.timestamp_column, hours)
        .await
        .map_err(SideFailure::on(Side::Local))?;
    let remote_rows = remote
        .rows_modified_within(&remote_side.key.table, remote_side.timestamp_column, hours)
        .await
        .map_err(SideFailure::on(Side::Remote))?;
    let mut local_rows = index_rows(local_rows, &local_side.key.key_column);
    let mut remote_rows = index_rows(remote_rows, &remote_side.key.key_column);

    debug!(
        "Window of {}h on {}: {} local rows, {} remote rows",
        hours,
        table,
        local_rows.len(),
        remote_rows.len()
    );

    let mut keys: Vec<String> = local_rows.keys().chain(remote_rows.keys()).cloned().collect();
    keys.sort();
    keys.dedup();

    let mut result = WindowResult::default();

    for key in keys {
        if !local_rows.contains_key(&key) {
            if let Some(row) = local
                .fetch_row(&local_side.key.table, &local_side.key.key_column, &key)
                .await
                .map_err(SideFailure::on(Side::Local))?
            {
                local_rows.insert(key.clone(), row);
            }
        }
        if !remote_rows.contains_key(&key) {
            if let Some(row) = remote
                .fetch_row(&remote_side.key.table, &remote_side.key.key_column, &key)
                .await
                .map_err(SideFailure::on(Side::Remote))?
            {
                remote_rows.insert(key.clone(), row);
            }
        }

        result.compared += 1;
        let decision = decide(local_rows.get(&key), remote_rows.get(&key), local_side, remote_side);
        let (copy, stats, destination_side) = match decision {
            WindowDecision::InSync => continue,
            WindowDecision::CopyToRemote => (
                copy_row(
                    remote,
                    local_rows
                        .get(&key)
                        .ok_or_else(|| SideFailure::new(Side::Local, anyhow!("row {} vanished", key)))?,
                    local_side.key,
                    remote_side.key,
                    loop_guard,
                )
                .await,
                &mut result.to_remote,
                Side::Remote,
            ),
            WindowDecision::CopyToLocal => (
                copy_row(
                    local,
                    remote_rows
                        .get(&key)
                        .ok_or_else(|| SideFailure::new(Side::Remote, anyhow!("row {} vanished", key)))?,
                    remote_side.key,
                    local_side.key,
                    loop_guard,
                )
                .await,
                &mut result.to_local,
                Side::Local,
            ),
        };

        match copy {
            Ok(()) => stats.applied += 1,
            Err(e) if crate::error::is_connectivity(&e) => {
                return Err(SideFailure::new(destination_side, e))
            }
            Err(e) => {
                warn!("Window copy of {} {} to {} failed: {:#}", table, key, destination_side, e);
                stats.failed += 1;
                result.errors.push(SyncError::Apply {
                    side: destination_side.other(),
                    table: table.to_string(),
                    entry_id: None,
                    record_id: key.clone(),
                    message: describe(&e),
                });
            }
        }
    }

    info!(
        "Window sync of {} ({}h): compared {}, {} to remote, {} to local",
        table, hours, result.compared, result.to_remote.applied, result.to_local.applied
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{datetime_value, Value};
    use chrono::NaiveDate;

    fn key(table: &str, key_column: &str) -> TableKey {
        TableKey {
            table: table.into(),
            key_column: key_column.into(),
            columns: vec![key_column.into(), "name".into(), "updated_at".into()],
        }
    }

    fn row(key_column: &str, id: i64, name: &str, minute: u32) -> RowImage {
        let ts = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, minute, 0)
            .unwrap();
        let mut row = RowImage::new();
        row.insert(key_column.into(), Value::Int(id));
        row.insert("name".into(), Value::Bytes(name.as_bytes().to_vec()));
        row.insert("updated_at".into(), datetime_value(ts));
        row
    }

    #[test]
    fn test_newer_side_wins() {
        let lk = key("Guests", "ID");
        let rk = key("guests", "id");
        let l = WindowSide { key: &lk, timestamp_column: "updated_at" };
        let r = WindowSide { key: &rk, timestamp_column: "updated_at" };

        let older = row("ID", 1, "Smith", 5);
        let newer = row("id", 1, "Smyth", 9);
        assert_eq!(decide(Some(&older), Some(&newer), &l, &r), WindowDecision::CopyToLocal);

        let newer_local = row("ID", 1, "Smith", 10);
        assert_eq!(decide(Some(&newer_local), Some(&newer), &l, &r), WindowDecision::CopyToRemote);
    }

    #[test]
    fn test_identical_rows_are_in_sync() {
        let lk = key("Guests", "ID");
        let rk = key("guests", "id");
        let l = WindowSide { key: &lk, timestamp_column: "updated_at" };
        let r = WindowSide { key: &rk, timestamp_column: "updated_at" };
        assert_eq!(
            decide(Some(&row("ID", 1, "Smith", 5)), Some(&row("id", 1, "Smith", 5)), &l, &r),
            WindowDecision::InSync
        );
    }

    #[test]
    fn test_tie_prefers_local() {
        let k = key("Guests", "id");
        let s = WindowSide { key: &k, timestamp_column: "updated_at" };
        assert_eq!(
            decide(Some(&row("id", 1, "Smith", 5)), Some(&row("id", 1, "Jones", 5)), &s, &s),
            WindowDecision::CopyToRemote
        );
    }

    #[test]
    fn test_one_sided_rows_are_copied() {
        let k = key("Guests", "id");
        let s = WindowSide { key: &k, timestamp_column: "updated_at" };
        let r = row("id", 1, "Smith", 5);
        assert_eq!(decide(Some(&r), None, &s, &s), WindowDecision::CopyToRemote);
        assert_eq!(decide(None, Some(&r), &s, &s), WindowDecision::CopyToLocal);
    }
}
