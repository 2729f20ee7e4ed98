// ABOUTME: SQL builders for destination writes and source reads addressed by key column
// ABOUTME: Also reshapes a source row image into the destination's column spelling

use anyhow::{bail, Result};
use tracing::debug;

use crate::instance::RowImage;
use crate::replication::resolver::TableKey;
use crate::utils::quote_mysql_ident;

/// Build `INSERT ... ON DUPLICATE KEY UPDATE` for the given columns.
///
/// Every non-key column is overwritten from the inserted values, so applying
/// the same row twice leaves the same state. The key column is reassigned to
/// itself when it is the only column, which keeps the statement a no-op on
/// conflict instead of an error.
pub fn build_upsert_query(table: &str, key_column: &str, columns: &[String]) -> String {
    let quoted_table = quote_mysql_ident(table);
    let column_list: Vec<String> = columns.iter().map(|c| quote_mysql_ident(c)).collect();
    let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !c.eq_ignore_ascii_case(key_column))
        .map(|c| {
            let quoted = quote_mysql_ident(c);
            format!("{} = VALUES({})", quoted, quoted)
        })
        .collect();

    let update_clause = if updates.is_empty() {
        let quoted_key = quote_mysql_ident(key_column);
        format!("{} = {}", quoted_key, quoted_key)
    } else {
        updates.join(", ")
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
        quoted_table,
        column_list.join(", "),
        placeholders.join(", "),
        update_clause
    )
}

pub fn build_delete_query(table: &str, key_column: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {} = ?",
        quote_mysql_ident(table),
        quote_mysql_ident(key_column)
    )
}

pub fn build_select_row_query(table: &str, key_column: &str) -> String {
    format!(
        "SELECT * FROM {} WHERE {} = ? LIMIT 1",
        quote_mysql_ident(table),
        quote_mysql_ident(key_column)
    )
}

/// Rows whose timestamp lies within the trailing window of `?` hours.
pub fn build_window_query(table: &str, timestamp_column: &str) -> String {
    format!(
        "SELECT * FROM {} WHERE {} >= NOW() - INTERVAL ? HOUR",
        quote_mysql_ident(table),
        quote_mysql_ident(timestamp_column)
    )
}

/// Touch one row without changing it; used by the capture probe.
pub fn build_touch_query(table: &str, key_column: &str) -> String {
    let key = quote_mysql_ident(key_column);
    format!(
        "UPDATE {} SET {} = {} WHERE {} = ?",
        quote_mysql_ident(table),
        key,
        key,
        key
    )
}

/// Convert a row read from the source into the destination's shape.
///
/// The source key column is renamed to the destination key column, other
/// columns take the destination's spelling, and columns the destination
/// does not have are dropped.
pub fn reshape_row(row: &RowImage, source: &TableKey, destination: &TableKey) -> Result<RowImage> {
    let mut shaped = RowImage::new();
    let mut has_key = false;
    let mut dropped = Vec::new();

    for (column, value) in row {
        if column.eq_ignore_ascii_case(&source.key_column) {
            shaped.insert(destination.key_column.clone(), value.clone());
            has_key = true;
        } else if let Some(dest_column) = destination.column(column) {
            if dest_column.eq_ignore_ascii_case(&destination.key_column) {
                // Differently named keys: never let a plain column overwrite the key.
                dropped.push(column.clone());
                continue;
            }
            shaped.insert(dest_column.to_string(), value.clone());
        } else {
            dropped.push(column.clone());
        }
    }

    if !has_key {
        bail!(
            "Row from {} has no value for key column {}",
            source.table,
            source.key_column
        );
    }
    if !dropped.is_empty() {
        debug!(
            "Dropping columns absent on {}: {}",
            destination.table,
            dropped.join(", ")
        );
    }
    Ok(shaped)
}
