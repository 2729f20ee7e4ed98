// ABOUTME: Resolves the identifying column of each replicated table on each instance
// ABOUTME: Reads instance metadata once, caches per (side, table), invalidated after apply errors

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::config::TableConfig;
use crate::instance::{Instance, Side, TableMetadata};

/// The identifying column of one table on one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableKey {
    /// Table name with this instance's casing.
    pub table: String,
    /// Key column with this instance's spelling.
    pub key_column: String,
    pub columns: Vec<String>,
}

impl TableKey {
    /// This instance's spelling of a column, matched case-insensitively.
    pub fn column(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.as_str() == name)
            .or_else(|| self.columns.iter().find(|c| c.eq_ignore_ascii_case(name)))
            .map(String::as_str)
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The table does not exist on the instance. Affects individual entries.
    #[error("table {table} does not exist on {side}")]
    TableMissing { side: Side, table: String },

    /// The table exists but has no single usable key column. Excludes the table.
    #[error("table {table} on {side} has no usable key: {reason}")]
    NoUsableKey {
        side: Side,
        table: String,
        reason: String,
    },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Choose the identifying column from table metadata.
///
/// Preference: a single-column PRIMARY KEY, then a single-column unique
/// index (the one matching `key_hint` if several). Only declared keys
/// qualify: a composite primary key is never narrowed to one of its
/// columns, and a hinted column without a unique index is rejected, since
/// either would address more than one row.
pub fn select_key_column(meta: &TableMetadata, key_hint: Option<&str>) -> Result<String, String> {
    match meta.primary_key.len() {
        1 => return Ok(meta.primary_key[0].clone()),
        0 => {}
        _ => {
            return Err(format!(
                "composite primary key ({}) cannot be addressed by a single column",
                meta.primary_key.join(", ")
            ))
        }
    }

    let single_unique: Vec<&String> = meta
        .unique_keys
        .iter()
        .filter(|cols| cols.len() == 1)
        .map(|cols| &cols[0])
        .collect();

    if let Some(hint) = key_hint {
        if let Some(col) = single_unique.iter().find(|c| c.eq_ignore_ascii_case(hint)) {
            return Ok((*col).clone());
        }
    }
    if let Some(col) = single_unique.first() {
        return Ok((*col).clone());
    }

    match key_hint.and_then(|hint| meta.column(hint)) {
        Some(col) => Err(format!(
            "no primary key or single-column unique index; key_hint column '{}' is not unique",
            col
        )),
        None => Err("no primary key or single-column unique index".to_string()),
    }
}

/// Cached per-instance key resolution shared by every run of an engine.
#[derive(Debug, Default)]
pub struct KeyResolver {
    cache: Mutex<HashMap<(Side, String), TableKey>>,
}

impl KeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn cache_key(side: Side, table: &str) -> (Side, String) {
        (side, table.to_ascii_lowercase())
    }

    pub fn cached(&self, side: Side, table: &str) -> Option<TableKey> {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(&Self::cache_key(side, table)).cloned())
    }

    /// Resolve a configured table on the given session's instance.
    pub async fn resolve(
        &self,
        session: &mut dyn Instance,
        table: &TableConfig,
    ) -> Result<TableKey, ResolveError> {
        let side = session.side();
        if let Some(hit) = self.cached(side, &table.name) {
            return Ok(hit);
        }

        let meta = session
            .describe_table(&table.name)
            .await?
            .ok_or_else(|| ResolveError::TableMissing {
                side,
                table: table.name.clone(),
            })?;

        let key_column = select_key_column(&meta, table.key_hint.as_deref()).map_err(|reason| {
            ResolveError::NoUsableKey {
                side,
                table: table.name.clone(),
                reason,
            }
        })?;

        debug!(
            "Resolved key for {} on {}: {}.{}",
            table.name, side, meta.name, key_column
        );

        let resolved = TableKey {
            table: meta.name,
            key_column,
            columns: meta.columns,
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(Self::cache_key(side, &table.name), resolved.clone());
        }
        Ok(resolved)
    }

    /// Forget a resolution, e.g. after an apply error that may mean the
    /// table changed shape.
    pub fn invalidate(&self, side: Side, table: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(&Self::cache_key(side, table));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pk: &[&str], uniques: &[&[&str]], columns: &[&str]) -> TableMetadata {
        TableMetadata {
            name: "Guests".into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            primary_key: pk.iter().map(|c| c.to_string()).collect(),
            unique_keys: uniques
                .iter()
                .map(|u| u.iter().map(|c| c.to_string()).collect())
                .collect(),
        }
    }

    #[test]
    fn test_single_primary_key_wins() {
        let m = meta(&["ID"], &[&["email"]], &["ID", "email", "name"]);
        assert_eq!(select_key_column(&m, Some("email")).unwrap(), "ID");
    }

    #[test]
    fn test_composite_primary_key_is_rejected() {
        let m = meta(&["hut", "night"], &[], &["hut", "night", "beds"]);
        let err = select_key_column(&m, Some("hut")).unwrap_err();
        assert!(err.contains("composite"));
    }

    #[test]
    fn test_unique_index_used_without_primary_key() {
        let m = meta(&[], &[&["code", "hut"], &["guest_no"]], &["guest_no", "code", "hut"]);
        assert_eq!(select_key_column(&m, None).unwrap(), "guest_no");
    }

    #[test]
    fn test_hint_picks_among_unique_indexes() {
        let m = meta(&[], &[&["email"], &["GuestID"]], &["GuestID", "email"]);
        assert_eq!(select_key_column(&m, Some("guestid")).unwrap(), "GuestID");
    }

    #[test]
    fn test_hint_without_unique_index_is_rejected() {
        let m = meta(&[], &[], &["guest_no", "name"]);
        let err = select_key_column(&m, Some("GUEST_NO")).unwrap_err();
        assert!(err.contains("'guest_no' is not unique"), "{}", err);
        // A multi-column unique index does not make its first column unique.
        let m = meta(&[], &[&["guest_no", "hut"]], &["guest_no", "hut"]);
        assert!(select_key_column(&m, Some("guest_no")).is_err());
    }

    #[test]
    fn test_no_key_and_no_hint_fails() {
        let m = meta(&[], &[], &["name"]);
        assert!(select_key_column(&m, None).is_err());
        assert!(select_key_column(&m, Some("id")).is_err());
    }
}
