// ABOUTME: Shared fixtures for the in-memory replication tests
// ABOUTME: Two booking instances whose Guests tables disagree on name and key casing

#![allow(dead_code)]

use booking_replicator::config::{ReplicatorConfig, TableConfig};
use booking_replicator::instance::memory::{MemoryConnector, MemoryDatabase};
use booking_replicator::instance::{
    datetime_value, render_key, row_value, values_equivalent, RowImage, TableMetadata, Value,
};
use booking_replicator::replication::{ApplyEngine, QueueStatus};
use chrono::NaiveDateTime;

pub struct Fixture {
    pub connector: MemoryConnector,
    pub engine: ApplyEngine<MemoryConnector>,
}

impl Fixture {
    pub fn local(&self) -> &MemoryDatabase {
        &self.connector.local
    }

    pub fn remote(&self) -> &MemoryDatabase {
        &self.connector.remote
    }
}

/// Local spelling: `Guests` keyed by `ID`.
pub fn local_guests() -> TableMetadata {
    TableMetadata {
        name: "Guests".into(),
        columns: vec![
            "ID".into(),
            "Name".into(),
            "Email".into(),
            "Nights".into(),
            "updated_at".into(),
        ],
        primary_key: vec!["ID".into()],
        unique_keys: vec![],
    }
}

/// Remote spelling: `guests` keyed by `id`, plus a web-only column.
pub fn remote_guests() -> TableMetadata {
    TableMetadata {
        name: "guests".into(),
        columns: vec![
            "id".into(),
            "name".into(),
            "email".into(),
            "nights".into(),
            "updated_at".into(),
            "web_session".into(),
        ],
        primary_key: vec!["id".into()],
        unique_keys: vec![],
    }
}

pub fn rooms() -> TableMetadata {
    TableMetadata {
        name: "Rooms".into(),
        columns: vec!["room_id".into(), "label".into(), "updated_at".into()],
        primary_key: vec!["room_id".into()],
        unique_keys: vec![],
    }
}

pub fn text(value: &str) -> Value {
    Value::Bytes(value.as_bytes().to_vec())
}

pub fn guest(id: i64, name: &str) -> RowImage {
    let mut row = RowImage::new();
    row.insert("id".into(), Value::Int(id));
    row.insert("name".into(), text(name));
    row.insert("email".into(), text(&format!("{}@example.com", name.to_lowercase())));
    row.insert("nights".into(), Value::Int(2));
    row
}

pub fn guest_at(id: i64, name: &str, updated_at: NaiveDateTime) -> RowImage {
    let mut row = guest(id, name);
    row.insert("updated_at".into(), datetime_value(updated_at));
    row
}

pub fn changes(column: &str, value: Value) -> RowImage {
    let mut row = RowImage::new();
    row.insert(column.into(), value);
    row
}

pub fn config(tables: Vec<TableConfig>) -> ReplicatorConfig {
    ReplicatorConfig::new(tables)
}

/// Instances with Guests created (no triggers yet).
pub fn bare_fixture(config: ReplicatorConfig) -> Fixture {
    let connector = MemoryConnector::new();
    connector.local.create_table(local_guests());
    connector.local.set_auto_timestamp("Guests", "updated_at");
    connector.remote.create_table(remote_guests());
    connector.remote.set_auto_timestamp("guests", "updated_at");
    let engine = ApplyEngine::new(config, connector.clone());
    Fixture { connector, engine }
}

/// Guests replicated with capture triggers installed on both sides.
pub async fn fixture() -> Fixture {
    let fx = bare_fixture(config(vec![TableConfig::new("Guests")]));
    install(&fx).await;
    fx
}

pub async fn install(fx: &Fixture) {
    let outcome = fx.engine.install_or_repair_triggers(None).await.unwrap();
    assert!(outcome.errors.is_empty(), "install errors: {:?}", outcome.errors);
}

pub fn pending(db: &MemoryDatabase) -> usize {
    db.queue_entries()
        .iter()
        .filter(|e| e.status == QueueStatus::Pending)
        .count()
}

pub fn statuses(db: &MemoryDatabase, table: &str, record: &str) -> Vec<QueueStatus> {
    db.queue_entries_for(table, record)
        .into_iter()
        .map(|e| e.status)
        .collect()
}

pub fn column_text(row: &RowImage, column: &str) -> Option<String> {
    row_value(row, column).map(render_key)
}

/// Both instances hold the same values for every column they share.
pub fn assert_converged(fx: &Fixture, key: &str) {
    let local = fx.local().row("Guests", key);
    let remote = fx.remote().row("guests", key);
    match (local, remote) {
        (None, None) => {}
        (Some(local), Some(remote)) => {
            for (column, value) in &local {
                let other = row_value(&remote, column)
                    .unwrap_or_else(|| panic!("remote row {} lacks {}", key, column));
                assert!(
                    values_equivalent(value, other),
                    "column {} differs for {}: {:?} vs {:?}",
                    column,
                    key,
                    value,
                    other
                );
            }
        }
        (local, remote) => panic!("row {} present on one side only: {:?} / {:?}", key, local, remote),
    }
}
