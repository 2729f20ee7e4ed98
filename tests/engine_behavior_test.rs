// ABOUTME: Apply engine behaviour over in-memory instances: retry bound, concurrent runs,
// ABOUTME: unreachable instances, inline budget, abandoned claims and table exclusion

mod common;

use booking_replicator::config::TableConfig;
use booking_replicator::instance::{Instance, Side, TableMetadata, Value};
use booking_replicator::replication::{sync_on_page_load, ApplyEngine, QueueStatus};
use booking_replicator::SyncError;
use common::*;
use std::time::Duration;

#[tokio::test]
async fn test_entry_fails_after_retry_bound() {
    let mut cfg = config(vec![TableConfig::new("Guests")]);
    cfg.sync.max_retries = 2;
    let fx = bare_fixture(cfg);
    install(&fx).await;

    fx.remote()
        .fail_writes_to("guests", "Data too long for column 'name' at row 1");
    fx.local().insert_row("Guests", guest(1, "Abernathy-Featherstonehaugh")).unwrap();

    for attempt in 1..=2u32 {
        let run = fx.engine.run_sync("scheduled").await;
        assert_eq!(run.local_to_remote.retried, 1);
        let entry = &fx.local().queue_entries_for("Guests", "1")[0];
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempts, attempt);
        assert!(entry.error_message.as_deref().unwrap().contains("Data too long"));
    }

    let run = fx.engine.run_sync("scheduled").await;
    assert_eq!(run.local_to_remote.failed, 1);
    // Row failures do not make the run itself unsuccessful.
    assert!(run.is_success());
    let entry = &fx.local().queue_entries_for("Guests", "1")[0];
    assert_eq!(entry.status, QueueStatus::Failed);
    assert_eq!(entry.attempts, 3);

    let idle = fx.engine.run_sync("scheduled").await;
    assert_eq!(idle.local_to_remote.changes() + idle.local_to_remote.failed, 0);

    fx.remote().clear_write_failures();
    assert_eq!(fx.engine.retry_failed(Side::Local, Some("guests")).await.unwrap(), 1);
    let run = fx.engine.run_sync("scheduled").await;
    assert_eq!(run.local_to_remote.applied, 1);
    assert_eq!(statuses(fx.local(), "Guests", "1"), vec![QueueStatus::Done]);
    assert_converged(&fx, "1");
}

#[tokio::test]
async fn test_concurrent_runs_apply_each_entry_once() {
    let fx = fixture().await;
    for id in 1..=20 {
        fx.local().insert_row("Guests", guest(id, &format!("Guest{}", id))).unwrap();
    }

    let (inline, scheduled) = tokio::join!(
        fx.engine.run_sync("inline"),
        fx.engine.run_sync("scheduled")
    );

    assert_eq!(
        inline.local_to_remote.applied + scheduled.local_to_remote.applied,
        20
    );
    assert!(inline.errors.is_empty() && scheduled.errors.is_empty());
    assert_eq!(fx.remote().rows("guests").len(), 20);
    assert!(fx
        .local()
        .queue_entries()
        .iter()
        .all(|e| e.status == QueueStatus::Done && e.attempts == 0));
    assert!(fx.remote().queue_entries().is_empty());
}

#[tokio::test]
async fn test_unreachable_remote_leaves_queue_untouched() {
    let fx = fixture().await;
    fx.local().insert_row("Guests", guest(30, "Gray")).unwrap();
    fx.remote().set_reachable(false);

    let run = fx.engine.run_sync("scheduled").await;
    assert!(!run.is_success());
    assert!(run.local_reachable);
    assert!(!run.remote_reachable);
    assert!(run
        .errors
        .iter()
        .any(|e| matches!(e, SyncError::Connectivity { side: Side::Remote, .. })));
    let entry = &fx.local().queue_entries_for("Guests", "30")[0];
    assert_eq!(entry.status, QueueStatus::Pending);
    assert_eq!(entry.attempts, 0);

    let health = fx.engine.queue_health().await;
    assert!(health.iter().any(|h| h.side == Side::Remote && !h.reachable));

    fx.remote().set_reachable(true);
    let run = fx.engine.run_sync("scheduled").await;
    assert!(run.is_success());
    assert_eq!(statuses(fx.local(), "Guests", "30"), vec![QueueStatus::Done]);
}

#[tokio::test]
async fn test_inline_hook_respects_batch_and_budget() {
    let mut cfg = config(vec![TableConfig::new("Guests")]);
    cfg.sync.inline_batch_size = 3;
    let fx = bare_fixture(cfg);
    install(&fx).await;
    for id in 1..=5 {
        fx.local().insert_row("Guests", guest(id, &format!("Guest{}", id))).unwrap();
    }

    let run = sync_on_page_load(&fx.engine, "booking-saved").await.unwrap();
    assert_eq!(run.local_to_remote.applied, 3);
    assert_eq!(pending(fx.local()), 2);

    // A spent budget applies nothing and still does not fail.
    let mut cfg = config(vec![TableConfig::new("Guests")]);
    cfg.sync.inline_budget_ms = 0;
    let spent = ApplyEngine::new(cfg, fx.connector.clone());
    let run = sync_on_page_load(&spent, "booking-saved").await.unwrap();
    assert_eq!(run.local_to_remote.changes(), 0);
    assert_eq!(pending(fx.local()), 2);
}

#[tokio::test]
async fn test_inline_hook_swallows_outages() {
    let fx = fixture().await;
    fx.local().insert_row("Guests", guest(40, "Hart")).unwrap();
    fx.local().set_reachable(false);

    let run = sync_on_page_load(&fx.engine, "booking-saved").await.unwrap();
    assert!(!run.local_reachable);
    fx.local().set_reachable(true);
    assert_eq!(pending(fx.local()), 1);
}

#[tokio::test]
async fn test_abandoned_claim_is_reclaimed() {
    let fx = fixture().await;
    fx.local().insert_row("Guests", guest(50, "Ives")).unwrap();
    let id = fx.local().queue_entries_for("Guests", "50")[0].id;

    // A run that claimed the entry and then died.
    let mut crashed = fx.local().session();
    assert!(crashed.claim_entry(id).await.unwrap());

    let run = fx.engine.run_sync("scheduled").await;
    assert_eq!(run.local_to_remote.applied, 0);
    assert_eq!(statuses(fx.local(), "Guests", "50"), vec![QueueStatus::Processing]);

    let timeout = fx.engine.settings().claim_timeout();
    fx.local().advance(timeout + Duration::from_secs(1));
    let run = fx.engine.run_sync("scheduled").await;
    assert_eq!(run.local_to_remote.applied, 1);
    assert_eq!(statuses(fx.local(), "Guests", "50"), vec![QueueStatus::Done]);
    assert_converged(&fx, "50");
}

#[tokio::test]
async fn test_table_without_key_is_excluded_loudly() {
    let fx = bare_fixture(config(vec![
        TableConfig::new("AuditLog"),
        TableConfig::new("Guests"),
    ]));
    fx.local().create_table(TableMetadata {
        name: "AuditLog".into(),
        columns: vec!["entry".into(), "note".into()],
        primary_key: vec!["entry".into()],
        unique_keys: vec![],
    });
    fx.remote().create_table(TableMetadata {
        name: "AuditLog".into(),
        columns: vec!["entry".into(), "note".into()],
        primary_key: vec![],
        unique_keys: vec![],
    });
    let outcome = fx.engine.install_or_repair_triggers(None).await.unwrap();
    assert!(outcome.errors.iter().any(|e| matches!(
        e,
        SyncError::Configuration { side: Side::Remote, table, .. } if table == "AuditLog"
    )));

    let mut row = booking_replicator::instance::RowImage::new();
    row.insert("entry".into(), Value::Int(1));
    row.insert("note".into(), text("checked in"));
    fx.local().insert_row("AuditLog", row.clone()).unwrap();
    row.insert("entry".into(), Value::Int(2));
    fx.local().insert_row("AuditLog", row).unwrap();
    fx.local().insert_row("Guests", guest(60, "Jameson")).unwrap();

    let run = fx.engine.run_sync("scheduled").await;
    assert!(!run.is_success());
    let exclusions: Vec<&SyncError> = run
        .errors
        .iter()
        .filter(|e| matches!(e, SyncError::Configuration { .. }))
        .collect();
    assert_eq!(exclusions.len(), 1, "reported once per run: {:?}", run.errors);
    assert_eq!(run.local_to_remote.skipped, 2);
    assert_eq!(run.local_to_remote.applied, 1);
    for key in ["1", "2"] {
        let entry = &fx.local().queue_entries_for("AuditLog", key)[0];
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempts, 0);
    }
}

#[tokio::test]
async fn test_blocked_tables_do_not_starve_the_batch() {
    let fx = bare_fixture(config(vec![
        TableConfig::new("AuditLog"),
        TableConfig::new("Rooms"),
        TableConfig::new("Guests"),
    ]));
    let audit_log = |primary_key: Vec<String>| TableMetadata {
        name: "AuditLog".into(),
        columns: vec!["entry".into(), "note".into()],
        primary_key,
        unique_keys: vec![],
    };
    fx.local().create_table(audit_log(vec!["entry".into()]));
    fx.remote().create_table(audit_log(vec![]));
    fx.local().create_table(rooms());
    fx.remote().create_table(rooms());
    fx.engine.install_or_repair_triggers(None).await.unwrap();

    // More entries of a key-less table and an unconfigured one than fit in a batch.
    for entry in 1..=7 {
        let mut row = booking_replicator::instance::RowImage::new();
        row.insert("entry".into(), Value::Int(entry));
        row.insert("note".into(), text("night audit"));
        fx.local().insert_row("AuditLog", row).unwrap();
    }
    for room_id in 1..=6 {
        let mut room = booking_replicator::instance::RowImage::new();
        room.insert("room_id".into(), Value::Int(room_id));
        room.insert("label".into(), text("Dorm"));
        fx.local().insert_row("Rooms", room).unwrap();
    }
    for id in 60..=61 {
        fx.local().insert_row("Guests", guest(id, "Jameson")).unwrap();
    }

    // Rooms is captured but no longer configured.
    let mut cfg = config(vec![TableConfig::new("AuditLog"), TableConfig::new("Guests")]);
    cfg.sync.batch_size = 5;
    let narrowed = ApplyEngine::new(cfg, fx.connector.clone());
    let run = narrowed.run_sync("scheduled").await;
    assert_eq!(run.local_to_remote.applied, 2, "errors: {:?}", run.errors);
    assert_converged(&fx, "60");
    assert_converged(&fx, "61");
    // One report per blocked table; their entries wait untouched.
    assert_eq!(run.errors.len(), 2, "errors: {:?}", run.errors);
    assert_eq!(statuses(fx.local(), "AuditLog", "7"), vec![QueueStatus::Pending]);
    assert_eq!(statuses(fx.local(), "Rooms", "6"), vec![QueueStatus::Pending]);
}

#[tokio::test]
async fn test_unconfigured_table_is_reported() {
    let fx = bare_fixture(config(vec![TableConfig::new("Rooms"), TableConfig::new("Guests")]));
    fx.local().create_table(rooms());
    fx.remote().create_table(rooms());
    install(&fx).await;
    let mut room = booking_replicator::instance::RowImage::new();
    room.insert("room_id".into(), Value::Int(9));
    room.insert("label".into(), text("Loft"));
    fx.local().insert_row("Rooms", room).unwrap();

    let narrowed = ApplyEngine::new(config(vec![TableConfig::new("Guests")]), fx.connector.clone());
    let run = narrowed.run_sync("scheduled").await;
    assert!(run.errors.iter().any(|e| matches!(
        e,
        SyncError::Configuration { table, .. } if table == "Rooms"
    )));
    assert_eq!(statuses(fx.local(), "Rooms", "9"), vec![QueueStatus::Pending]);

    let mut disabled = TableConfig::new("Rooms");
    disabled.enabled = false;
    let quiet = ApplyEngine::new(config(vec![disabled, TableConfig::new("Guests")]), fx.connector.clone());
    let run = quiet.run_sync("scheduled").await;
    assert!(run.errors.is_empty());
    assert_eq!(run.local_to_remote.skipped, 1);
}

#[tokio::test]
async fn test_queue_maintenance() {
    let fx = fixture().await;
    fx.local().insert_row("Guests", guest(70, "Kane")).unwrap();
    fx.engine.run_sync("scheduled").await;

    let done = fx
        .engine
        .queue_entries(Side::Local, Some(QueueStatus::Done), 10)
        .await
        .unwrap();
    assert_eq!(done.len(), 1);

    assert_eq!(fx.engine.prune_done(Side::Local, 7).await.unwrap(), 0);
    fx.local().advance(Duration::from_secs(8 * 24 * 3600));
    assert_eq!(fx.engine.prune_done(Side::Local, 7).await.unwrap(), 1);
    assert!(fx.local().queue_entries().is_empty());
}
