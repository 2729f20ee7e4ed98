// ABOUTME: Integration tests against two live MySQL/MariaDB instances
// ABOUTME: Run with TEST_LOCAL_URL and TEST_REMOTE_URL set: cargo test -- --ignored

use booking_replicator::config::{ReplicatorConfig, TableConfig};
use booking_replicator::instance::mysql::MySqlConnector;
use booking_replicator::instance::ProbeOutcome;
use booking_replicator::replication::ApplyEngine;
use mysql_async::prelude::*;
use mysql_async::Conn;
use std::env;

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let local = env::var("TEST_LOCAL_URL").ok()?;
    let remote = env::var("TEST_REMOTE_URL").ok()?;
    Some((local, remote))
}

async fn connect(url: &str) -> Conn {
    Conn::from_url(url).await.expect("Failed to connect")
}

/// Local spells the table `IntegrationGuests` with an `ID` key; remote
/// uses `integrationguests` and `id`.
async fn setup(local: &mut Conn, remote: &mut Conn) {
    local
        .query_drop("DROP TABLE IF EXISTS `IntegrationGuests`")
        .await
        .expect("Failed to drop local table");
    local
        .query_drop(
            "CREATE TABLE `IntegrationGuests` ( \
                 `ID` INT PRIMARY KEY, \
                 `Name` VARCHAR(64) NOT NULL, \
                 `updated_at` TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP \
             )",
        )
        .await
        .expect("Failed to create local table");
    remote
        .query_drop("DROP TABLE IF EXISTS `integrationguests`")
        .await
        .expect("Failed to drop remote table");
    remote
        .query_drop(
            "CREATE TABLE `integrationguests` ( \
                 `id` INT PRIMARY KEY, \
                 `name` VARCHAR(64) NOT NULL, \
                 `web_session` VARCHAR(64) NULL, \
                 `updated_at` TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP \
             )",
        )
        .await
        .expect("Failed to create remote table");
}

async fn cleanup(local: &mut Conn, remote: &mut Conn) {
    let _ = local.query_drop("DROP TABLE IF EXISTS `IntegrationGuests`").await;
    let _ = remote.query_drop("DROP TABLE IF EXISTS `integrationguests`").await;
    for conn in [local, remote] {
        let _ = conn
            .query_drop("DELETE FROM `sync_queue` WHERE table_name = 'IntegrationGuests'")
            .await;
    }
}

fn engine(local_url: &str, remote_url: &str) -> ApplyEngine<MySqlConnector> {
    let mut config = ReplicatorConfig::new(vec![TableConfig::new("IntegrationGuests")]);
    config.local.url = local_url.to_string();
    config.remote.url = remote_url.to_string();
    config.validate().expect("TEST_LOCAL_URL and TEST_REMOTE_URL must differ");
    let connector = MySqlConnector::from_config(&config);
    ApplyEngine::new(config, connector)
}

/// Test: a local insert reaches the remote once, and a remote edit travels back
#[tokio::test]
#[ignore]
async fn test_bidirectional_replication() {
    let (local_url, remote_url) =
        get_test_urls().expect("TEST_LOCAL_URL and TEST_REMOTE_URL must be set");
    let mut local = connect(&local_url).await;
    let mut remote = connect(&remote_url).await;
    setup(&mut local, &mut remote).await;

    let engine = engine(&local_url, &remote_url);
    let installed = engine.install_or_repair_triggers(None).await.unwrap();
    assert!(installed.errors.is_empty(), "install errors: {:?}", installed.errors);

    local
        .query_drop("INSERT INTO `IntegrationGuests` (`ID`, `Name`) VALUES (500, 'Smith')")
        .await
        .unwrap();
    let run = engine.run_sync("integration").await;
    assert!(run.is_success(), "errors: {:?}", run.errors);
    assert_eq!(run.local_to_remote.applied, 1);

    let name: Option<String> = remote
        .query_first("SELECT `name` FROM `integrationguests` WHERE `id` = 500")
        .await
        .unwrap();
    assert_eq!(name.as_deref(), Some("Smith"));
    // Applying under the loop guard queued nothing on the remote.
    let echoed: Option<u64> = remote
        .query_first("SELECT COUNT(*) FROM `sync_queue` WHERE table_name = 'IntegrationGuests'")
        .await
        .unwrap();
    assert_eq!(echoed, Some(0));

    remote
        .query_drop("UPDATE `integrationguests` SET `name` = 'Smyth' WHERE `id` = 500")
        .await
        .unwrap();
    let run = engine.run_sync("integration").await;
    assert_eq!(run.remote_to_local.applied, 1);
    let name: Option<String> = local
        .query_first("SELECT `Name` FROM `IntegrationGuests` WHERE `ID` = 500")
        .await
        .unwrap();
    assert_eq!(name.as_deref(), Some("Smyth"));

    let pending: Option<u64> = local
        .query_first(
            "SELECT COUNT(*) FROM `sync_queue` WHERE table_name = 'IntegrationGuests' AND status <> 'done'",
        )
        .await
        .unwrap();
    assert_eq!(pending, Some(0));

    cleanup(&mut local, &mut remote).await;
}

/// Test: the probe sees capture on both instances and rolls its touch back
#[tokio::test]
#[ignore]
async fn test_probe_captures_without_side_effects() {
    let (local_url, remote_url) =
        get_test_urls().expect("TEST_LOCAL_URL and TEST_REMOTE_URL must be set");
    let mut local = connect(&local_url).await;
    let mut remote = connect(&remote_url).await;
    setup(&mut local, &mut remote).await;

    let engine = engine(&local_url, &remote_url);
    engine.install_or_repair_triggers(None).await.unwrap();
    local
        .query_drop("INSERT INTO `IntegrationGuests` (`ID`, `Name`) VALUES (1, 'Adams')")
        .await
        .unwrap();
    engine.run_sync("integration").await;

    let probe = engine.probe(None).await.unwrap();
    assert!(probe.errors.is_empty(), "gaps: {:?}", probe.errors);
    assert!(probe
        .reports
        .iter()
        .all(|r| r.outcome == Some(ProbeOutcome::Captured)));

    let queued: Option<u64> = local
        .query_first(
            "SELECT COUNT(*) FROM `sync_queue` WHERE table_name = 'IntegrationGuests' AND status = 'pending'",
        )
        .await
        .unwrap();
    assert_eq!(queued, Some(0));

    cleanup(&mut local, &mut remote).await;
}

/// Test: the window sync converges rows written while capture was off
#[tokio::test]
#[ignore]
async fn test_window_sync_repairs_uncaptured_writes() {
    let (local_url, remote_url) =
        get_test_urls().expect("TEST_LOCAL_URL and TEST_REMOTE_URL must be set");
    let mut local = connect(&local_url).await;
    let mut remote = connect(&remote_url).await;
    setup(&mut local, &mut remote).await;

    // No triggers installed.
    local
        .query_drop("INSERT INTO `IntegrationGuests` (`ID`, `Name`) VALUES (7, 'Baker')")
        .await
        .unwrap();
    remote
        .query_drop("INSERT INTO `integrationguests` (`id`, `name`) VALUES (8, 'Carter')")
        .await
        .unwrap();

    let engine = engine(&local_url, &remote_url);
    let run = engine.force_window_sync(None, 1).await;
    assert!(run.is_success(), "errors: {:?}", run.errors);
    assert_eq!(run.local_to_remote.applied, 1);
    assert_eq!(run.remote_to_local.applied, 1);

    let count: Option<u64> = local
        .query_first("SELECT COUNT(*) FROM `IntegrationGuests`")
        .await
        .unwrap();
    assert_eq!(count, Some(2));

    cleanup(&mut local, &mut remote).await;
}
