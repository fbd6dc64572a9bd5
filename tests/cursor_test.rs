//! Integration tests for server-side cursor streaming.

mod common;

use common::{config, registry, row, settle};
use futures_util::StreamExt;
use pgpool_lease::DbError;
use pgpool_lease::db::{CursorState, DbClient};
use pgpool_lease::models::SqlTemplate;
use serde_json::json;

fn rows(ids: &[i64]) -> Vec<pgpool_lease::models::Row> {
    ids.iter().map(|id| row(json!({ "id": id }))).collect()
}

#[tokio::test]
async fn test_cursor_reads_batches_then_commits() {
    let (registry, script) = registry();
    script.push_fetch(rows(&[1, 2]));
    script.push_fetch(rows(&[3]));
    let client = DbClient::connect(&registry, &config()).await.unwrap();

    let mut cursor = client
        .cursor_open(&SqlTemplate::new("SELECT id FROM items"), None)
        .await
        .unwrap();
    assert_eq!(cursor.state(), CursorState::Open);
    assert!(cursor.in_transaction());
    let name = cursor.name().to_string();

    assert_eq!(cursor.read(2).await.unwrap(), rows(&[1, 2]));
    assert_eq!(cursor.read(2).await.unwrap(), rows(&[3]));
    assert!(cursor.read(2).await.unwrap().is_empty());

    assert_eq!(cursor.state(), CursorState::Closed);
    assert!(!cursor.in_transaction());
    assert_eq!(
        script.statements_on(0),
        vec![
            "BEGIN".to_string(),
            "SET LOCAL statement_timeout = 0".to_string(),
            format!("DECLARE {name} NO SCROLL CURSOR FOR SELECT id FROM items"),
            format!("FETCH FORWARD 2 FROM {name}"),
            format!("FETCH FORWARD 2 FROM {name}"),
            format!("FETCH FORWARD 2 FROM {name}"),
            "COMMIT".to_string(),
        ]
    );
    assert_eq!(script.released(), vec![0]);
    assert_eq!(client.pool().active_leases(), 0);
}

#[tokio::test]
async fn test_read_after_close_is_cursor_error() {
    let (registry, script) = registry();
    let client = DbClient::connect(&registry, &config()).await.unwrap();

    let mut cursor = client
        .cursor_open(&SqlTemplate::new("SELECT 1"), None)
        .await
        .unwrap();
    assert!(cursor.read(10).await.unwrap().is_empty());

    let err = cursor.read(10).await.unwrap_err();
    assert!(matches!(err, DbError::Cursor { .. }));
    assert_eq!(script.count_statements("FETCH"), 1);
    assert_eq!(script.released(), vec![0]);
}

#[tokio::test]
async fn test_failed_fetch_rolls_back_and_releases() {
    let (registry, script) = registry();
    script.fail_on("FETCH");
    let client = DbClient::connect(&registry, &config()).await.unwrap();

    let mut cursor = client
        .cursor_open(&SqlTemplate::new("SELECT id FROM items"), None)
        .await
        .unwrap();
    let err = cursor.read(5).await.unwrap_err();

    assert!(matches!(err, DbError::Database { .. }));
    assert_eq!(cursor.state(), CursorState::Closed);
    assert_eq!(script.count_statements("ROLLBACK"), 1);
    assert_eq!(script.count_statements("COMMIT"), 0);
    assert_eq!(script.released(), vec![0]);
    assert_eq!(client.pool().active_leases(), 0);
}

#[tokio::test]
async fn test_failed_declare_rolls_back_and_releases() {
    let (registry, script) = registry();
    script.fail_on("DECLARE");
    let client = DbClient::connect(&registry, &config()).await.unwrap();

    let err = client
        .cursor_open(&SqlTemplate::new("SELECT * FROM missing"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Database { .. }));
    let statements = script.statements_on(0);
    assert_eq!(statements.len(), 4);
    assert_eq!(statements[0], "BEGIN");
    assert_eq!(statements[1], "SET LOCAL statement_timeout = 0");
    assert!(statements[2].starts_with("DECLARE "));
    assert_eq!(statements[3], "ROLLBACK");
    assert_eq!(script.released(), vec![0]);
    assert_eq!(client.pool().active_leases(), 0);
}

#[tokio::test]
async fn test_failed_begin_still_releases() {
    let (registry, script) = registry();
    script.fail_on("BEGIN");
    let client = DbClient::connect(&registry, &config()).await.unwrap();

    let result = client
        .cursor_open(&SqlTemplate::new("SELECT 1"), None)
        .await;

    assert!(result.is_err());
    assert_eq!(script.statements_on(0), vec!["BEGIN", "ROLLBACK"]);
    assert_eq!(client.pool().active_leases(), 0);
}

#[tokio::test]
async fn test_commit_failure_on_exhaustion_is_surfaced() {
    let (registry, script) = registry();
    script.fail_on("COMMIT");
    let client = DbClient::connect(&registry, &config()).await.unwrap();

    let mut cursor = client
        .cursor_open(&SqlTemplate::new("SELECT 1"), None)
        .await
        .unwrap();
    let err = cursor.read(10).await.unwrap_err();

    assert!(matches!(err, DbError::Database { .. }));
    assert_eq!(cursor.state(), CursorState::Closed);
    assert_eq!(script.count_statements("ROLLBACK"), 0);
    assert_eq!(script.released(), vec![0]);
}

#[tokio::test]
async fn test_end_connection_commits_early() {
    let (registry, script) = registry();
    script.push_fetch(rows(&[1, 2]));
    script.push_fetch(rows(&[3, 4]));
    let client = DbClient::connect(&registry, &config()).await.unwrap();

    let mut cursor = client
        .cursor_open(&SqlTemplate::new("SELECT id FROM items"), None)
        .await
        .unwrap();
    cursor.read(2).await.unwrap();
    cursor.end_connection().await.unwrap();
    cursor.end_connection().await.unwrap();

    assert_eq!(script.count_statements("COMMIT"), 1);
    assert_eq!(script.released(), vec![0]);
    assert!(matches!(
        cursor.read(2).await,
        Err(DbError::Cursor { .. })
    ));
}

#[tokio::test]
async fn test_zero_batch_is_rejected_without_closing() {
    let (registry, script) = registry();
    script.push_fetch(rows(&[1]));
    let client = DbClient::connect(&registry, &config()).await.unwrap();

    let mut cursor = client
        .cursor_open(&SqlTemplate::new("SELECT id FROM items"), None)
        .await
        .unwrap();
    assert!(matches!(
        cursor.read(0).await,
        Err(DbError::InvalidInput { .. })
    ));
    assert_eq!(cursor.state(), CursorState::Open);
    assert_eq!(cursor.read(1).await.unwrap(), rows(&[1]));
    cursor.end_connection().await.unwrap();
}

#[tokio::test]
async fn test_dropped_cursor_rolls_back() {
    let (registry, script) = registry();
    script.push_fetch(rows(&[1]));
    let client = DbClient::connect(&registry, &config()).await.unwrap();

    {
        let mut cursor = client
            .cursor_open(&SqlTemplate::new("SELECT id FROM items"), None)
            .await
            .unwrap();
        cursor.read(1).await.unwrap();
    }
    settle().await;

    assert_eq!(script.count_statements("ROLLBACK"), 1);
    assert_eq!(script.count_statements("COMMIT"), 0);
    assert_eq!(client.pool().active_leases(), 0);
}

#[tokio::test]
async fn test_stream_yields_batches_until_exhausted() {
    let (registry, script) = registry();
    script.push_fetch(rows(&[1, 2]));
    script.push_fetch(rows(&[3, 4]));
    script.push_fetch(rows(&[5]));
    let client = DbClient::connect(&registry, &config()).await.unwrap();

    let cursor = client
        .cursor_open(&SqlTemplate::new("SELECT id FROM items"), None)
        .await
        .unwrap();
    let batches: Vec<_> = cursor.into_stream(2).collect().await;

    let ids: Vec<i64> = batches
        .into_iter()
        .flat_map(|batch| batch.unwrap())
        .map(|row| row["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(script.count_statements("COMMIT"), 1);
    assert_eq!(client.pool().active_leases(), 0);
}
