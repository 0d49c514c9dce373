//! Embedded engine integration tests.
//!
//! Drives the connector end to end over a bundled in-memory DuckDB.

use std::time::Duration;

use duckconn::config::InProcessConfig;
use duckconn::transport::InProcessTransport;
use duckconn::{Connector, ConnectorState, QueryOptions};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// A statement that keeps the engine busy for a while.
const SLOW_SQL: &str = "SELECT sum(a.range * b.range) FROM range(60000) a, range(60000) b";

/// A statement that only finishes if interrupted.
const ENDLESS_SQL: &str =
    "SELECT sum(a.range * b.range) FROM range(1000000) a, range(1000000) b";

fn connector() -> Connector<InProcessTransport> {
    Connector::new(InProcessTransport::in_memory())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

#[tokio::test]
async fn test_select_one() {
    let connector = connector();
    let table = connector
        .query("SELECT 1 as a", QueryOptions::default())
        .await
        .unwrap();

    assert_eq!(table.num_rows(), 1);
    assert_eq!(table.num_columns(), 1);
    assert_eq!(table.column("a").unwrap().get_i64(0), Some(1));
}

#[tokio::test]
async fn test_missing_table_renders_pointer() {
    let connector = connector();
    let err = connector
        .query("SELECT * FROM t", QueryOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.category(), "Query Error");
    assert!(!err.is_abort());
    let message = err.to_string();
    assert!(message.contains("LINE 1"), "unexpected message: {message}");
    assert!(message.contains('^'), "unexpected message: {message}");
    assert_eq!(
        err.structured().map(|s| s.error_type.as_str()),
        Some("Catalog")
    );
}

#[tokio::test]
async fn test_error_pointer_on_later_line() {
    let connector = connector();
    let err = connector
        .query("SELECT 1\nUNION ALL\nSELECT * FROM missing", QueryOptions::default())
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("LINE 3"), "unexpected message: {message}");
}

#[tokio::test]
async fn test_pre_aborted_signal_does_not_initialize() {
    let connector = connector();
    let signal = CancellationToken::new();
    signal.cancel();

    let err = connector
        .query("SELECT 1", QueryOptions::new().with_signal(signal))
        .await
        .unwrap_err();

    assert!(err.is_abort());
    assert_eq!(connector.state(), ConnectorState::Uninitialized);
    assert!(!connector.transport().is_open());
}

#[tokio::test]
async fn test_immediate_cancel_never_yields_partial_result() {
    let connector = connector();
    connector.initialize().await.unwrap();

    for _ in 0..10 {
        let handle = connector.query("SELECT * FROM range(10000)", QueryOptions::default());
        handle.cancel();
        assert!(handle.await.unwrap_err().is_abort());
    }
    assert_eq!(connector.active_query_count(), 0);
}

#[tokio::test]
async fn test_cancel_running_query() {
    let connector = connector();
    connector.initialize().await.unwrap();

    let handle = connector.query(SLOW_SQL, QueryOptions::default());
    let id = handle.id().clone();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(connector.is_query_active(&id));

    assert!(connector.cancel(&id));
    let err = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("cancelled query settles")
        .unwrap_err();
    assert!(err.is_abort());
    assert!(!connector.is_query_active(&id));

    // The engine is still usable afterwards.
    let table = connector
        .query("SELECT 2 AS b", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(table.column("b").unwrap().get_i64(0), Some(2));
}

#[tokio::test]
async fn test_cancel_releases_engine_worker() {
    let connector = Connector::new(InProcessTransport::new(InProcessConfig {
        threads: Some(2),
        ..InProcessConfig::default()
    }));
    connector.initialize().await.unwrap();

    let handle = connector.query(ENDLESS_SQL, QueryOptions::default());
    wait_until(|| connector.transport().running_queries() == 1).await;

    handle.cancel();
    assert!(handle.await.unwrap_err().is_abort());

    // The engine stops too, not only the awaiting task.
    wait_until(|| connector.transport().running_queries() == 0).await;
}

#[tokio::test]
async fn test_slow_query_worker_stops_after_cancel() {
    let connector = connector();
    let handle = connector.query(SLOW_SQL, QueryOptions::default());
    wait_until(|| connector.transport().running_queries() == 1).await;

    handle.cancel();
    assert!(handle.await.unwrap_err().is_abort());
    wait_until(|| connector.transport().running_queries() == 0).await;
}

#[tokio::test]
async fn test_signal_composes_into_timeout() {
    let connector = connector();
    let signal = CancellationToken::new();
    let deadline = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        deadline.cancel();
    });

    let err = connector
        .query(SLOW_SQL, QueryOptions::new().with_signal(signal))
        .await
        .unwrap_err();
    assert!(err.is_abort());
}

#[tokio::test]
async fn test_concurrent_queries_are_isolated() {
    let connector = connector();
    let handles: Vec<_> = (0..8)
        .map(|i| connector.query(format!("SELECT {i} AS v"), QueryOptions::default()))
        .collect();
    assert_eq!(connector.active_query_count(), 8);

    let results = futures::future::join_all(handles).await;
    for (i, result) in results.into_iter().enumerate() {
        let table = result.unwrap();
        assert_eq!(table.column("v").unwrap().get_i64(0), Some(i as i64));
    }
    assert_eq!(connector.active_query_count(), 0);
}

#[tokio::test]
async fn test_failed_query_does_not_affect_others() {
    let connector = connector();
    let failing = connector.query("SELECT * FROM nowhere", QueryOptions::default());
    let working = connector.query("SELECT 5 AS n", QueryOptions::default());

    assert!(failing.await.is_err());
    let table = working.await.unwrap();
    assert_eq!(table.column("n").unwrap().get_i64(0), Some(5));
}

#[tokio::test]
async fn test_zero_row_result_keeps_schema() {
    let connector = connector();
    let table = connector
        .query(
            "SELECT 1 AS id, 'x' AS name WHERE 1 = 0",
            QueryOptions::default(),
        )
        .await
        .unwrap();

    assert!(table.is_empty());
    assert_eq!(table.column_names(), vec!["id", "name"]);
}

#[tokio::test]
async fn test_multi_batch_result() {
    let connector = connector();
    let table = connector
        .query("SELECT * FROM range(10000) t(n)", QueryOptions::default())
        .await
        .unwrap();

    assert_eq!(table.num_rows(), 10000);
    assert!(table.num_batches() >= 1);
    assert_eq!(table.column("n").unwrap().get_i64(9999), Some(9999));
}

#[tokio::test]
async fn test_query_json_rows() {
    let connector = connector();
    let rows = connector
        .query_json(
            "SELECT * FROM (VALUES (1, 'a'), (2, NULL)) t(id, name) ORDER BY id",
            QueryOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert!(!rows.is_materialized());
    let json: Vec<_> = rows.iter().map(|row| row.to_json()).collect();
    assert_eq!(
        json,
        vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": null})]
    );
    assert!(rows.is_materialized());
}

#[tokio::test]
async fn test_destroy_twice_then_reinitialize() {
    let connector = connector();
    connector.destroy().await.unwrap();

    connector
        .execute("CREATE TABLE t AS SELECT 1 AS a", QueryOptions::default())
        .await
        .unwrap();
    connector.destroy().await.unwrap();
    connector.destroy().await.unwrap();
    assert_eq!(connector.state(), ConnectorState::Uninitialized);

    // A fresh in-memory database after re-initialization.
    connector.initialize().await.unwrap();
    let err = connector
        .query("SELECT * FROM t", QueryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.category(), "Query Error");
}

#[tokio::test]
async fn test_file_database_survives_destroy() {
    let dir = tempfile::tempdir().unwrap();
    let config = InProcessConfig {
        db_path: dir.path().join("data.duckdb").to_string_lossy().into_owned(),
        threads: Some(2),
        ..InProcessConfig::default()
    };
    let connector = Connector::new(InProcessTransport::new(config));

    connector
        .execute("CREATE TABLE kept AS SELECT 42 AS v", QueryOptions::default())
        .await
        .unwrap();
    connector.destroy().await.unwrap();

    let table = connector
        .query("SELECT v FROM kept", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(table.column("v").unwrap().get_i64(0), Some(42));
    connector.destroy().await.unwrap();
}

#[tokio::test]
async fn test_initialization_query_runs_before_queries() {
    let connector = Connector::with_initialization_query(
        InProcessTransport::in_memory(),
        "CREATE TABLE seeded AS SELECT 7 AS v",
    );

    let table = connector
        .query("SELECT v FROM seeded", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(table.column("v").unwrap().get_i64(0), Some(7));
}

#[tokio::test]
async fn test_initialization_query_with_several_statements() {
    let connector = Connector::with_initialization_query(
        InProcessTransport::in_memory(),
        "SET threads = 2; SET memory_limit = '1GB'",
    );
    connector.initialize().await.unwrap();

    let table = connector
        .query(
            "SELECT current_setting('threads') AS threads",
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(table.column("threads").unwrap().get_i64(0), Some(2));
}

#[tokio::test]
async fn test_execute_statement_batch() {
    let connector = connector();
    connector
        .execute(
            "CREATE TABLE t (a INT); INSERT INTO t VALUES (1)",
            QueryOptions::default(),
        )
        .await
        .unwrap();

    let table = connector
        .query("SELECT a FROM t", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(table.num_rows(), 1);
    assert_eq!(table.column("a").unwrap().get_i64(0), Some(1));
}

#[tokio::test]
async fn test_statement_batch_error_points_into_batch() {
    let connector = connector();
    let err = connector
        .execute(
            "CREATE TABLE ok_table (a INT);\nSELECT * FROM nowhere",
            QueryOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.category(), "Query Error");
    assert!(err.to_string().contains("nowhere"), "unexpected: {err}");
}

#[tokio::test]
async fn test_broken_initialization_query_fails_initialize() {
    let connector = Connector::with_initialization_query(
        InProcessTransport::in_memory(),
        "SELECT * FROM not_there",
    );

    let err = connector.initialize().await.unwrap_err();
    assert_eq!(err.category(), "Initialization Error");
    assert_eq!(connector.state(), ConnectorState::Uninitialized);
    assert!(!connector.transport().is_open());
}
