//! Loading data into the embedded engine.

use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use duckconn::load::{FileSource, LoadFileOptions, LoadMethod, LoadOptions};
use duckconn::transport::InProcessTransport;
use duckconn::{Connector, QueryOptions, Table};
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value as JsonValue};

fn connector() -> Connector<InProcessTransport> {
    Connector::new(InProcessTransport::in_memory())
}

async fn count(connector: &Connector<InProcessTransport>, table: &str) -> i64 {
    let result = connector
        .query(format!("SELECT COUNT(*) AS n FROM {table}"), QueryOptions::default())
        .await
        .unwrap();
    result.column("n").unwrap().get_i64(0).unwrap()
}

fn object(value: JsonValue) -> Map<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

#[tokio::test]
async fn test_load_objects_round_trip_count() {
    let connector = connector();
    let rows: Vec<_> = (0..25)
        .map(|i| object(json!({"id": i, "label": format!("row {i}"), "even": i % 2 == 0})))
        .collect();

    connector
        .load_objects(&rows, "items", &LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(count(&connector, "items").await, 25);
}

#[tokio::test]
async fn test_load_objects_missing_keys_and_quotes() {
    let connector = connector();
    let rows = vec![
        object(json!({"id": 1, "name": "O'Brien", "tags": ["a", "b"]})),
        object(json!({"id": 2})),
    ];
    connector
        .load_objects(&rows, "people", &LoadOptions::new().replace())
        .await
        .unwrap();

    let rows = connector
        .query_json("SELECT id, name FROM people ORDER BY id", QueryOptions::default())
        .await
        .unwrap();
    let json: Vec<_> = rows.iter().map(|row| row.to_json()).collect();
    assert_eq!(
        json,
        vec![
            json!({"id": 1, "name": "O'Brien"}),
            json!({"id": 2, "name": null})
        ]
    );
}

#[tokio::test]
async fn test_load_objects_with_select_and_schema() {
    let connector = connector();
    connector
        .execute("CREATE SCHEMA staging", QueryOptions::default())
        .await
        .unwrap();

    let rows = vec![object(json!({"a": 1, "b": 2})), object(json!({"a": 3, "b": 4}))];
    let options = LoadOptions::new().with_schema("staging").with_select(["a"]);
    connector.load_objects(&rows, "only_a", &options).await.unwrap();

    let table = connector
        .query("SELECT * FROM staging.only_a ORDER BY a", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(table.column_names(), vec!["a"]);
    assert_eq!(table.num_rows(), 2);
}

#[tokio::test]
async fn test_load_csv_file_from_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cities.csv");
    std::fs::write(&path, "name,population\nOslo,700000\nBergen,285000\nTromso,77000\n").unwrap();

    let connector = connector();
    connector
        .load_file(path.as_path(), "cities", &LoadFileOptions::new(LoadMethod::ReadCsv))
        .await
        .unwrap();
    assert_eq!(count(&connector, "cities").await, 3);

    // Auto detection by extension, with a filter.
    let options = LoadFileOptions::new(LoadMethod::Auto)
        .with_options(LoadOptions::new().with_filter("population > 100000"));
    connector
        .load_file(path.as_path(), "big_cities", &options)
        .await
        .unwrap();
    assert_eq!(count(&connector, "big_cities").await, 2);
}

#[tokio::test]
async fn test_load_in_memory_file() {
    let connector = connector();
    let source = FileSource::bytes("scores.csv", "player,score\nada,10\nbob,7\n");
    connector
        .load_file(source, "scores", &LoadFileOptions::new(LoadMethod::ReadCsv))
        .await
        .unwrap();

    let table = connector
        .query("SELECT max(score) AS best FROM scores", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(table.column("best").unwrap().get_i64(0), Some(10));
}

#[tokio::test]
async fn test_load_missing_file_fails() {
    let connector = connector();
    let err = connector
        .load_file(
            "/definitely/not/here.csv",
            "nothing",
            &LoadFileOptions::new(LoadMethod::ReadCsv),
        )
        .await
        .unwrap_err();
    assert_eq!(err.category(), "Query Error");
}

#[tokio::test]
async fn test_load_arrow_table_and_ipc() {
    let connector = connector();
    let source = connector
        .query(
            "SELECT range AS n, 'v' || range AS label FROM range(4)",
            QueryOptions::default(),
        )
        .await
        .unwrap();

    connector
        .load_arrow(source.clone(), "copied", &LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(count(&connector, "copied").await, 4);

    let ipc = source.to_ipc_stream().unwrap();
    connector
        .load_arrow(ipc, "from_ipc", &LoadOptions::new().replace())
        .await
        .unwrap();
    assert_eq!(count(&connector, "from_ipc").await, 4);
}

fn event_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new(
            "ts",
            DataType::Timestamp(TimeUnit::Microsecond, None),
            true,
        ),
        Field::new("kind", DataType::Utf8, true),
    ]))
}

fn events() -> Table {
    let schema = event_schema();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(vec![1, 2, 3])),
        // 2024-01-01 00:00:00 UTC plus 0, 1 and 2 seconds.
        Arc::new(TimestampMicrosecondArray::from(vec![
            Some(1_704_067_200_000_000),
            Some(1_704_067_201_000_000),
            None,
        ])),
        Arc::new(StringArray::from(vec![Some("open"), Some("close"), None])),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns).unwrap();
    Table::from_batches(schema, vec![batch])
}

#[tokio::test]
async fn test_load_arrow_keeps_column_types() {
    let connector = connector();
    connector
        .load_arrow(events(), "events", &LoadOptions::default())
        .await
        .unwrap();

    let types = connector
        .query(
            "SELECT typeof(id) AS id, typeof(ts) AS ts, typeof(kind) AS kind FROM events LIMIT 1",
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(types.column("id").unwrap().get_string(0).as_deref(), Some("BIGINT"));
    assert_eq!(types.column("ts").unwrap().get_string(0).as_deref(), Some("TIMESTAMP"));
    assert_eq!(types.column("kind").unwrap().get_string(0).as_deref(), Some("VARCHAR"));

    let first = connector
        .query(
            "SELECT CAST(ts AS VARCHAR) AS ts FROM events WHERE id = 1",
            QueryOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        first.column("ts").unwrap().get_string(0).as_deref(),
        Some("2024-01-01 00:00:00")
    );
    assert_eq!(count(&connector, "events WHERE ts IS NULL").await, 1);
}

#[tokio::test]
async fn test_load_arrow_zero_rows_creates_columns() {
    let connector = connector();
    let empty = Table::empty_with_schema(event_schema());
    connector
        .load_arrow(empty, "no_events", &LoadOptions::default())
        .await
        .unwrap();

    assert_eq!(count(&connector, "no_events").await, 0);
    let columns = connector
        .query(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = 'no_events' ORDER BY ordinal_position",
            QueryOptions::default(),
        )
        .await
        .unwrap();
    let names: Vec<_> = (0..columns.num_rows())
        .filter_map(|row| columns.column("column_name").unwrap().get_string(row))
        .collect();
    let types: Vec<_> = (0..columns.num_rows())
        .filter_map(|row| columns.column("data_type").unwrap().get_string(row))
        .collect();
    assert_eq!(names, vec!["id", "ts", "kind"]);
    assert_eq!(types, vec!["BIGINT", "TIMESTAMP", "VARCHAR"]);
}

#[tokio::test]
async fn test_load_arrow_with_select_and_filter() {
    let connector = connector();
    let options = LoadOptions::new()
        .with_select(["id", "ts"])
        .with_filter("kind IS NOT NULL");
    connector
        .load_arrow(events(), "named_events", &options)
        .await
        .unwrap();

    let loaded = connector
        .query("SELECT * FROM named_events ORDER BY id", QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(loaded.column_names(), vec!["id", "ts"]);
    assert_eq!(loaded.num_rows(), 2);

}
