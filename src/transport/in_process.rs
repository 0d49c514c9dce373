//! Embedded DuckDB transport.
//!
//! The engine lives in this process. Every query runs on its own raw
//! connection on the blocking thread pool and streams Arrow batches back
//! over a channel. Cancelling a query interrupts the engine, which frees
//! the worker thread as soon as the statement notices.

use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use duckdb::Connection;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::engine::{Database, RawConnection, StreamEvent};
use super::{StagedFile, Transport, TransportKind};
use crate::config::InProcessConfig;
use crate::db::Table;
use crate::error::{parse_engine_error, ConnectorError, Result};
use crate::load::{self, quote_identifier, FileSource, LoadOptions};
use crate::query::QueryId;

/// Batches buffered between the engine thread and the collecting task.
const BATCH_CHANNEL_CAPACITY: usize = 8;

/// Rows per appender call, the engine's vector size.
const APPEND_CHUNK_ROWS: usize = 2048;

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Runs `action` when dropped unless disarmed.
struct OnDrop<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> OnDrop<F> {
    fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }

    fn disarm(&mut self) {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

/// In-process DuckDB engine.
pub struct InProcessTransport {
    config: InProcessConfig,
    database: Mutex<Option<Arc<Database>>>,
    running: Arc<AtomicUsize>,
}

impl InProcessTransport {
    pub fn new(config: InProcessConfig) -> Self {
        Self {
            config,
            database: Mutex::new(None),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// An in-memory engine with default settings.
    pub fn in_memory() -> Self {
        Self::new(InProcessConfig::default())
    }

    pub fn config(&self) -> &InProcessConfig {
        &self.config
    }

    /// Returns true while the engine is open.
    pub fn is_open(&self) -> bool {
        self.database_slot().is_some()
    }

    /// Statements currently executing on engine worker threads.
    ///
    /// Drops back once an interrupted statement has actually stopped, which
    /// can be after its query already settled as aborted.
    pub fn running_queries(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn database_slot(&self) -> MutexGuard<'_, Option<Arc<Database>>> {
        self.database.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn database(&self) -> Result<Arc<Database>> {
        self.database_slot()
            .clone()
            .ok_or_else(|| ConnectorError::internal("DuckDB not initialized"))
    }

    /// Opens a fresh connection to the shared engine instance.
    fn connect(&self) -> Result<RawConnection> {
        self.database()?
            .connect()
            .map_err(|e| ConnectorError::internal(format!("Failed to open sub-connection: {e}")))
    }

    fn open(config: &InProcessConfig) -> std::result::Result<Arc<Database>, String> {
        let path = if config.is_in_memory() {
            ":memory:"
        } else {
            config.db_path.as_str()
        };
        Database::open(path, config.threads)
    }
}

impl std::fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessTransport")
            .field("db_path", &self.config.db_path)
            .field("open", &self.is_open())
            .field("running", &self.running_queries())
            .finish()
    }
}

/// Executes `sql` on `conn`, sending the last statement's schema and then
/// each batch.
///
/// Runs on a blocking thread. Stops early once the receiver is gone.
fn stream_query(
    conn: &RawConnection,
    sql: &str,
    structured_errors: bool,
    cancel: &CancellationToken,
    tx: mpsc::Sender<StreamEvent>,
) -> std::result::Result<(), String> {
    if structured_errors {
        // Older engines lack the setting; plain-text errors still parse.
        let _ = conn.run("SET errors_as_json = true", |_| true);
    }
    if cancel.is_cancelled() {
        return Ok(());
    }
    conn.run(sql, |event| tx.blocking_send(event).is_ok())
}

fn run_batch(conn: &Connection, sql: &str) -> Result<()> {
    conn.execute_batch(sql)
        .map_err(|e| parse_engine_error(sql, &e.to_string()))
}

/// Appends every batch of `data` to `staging`.
fn append_table(conn: &Connection, staging: &str, data: &Table) -> Result<()> {
    let append_error =
        |e: duckdb::Error| ConnectorError::query(format!("Failed to append Arrow data: {e}"));

    let mut appender = conn.appender(staging).map_err(append_error)?;
    for batch in data.batches() {
        let batch = decode_dictionaries(batch)?;
        let mut offset = 0;
        while offset < batch.num_rows() {
            let len = APPEND_CHUNK_ROWS.min(batch.num_rows() - offset);
            appender
                .append_record_batch(batch.slice(offset, len))
                .map_err(append_error)?;
            offset += len;
        }
    }
    appender.flush().map_err(append_error)
}

/// Replaces dictionary columns with their decoded values.
fn decode_dictionaries(batch: &RecordBatch) -> Result<RecordBatch> {
    let schema = batch.schema();
    let has_dictionary = schema
        .fields()
        .iter()
        .any(|field| matches!(field.data_type(), DataType::Dictionary(..)));
    if !has_dictionary {
        return Ok(batch.clone());
    }

    let mut fields = Vec::with_capacity(schema.fields().len());
    let mut columns = Vec::with_capacity(batch.num_columns());
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        match field.data_type() {
            DataType::Dictionary(_, value) => {
                columns.push(cast(column, value)?);
                fields.push(Field::new(
                    field.name(),
                    value.as_ref().clone(),
                    field.is_nullable(),
                ));
            }
            _ => {
                columns.push(Arc::clone(column));
                fields.push(field.as_ref().clone());
            }
        }
    }
    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

#[async_trait]
impl Transport for InProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InProcess
    }

    async fn bootstrap(&self) -> Result<()> {
        let config = self.config.clone();
        let database = tokio::task::spawn_blocking(move || Self::open(&config))
            .await
            .map_err(|e| ConnectorError::internal(format!("DuckDB open task failed: {e}")))?
            .map_err(|e| ConnectorError::initialization(format!("Failed to open DuckDB: {e}")))?;

        *self.database_slot() = Some(database);
        info!(db_path = %self.config.db_path, "Opened DuckDB");
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        let database = self.database_slot().take();
        if let Some(database) = database {
            // Closing may checkpoint a file database. Statements still
            // unwinding hold their own handle and close it last.
            tokio::task::spawn_blocking(move || drop(database))
                .await
                .map_err(|e| ConnectorError::internal(format!("Failed to close DuckDB: {e}")))?;
            info!(db_path = %self.config.db_path, "Closed DuckDB");
        }
        Ok(())
    }

    async fn run_query(
        &self,
        sql: &str,
        id: &QueryId,
        cancel: &CancellationToken,
    ) -> Result<Table> {
        if cancel.is_cancelled() {
            return Err(ConnectorError::aborted());
        }

        let conn = Arc::new(self.connect()?);
        let interrupt = Arc::clone(&conn);
        let mut interrupt_guard = OnDrop::new(move || interrupt.interrupt());

        let (tx, mut rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let owned_sql = sql.to_string();
        let structured_errors = self.config.structured_errors;
        let worker_cancel = cancel.clone();
        let running = Arc::clone(&self.running);
        let worker = tokio::task::spawn_blocking(move || {
            running.fetch_add(1, Ordering::SeqCst);
            let _running = OnDrop::new(|| {
                running.fetch_sub(1, Ordering::SeqCst);
            });
            stream_query(&conn, &owned_sql, structured_errors, &worker_cancel, tx)
        });

        let collect = async {
            let mut schema = None;
            let mut batches = Vec::new();
            let mut num_rows = 0usize;
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Schema(s) => schema = Some(s),
                    StreamEvent::Batch(batch) if batch.num_rows() == 0 => {}
                    StreamEvent::Batch(batch) => {
                        num_rows += batch.num_rows();
                        batches.push(batch);
                    }
                }
            }

            worker
                .await
                .map_err(|e| ConnectorError::internal(format!("Query worker failed: {e}")))?
                .map_err(|raw| parse_engine_error(sql, &raw))?;

            debug!(query_id = %id, rows = num_rows, batches = batches.len(), "Query finished");
            Ok(match schema {
                Some(schema) if num_rows == 0 => Table::empty_with_schema(schema),
                Some(schema) => Table::from_batches(schema, batches),
                None => Table::empty(),
            })
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectorError::aborted()),
            result = collect => result,
        };

        if !matches!(result, Err(ConnectorError::Aborted(_))) {
            interrupt_guard.disarm();
        }
        result
    }

    async fn stage_file(&self, source: &FileSource) -> Result<StagedFile> {
        let FileSource::Bytes { name, data } = source else {
            return Ok(StagedFile::existing(source.name()));
        };

        let suffix = source
            .extension()
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let data = data.clone();
        let temp = tokio::task::spawn_blocking(move || {
            let mut file = tempfile::Builder::new()
                .prefix("duckconn-")
                .suffix(&suffix)
                .tempfile()?;
            file.write_all(&data)?;
            file.flush()?;
            Ok::<_, std::io::Error>(file.into_temp_path())
        })
        .await
        .map_err(|e| ConnectorError::internal(format!("File staging task failed: {e}")))?
        .map_err(|e| ConnectorError::internal(format!("Failed to stage {name}: {e}")))?;

        debug!(file = %name, path = %temp.display(), "Staged in-memory file");
        Ok(StagedFile::temporary(temp))
    }

    /// Appends the batches to a temporary staging table typed from the
    /// Arrow schema, then creates `table` from it with `options` applied.
    async fn load_arrow(&self, table: &str, data: Table, options: &LoadOptions) -> Result<()> {
        if options.view {
            return Err(ConnectorError::unsupported(
                "Arrow data can only be loaded into a table",
            ));
        }
        let columns = load::column_definitions(data.schema())?;
        let database = self.database()?;

        let staging = format!("duckconn_arrow_{}", STAGING_SEQ.fetch_add(1, Ordering::Relaxed));
        let create_staging = format!("CREATE TEMP TABLE {} ({columns})", quote_identifier(&staging));
        let create_target = load::load_relation(table, &quote_identifier(&staging), options);
        let rows = data.num_rows();

        tokio::task::spawn_blocking(move || {
            let conn = database
                .connection()
                .map_err(|e| ConnectorError::internal(format!("Failed to open connection: {e}")))?;
            // The staging table is temporary and goes away with `conn`.
            run_batch(&conn, &create_staging)?;
            append_table(&conn, &staging, &data)?;
            run_batch(&conn, &create_target)
        })
        .await
        .map_err(|e| ConnectorError::internal(format!("Arrow load task failed: {e}")))??;

        debug!(table, rows, "Loaded Arrow data");
        Ok(())
    }
}
