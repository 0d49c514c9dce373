//! Mock transports for testing.
//!
//! Provide in-memory implementations for headless testing of the connector
//! core: bootstrap counting, controllable latency and scripted failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::StringArray;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportKind};
use crate::db::Table;
use crate::error::{ConnectorError, Result};
use crate::query::QueryId;

/// A mock transport that returns predefined results.
///
/// `SELECT` statements without a registered result yield one `result` column
/// echoing the statement; everything else yields an empty table.
#[derive(Debug, Default)]
pub struct MockTransport {
    bootstraps: AtomicUsize,
    teardowns: AtomicUsize,
    started: AtomicUsize,
    failing_bootstraps: AtomicUsize,
    open: AtomicBool,
    bootstrap_delay: Option<Duration>,
    query_delay: Option<Duration>,
    results: Mutex<HashMap<String, Table>>,
    executed: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every bootstrap take `delay`.
    pub fn with_bootstrap_delay(mut self, delay: Duration) -> Self {
        self.bootstrap_delay = Some(delay);
        self
    }

    /// Makes every query take `delay` unless cancelled first.
    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = Some(delay);
        self
    }

    /// Fails the next `count` bootstraps.
    pub fn with_failing_bootstraps(self, count: usize) -> Self {
        self.failing_bootstraps.store(count, Ordering::SeqCst);
        self
    }

    /// Returns `table` for the exact statement `sql`.
    pub fn with_result(self, sql: impl Into<String>, table: Table) -> Self {
        self.lock_results().insert(sql.into(), table);
        self
    }

    pub fn bootstrap_count(&self) -> usize {
        self.bootstraps.load(Ordering::SeqCst)
    }

    pub fn teardown_count(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    /// True between a successful bootstrap and the next teardown.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Number of statements that reached the transport, finished or not.
    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Statements that completed, in completion order.
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_results(&self) -> std::sync::MutexGuard<'_, HashMap<String, Table>> {
        self.results.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn result_for(&self, sql: &str) -> Result<Table> {
        if let Some(table) = self.lock_results().get(sql) {
            return Ok(table.clone());
        }

        if sql.trim_start().to_uppercase().starts_with("SELECT") {
            let schema = Arc::new(Schema::new(vec![Field::new(
                "result",
                DataType::Utf8,
                false,
            )]));
            let column = StringArray::from(vec![format!("Mock result for: {}", sql)]);
            let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(column)])?;
            Ok(Table::from_batches(schema, vec![batch]))
        } else {
            Ok(Table::empty())
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InProcess
    }

    async fn bootstrap(&self) -> Result<()> {
        self.bootstraps.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.bootstrap_delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_bootstraps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ConnectorError::initialization("Mock bootstrap failure"));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn run_query(
        &self,
        sql: &str,
        _id: &QueryId,
        cancel: &CancellationToken,
    ) -> Result<Table> {
        self.started.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.query_delay {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectorError::aborted()),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let table = self.result_for(sql)?;
        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sql.to_string());
        Ok(table)
    }
}

/// A transport whose operations always fail.
#[derive(Debug, Clone)]
pub struct FailingTransport {
    error: ConnectorError,
    fail_bootstrap: bool,
}

impl FailingTransport {
    /// Fails every query with `error`; bootstrap succeeds.
    pub fn queries(error: ConnectorError) -> Self {
        Self {
            error,
            fail_bootstrap: false,
        }
    }

    /// Fails bootstrap and teardown with `error`.
    pub fn bootstrap(error: ConnectorError) -> Self {
        Self {
            error,
            fail_bootstrap: true,
        }
    }
}

#[async_trait]
impl Transport for FailingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InProcess
    }

    async fn bootstrap(&self) -> Result<()> {
        if self.fail_bootstrap {
            Err(self.error.clone())
        } else {
            Ok(())
        }
    }

    async fn teardown(&self) -> Result<()> {
        if self.fail_bootstrap {
            Err(self.error.clone())
        } else {
            Ok(())
        }
    }

    async fn run_query(
        &self,
        _sql: &str,
        _id: &QueryId,
        _cancel: &CancellationToken,
    ) -> Result<Table> {
        Err(self.error.clone())
    }
}
