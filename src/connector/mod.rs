//! Connector core shared by every transport.
//!
//! The connector owns the lifecycle of one engine connection: a single
//! shared bootstrap, per-query cancellation tokens tracked in the
//! active-query registry, and teardown that can always be followed by a
//! fresh `initialize`.

mod lifecycle;

pub use lifecycle::ConnectorState;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use serde_json::{Map, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::lifecycle::Lifecycle;
use crate::config::Config;
use crate::db::{Rows, Table};
use crate::error::{ConnectorError, Result};
use crate::load::{self, ArrowSource, FileSource, LoadFileOptions, LoadOptions};
use crate::query::{ActiveQueryRegistry, QueryHandle, QueryId, QueryOptions};
use crate::transport::{InProcessTransport, RemoteTransport, Transport, TransportKind};

struct Inner<T: ?Sized> {
    registry: ActiveQueryRegistry,
    initialization_query: Option<String>,
    lifecycle: Mutex<Lifecycle>,
    generation: AtomicU64,
    transport: Arc<T>,
}

impl<T: Transport + ?Sized> Inner<T> {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn initialize(self: &Arc<Self>) -> Result<()> {
        let pending = {
            let mut lifecycle = self.lifecycle();
            match &*lifecycle {
                Lifecycle::Ready => return Ok(()),
                Lifecycle::Initializing { pending, .. } => pending.clone(),
                Lifecycle::Uninitialized => {
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    // Weak, so an abandoned bootstrap cannot keep the connector alive.
                    let weak = Arc::downgrade(self);
                    let pending = async move {
                        match weak.upgrade() {
                            Some(inner) => inner.bootstrap(generation).await,
                            None => Err(ConnectorError::internal("Connector was dropped")),
                        }
                    }
                    .boxed()
                    .shared();
                    *lifecycle = Lifecycle::Initializing {
                        generation,
                        pending: pending.clone(),
                    };
                    pending
                }
            }
        };
        pending.await
    }

    async fn bootstrap(&self, generation: u64) -> Result<()> {
        debug!(generation, kind = self.transport.kind().as_str(), "Bootstrapping transport");
        let result = self.run_bootstrap().await;

        let superseded = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.is_attempt(generation) {
                *lifecycle = match &result {
                    Ok(()) => Lifecycle::Ready,
                    Err(_) => Lifecycle::Uninitialized,
                };
                false
            } else {
                true
            }
        };

        if superseded {
            // Destroyed mid-bootstrap. Release what this attempt opened unless
            // a newer attempt already owns the transport.
            if result.is_ok() && self.generation.load(Ordering::SeqCst) == generation {
                debug!(generation, "Releasing transport opened by a destroyed bootstrap");
                if let Err(e) = self.transport.teardown().await {
                    warn!(error = %e, "Teardown after destroyed bootstrap failed");
                }
            }
            return Err(ConnectorError::initialization(
                "Connector was destroyed during initialization",
            ));
        }

        match &result {
            Ok(()) => info!(kind = self.transport.kind().as_str(), "Connector ready"),
            Err(e) => warn!(error = %e, "Connector initialization failed"),
        }
        result
    }

    async fn run_bootstrap(&self) -> Result<()> {
        self.transport.bootstrap().await?;

        let Some(sql) = &self.initialization_query else {
            return Ok(());
        };
        let outcome = self
            .transport
            .run_query(sql, &QueryId::generate(), &CancellationToken::new())
            .await;
        if let Err(e) = outcome {
            if let Err(teardown) = self.transport.teardown().await {
                warn!(error = %teardown, "Teardown after failed initialization query failed");
            }
            return Err(ConnectorError::initialization(format!(
                "Initialization query failed: {e}"
            )));
        }
        Ok(())
    }

    async fn run_statement(
        self: &Arc<Self>,
        sql: &str,
        id: &QueryId,
        token: &CancellationToken,
    ) -> Result<Table> {
        self.initialize().await?;
        debug!(query_id = %id, "Running query");
        self.transport.run_query(sql, id, token).await
    }
}

/// Cancellable SQL connector over a [`Transport`].
///
/// Cheap to clone; clones share the engine, the lifecycle and the registry.
/// Queries are spawned on the current Tokio runtime.
pub struct Connector<T: Transport + ?Sized = dyn Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport + ?Sized> Clone for Connector<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Connector<T> {
    pub fn new(transport: T) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    /// A connector that runs `sql` once as the last step of bootstrap.
    pub fn with_initialization_query(transport: T, sql: impl Into<String>) -> Self {
        Self::from_parts(Arc::new(transport), Some(sql.into()))
    }
}

impl Connector {
    /// Builds the transport selected by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let (transport, initialization_query): (Arc<dyn Transport>, _) = match config.transport {
            TransportKind::InProcess => (
                Arc::new(InProcessTransport::new(config.in_process.clone())) as Arc<dyn Transport>,
                config.in_process.initialization_query.clone(),
            ),
            TransportKind::Remote => {
                config.remote.validate()?;
                (
                    Arc::new(RemoteTransport::new(config.remote.clone())) as Arc<dyn Transport>,
                    config.remote.initialization_query.clone(),
                )
            }
        };
        Ok(Self::from_parts(transport, initialization_query))
    }
}

impl<T: Transport + ?Sized> Connector<T> {
    pub fn from_arc(transport: Arc<T>) -> Self {
        Self::from_parts(transport, None)
    }

    /// A connector over a shared transport, with an optional SQL batch run
    /// once as the last step of bootstrap.
    pub fn from_parts(transport: Arc<T>, initialization_query: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: ActiveQueryRegistry::new(),
                initialization_query,
                lifecycle: Mutex::new(Lifecycle::Uninitialized),
                generation: AtomicU64::new(0),
                transport,
            }),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn registry(&self) -> &ActiveQueryRegistry {
        &self.inner.registry
    }

    pub fn state(&self) -> ConnectorState {
        self.inner.lifecycle().state()
    }

    pub fn active_query_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_query_active(&self, id: &QueryId) -> bool {
        self.inner.registry.contains(id)
    }

    /// Bootstraps the transport.
    ///
    /// Concurrent callers share one bootstrap and see the same outcome. A
    /// failure returns the connector to `Uninitialized` so a later call
    /// retries.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    /// Cancels every active query and tears the transport down.
    ///
    /// Safe to call when never initialized; the connector can be
    /// initialized again afterwards. A teardown failure is logged and
    /// returned, the connector is reset either way.
    pub async fn destroy(&self) -> Result<()> {
        let cancelled = self.inner.registry.cancel_all();
        *self.inner.lifecycle() = Lifecycle::Uninitialized;
        debug!(cancelled, "Destroying connector");

        match self.inner.transport.teardown().await {
            Ok(()) => {
                info!(kind = self.inner.transport.kind().as_str(), "Connector destroyed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Transport teardown failed");
                Err(e)
            }
        }
    }

    /// Registers a query and runs it on its own task.
    ///
    /// The query's token is a child of `options.signal`, so an external
    /// cancel reaches the query but cancelling the query leaves the
    /// external token alone. The registry entry lives exactly as long as
    /// the task.
    fn create_query_handle(&self, sql: String, options: QueryOptions) -> QueryHandle<Table> {
        let token = options
            .signal
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let (id, registration) = self.inner.registry.register(token.clone());

        let inner = Arc::clone(&self.inner);
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            // Dropping the registration at task exit removes the registry entry.
            let id = registration.id();
            if task_token.is_cancelled() {
                return Err(ConnectorError::aborted());
            }
            tokio::select! {
                biased;
                _ = task_token.cancelled() => Err(ConnectorError::aborted()),
                result = inner.run_statement(&sql, id, &task_token) => result,
            }
        });

        QueryHandle::new(id, token, async move {
            task.await
                .map_err(|e| ConnectorError::internal(format!("Query task failed: {e}")))?
        })
    }

    /// Runs `sql` and returns its result table.
    pub fn query(&self, sql: impl Into<String>, options: QueryOptions) -> QueryHandle<Table> {
        self.create_query_handle(sql.into(), options)
    }

    /// Runs `sql`, discarding any result.
    pub fn execute(&self, sql: impl Into<String>, options: QueryOptions) -> QueryHandle<()> {
        self.query(sql, options).map(|_| ())
    }

    /// Runs `sql` and returns a lazy row view of the result.
    pub fn query_json(&self, sql: impl Into<String>, options: QueryOptions) -> QueryHandle<Rows> {
        self.query(sql, options).map(Rows::new)
    }

    /// Cancels the active query `id`. Returns false if it already settled.
    pub fn cancel(&self, id: &QueryId) -> bool {
        self.inner.registry.cancel(id)
    }

    /// Loads a file into `table`.
    ///
    /// In-memory sources are staged first; any temporary copy is removed
    /// once the load finishes, successful or not.
    pub async fn load_file(
        &self,
        source: impl Into<FileSource>,
        table: &str,
        options: &LoadFileOptions,
    ) -> Result<()> {
        let source = source.into();
        self.initialize().await?;

        let staged = self.inner.transport.stage_file(&source).await?;
        let sql = self
            .inner
            .transport
            .file_load_sql(staged.path(), table, options)?;
        debug!(table, file = %source.name(), method = options.method.as_str(), "Loading file");

        let result = self.execute(sql, QueryOptions::default()).await;
        drop(staged);
        result
    }

    /// Loads Arrow data, a decoded table or an IPC stream, into `table`.
    ///
    /// Column types come from the Arrow schema, so zero-row data still
    /// creates the columns.
    pub async fn load_arrow(
        &self,
        source: impl Into<ArrowSource>,
        table: &str,
        options: &LoadOptions,
    ) -> Result<()> {
        let data = source.into().into_table()?;
        self.initialize().await?;
        debug!(table, rows = data.num_rows(), "Loading Arrow data");
        self.inner.transport.load_arrow(table, data, options).await
    }

    /// Creates `table` from row objects. Keys missing from a row load as NULL.
    pub async fn load_objects(
        &self,
        rows: &[Map<String, JsonValue>],
        table: &str,
        options: &LoadOptions,
    ) -> Result<()> {
        let sql = load::load_objects(table, rows, options)?;
        debug!(table, rows = rows.len(), "Loading row objects");
        self.execute(sql, QueryOptions::default()).await
    }
}

impl<T: Transport + ?Sized> fmt::Debug for Connector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("kind", &self.inner.transport.kind())
            .field("state", &self.state())
            .field("active_queries", &self.active_query_count())
            .finish()
    }
}
