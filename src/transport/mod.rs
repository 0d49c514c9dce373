//! Transport abstraction.
//!
//! A transport executes SQL against one engine, either embedded in the
//! process or reached over a WebSocket. The [`Connector`](crate::Connector)
//! owns lifecycle, cancellation and bookkeeping; transports only know how
//! to start, stop and run a single statement.

mod engine;
pub mod in_process;
pub mod mock;
pub mod remote;

pub use in_process::InProcessTransport;
pub use mock::{FailingTransport, MockTransport};
pub use remote::{RemoteTransport, SocketStatus};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;

use crate::db::Table;
use crate::error::{ConnectorError, Result};
use crate::load::{self, FileSource, LoadFileOptions, LoadOptions};
use crate::query::QueryId;

/// Supported transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    InProcess,
    Remote,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in_process",
            Self::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "in_process" | "in-process" | "local" | "embedded" => Some(Self::InProcess),
            "remote" | "ws" | "websocket" => Some(Self::Remote),
            _ => None,
        }
    }
}

/// A file made readable by the engine for the duration of a load.
///
/// Temporary copies are deleted when this value is dropped.
#[derive(Debug)]
pub struct StagedFile {
    path: String,
    temp: Option<TempPath>,
}

impl StagedFile {
    /// A path the engine can already read.
    pub fn existing(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            temp: None,
        }
    }

    /// A temporary copy, removed on drop.
    pub fn temporary(temp: TempPath) -> Self {
        Self {
            path: temp.to_string_lossy().into_owned(),
            temp: Some(temp),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }
}

/// Trait implemented by every engine transport.
///
/// All methods must tolerate being called in any lifecycle state; the
/// connector guarantees `run_query` is only reached after `bootstrap`
/// succeeded.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    /// Opens the engine or connection.
    async fn bootstrap(&self) -> Result<()>;

    /// Releases the engine or connection. Must succeed when never bootstrapped.
    async fn teardown(&self) -> Result<()>;

    /// Runs one statement.
    ///
    /// Returns [`ConnectorError::Aborted`] once `cancel` fires. Dropping the
    /// returned future before it completes must also stop engine-side work.
    async fn run_query(&self, sql: &str, id: &QueryId, cancel: &CancellationToken)
        -> Result<Table>;

    /// Makes `source` readable by the engine.
    async fn stage_file(&self, source: &FileSource) -> Result<StagedFile> {
        match source {
            FileSource::Path(_) => Ok(StagedFile::existing(source.name())),
            FileSource::Bytes { .. } => Err(ConnectorError::unsupported(
                "In-memory files are not supported by this transport",
            )),
        }
    }

    /// Statement loading the staged file at `path` into `table`.
    fn file_load_sql(&self, path: &str, table: &str, options: &LoadFileOptions) -> Result<String> {
        Ok(load::load_file(table, path, options))
    }

    /// Creates `table` from Arrow `data`, keeping the column types.
    async fn load_arrow(&self, _table: &str, _data: Table, _options: &LoadOptions) -> Result<()> {
        Err(ConnectorError::unsupported(
            "Arrow loading is not supported by this transport",
        ))
    }
}
