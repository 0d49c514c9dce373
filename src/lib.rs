//! duckconn - a cancellable DuckDB connector.
//!
//! Runs SQL against an embedded DuckDB engine or a remote DuckDB server
//! reached over a WebSocket, with the same handle-based API for both.

pub mod config;
pub mod connector;
pub mod db;
pub mod error;
pub mod load;
pub mod logging;
pub mod query;
pub mod transport;

pub use connector::{Connector, ConnectorState};
pub use db::{Row, Rows, Table};
pub use error::{ConnectorError, Result};
pub use query::{QueryHandle, QueryId, QueryOptions};
