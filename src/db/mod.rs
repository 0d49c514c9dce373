//! Result data layer for duckconn.
//!
//! Query results are columnar: a [`Table`] holds the Arrow schema and record
//! batches, [`ColumnView`] gives typed access to one column and [`Rows`]
//! materializes rows lazily on top of it.

mod rows;
mod table;
mod types;

pub use rows::{Row, RowIter, Rows};
pub use table::{ColumnView, Table};
pub use types::{ColumnInfo, Value};
