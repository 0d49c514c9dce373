//! Columnar query results.
//!
//! A [`Table`] is the schema plus the list of Arrow record batches a query
//! produced. Column access is typed and lazy; see [`Rows`] for the row view.

use std::io::Cursor;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use super::rows::Rows;
use super::types::{ColumnInfo, Value};
use crate::error::Result;

/// Result of a query: an Arrow schema and its record batches.
#[derive(Debug, Clone)]
pub struct Table {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    num_rows: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::empty()
    }
}

impl Table {
    /// An empty table with no columns.
    ///
    /// Returned for statements that produce no result set.
    pub fn empty() -> Self {
        Self::empty_with_schema(Arc::new(Schema::empty()))
    }

    /// A zero-row table that keeps the column layout of a result.
    pub fn empty_with_schema(schema: SchemaRef) -> Self {
        Self {
            schema,
            batches: Vec::new(),
            num_rows: 0,
        }
    }

    /// Assembles a table from batches sharing `schema`. Zero-row batches are dropped.
    pub fn from_batches(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        let batches: Vec<RecordBatch> = batches.into_iter().filter(|b| b.num_rows() > 0).collect();
        let num_rows = batches.iter().map(RecordBatch::num_rows).sum();
        Self {
            schema,
            batches,
            num_rows,
        }
    }

    /// Decodes an Arrow IPC stream.
    ///
    /// An empty byte slice yields [`Table::empty`]; a stream carrying only a
    /// schema yields a zero-row table with that schema.
    pub fn from_ipc_stream(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }
        let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
        let schema = reader.schema();
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::from_batches(schema, batches))
    }

    /// Encodes the table as an Arrow IPC stream.
    pub fn to_ipc_stream(&self) -> Result<Vec<u8>> {
        let mut writer = StreamWriter::try_new(Vec::new(), &self.schema)?;
        for batch in &self.batches {
            writer.write(batch)?;
        }
        Ok(writer.into_inner()?)
    }

    /// The Arrow schema.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// The non-empty record batches, in arrival order.
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.schema.fields().len()
    }

    /// Returns true if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    /// Column metadata in schema order.
    pub fn columns(&self) -> Vec<ColumnInfo> {
        self.schema
            .fields()
            .iter()
            .map(|field| ColumnInfo {
                name: field.name().clone(),
                data_type: field.data_type().to_string(),
                nullable: field.is_nullable(),
            })
            .collect()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.schema
            .fields()
            .iter()
            .map(|field| field.name().clone())
            .collect()
    }

    /// Typed accessor for the column called `name`.
    pub fn column(&self, name: &str) -> Option<ColumnView<'_>> {
        let index = self.schema.index_of(name).ok()?;
        self.column_at(index)
    }

    /// Typed accessor for the column at `index`.
    pub fn column_at(&self, index: usize) -> Option<ColumnView<'_>> {
        let field = self.schema.fields().get(index)?;
        Some(ColumnView {
            table: self,
            index,
            field: field.as_ref(),
        })
    }

    /// Reads a single cell; `None` if either coordinate is out of range.
    pub fn value(&self, row: usize, column: usize) -> Option<Value> {
        if column >= self.num_columns() {
            return None;
        }
        let (batch, offset) = self.locate(row)?;
        Some(Value::from_array(batch.column(column).as_ref(), offset))
    }

    /// A lazy row view over this table.
    pub fn rows(&self) -> Rows {
        Rows::new(self.clone())
    }

    /// Renders the table as an ASCII grid.
    pub fn pretty(&self) -> Result<String> {
        if self.batches.is_empty() {
            let header = self.column_names().join(" | ");
            return Ok(format!("{header}\n(0 rows)"));
        }
        Ok(arrow::util::pretty::pretty_format_batches(&self.batches)?.to_string())
    }

    /// Maps a table row to its batch and the offset inside that batch.
    pub(crate) fn locate(&self, mut row: usize) -> Option<(&RecordBatch, usize)> {
        for batch in &self.batches {
            if row < batch.num_rows() {
                return Some((batch, row));
            }
            row -= batch.num_rows();
        }
        None
    }
}

/// A single column of a [`Table`], spanning all of its batches.
#[derive(Debug, Clone, Copy)]
pub struct ColumnView<'a> {
    table: &'a Table,
    index: usize,
    field: &'a Field,
}

impl<'a> ColumnView<'a> {
    pub fn name(&self) -> &str {
        self.field.name()
    }

    pub fn data_type(&self) -> &DataType {
        self.field.data_type()
    }

    pub fn len(&self) -> usize {
        self.table.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The underlying Arrow arrays, one per batch.
    pub fn chunks(&self) -> impl Iterator<Item = &'a ArrayRef> + 'a {
        let index = self.index;
        self.table.batches.iter().map(move |b| b.column(index))
    }

    /// Reads the value at `row`; out-of-range rows read as NULL.
    pub fn get(&self, row: usize) -> Value {
        self.table
            .locate(row)
            .map(|(batch, offset)| Value::from_array(batch.column(self.index).as_ref(), offset))
            .unwrap_or_default()
    }

    pub fn get_i64(&self, row: usize) -> Option<i64> {
        self.get(row).as_i64()
    }

    pub fn get_f64(&self, row: usize) -> Option<f64> {
        self.get(row).as_f64()
    }

    pub fn get_bool(&self, row: usize) -> Option<bool> {
        self.get(row).as_bool()
    }

    pub fn get_string(&self, row: usize) -> Option<String> {
        match self.get(row) {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_display_string()),
        }
    }

    /// Iterates every value of the column in row order.
    pub fn values(&self) -> impl Iterator<Item = Value> + 'a {
        self.chunks()
            .flat_map(|array| (0..array.len()).map(move |i| Value::from_array(array.as_ref(), i)))
    }
}
