//! Lazy row view over a columnar [`Table`].
//!
//! Rows are materialized on demand. The first iteration that runs to the end
//! caches every row, later iterations replay the cache.

use std::sync::{Arc, OnceLock};

use serde::ser::{Serialize, SerializeMap, Serializer};

use super::table::Table;
use super::types::Value;

/// One materialized row: values in schema order plus the shared column names.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    names: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Value of the column called `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let index = self.names.iter().position(|n| n == name)?;
        self.values.get(index)
    }

    /// Value at column position `index`.
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn columns(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// The row as a JSON object keyed by column name.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .names
            .iter()
            .zip(&self.values)
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.names.iter().zip(&self.values) {
            map.serialize_entry(name, &value.to_json())?;
        }
        map.end()
    }
}

/// Iterable rows of a query result.
#[derive(Debug)]
pub struct Rows {
    table: Table,
    names: Arc<[String]>,
    cache: OnceLock<Vec<Row>>,
}

impl Rows {
    pub fn new(table: Table) -> Self {
        let names: Arc<[String]> = table.column_names().into();
        Self {
            table,
            names,
            cache: OnceLock::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.table.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The table backing this view.
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Returns true once a full traversal has populated the cache.
    pub fn is_materialized(&self) -> bool {
        self.cache.get().is_some()
    }

    /// Materializes the row at `index` without populating the cache.
    pub fn get(&self, index: usize) -> Option<Row> {
        if let Some(rows) = self.cache.get() {
            return rows.get(index).cloned();
        }
        self.materialize(index)
    }

    /// All rows, materializing and caching them on first call.
    pub fn to_vec(&self) -> &[Row] {
        self.cache
            .get_or_init(|| (0..self.len()).filter_map(|i| self.materialize(i)).collect())
    }

    pub fn iter(&self) -> RowIter<'_> {
        RowIter {
            rows: self,
            next: 0,
            collected: if self.is_materialized() {
                None
            } else {
                Some(Vec::with_capacity(self.len()))
            },
        }
    }

    fn materialize(&self, index: usize) -> Option<Row> {
        let (batch, offset) = self.table.locate(index)?;
        let values = batch
            .columns()
            .iter()
            .map(|array| Value::from_array(array.as_ref(), offset))
            .collect();
        Some(Row {
            names: self.names.clone(),
            values,
        })
    }
}

impl<'a> IntoIterator for &'a Rows {
    type Item = Row;
    type IntoIter = RowIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over [`Rows`]; fills the cache when it reaches the end.
pub struct RowIter<'a> {
    rows: &'a Rows,
    next: usize,
    collected: Option<Vec<Row>>,
}

impl Iterator for RowIter<'_> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        let row = match self.rows.cache.get() {
            Some(cached) => cached.get(self.next).cloned(),
            None => self.rows.materialize(self.next),
        };

        match row {
            Some(row) => {
                self.next += 1;
                if let Some(collected) = self.collected.as_mut() {
                    collected.push(row.clone());
                }
                Some(row)
            }
            None => {
                if let Some(collected) = self.collected.take() {
                    let _ = self.rows.cache.set(collected);
                }
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.rows.len().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}
