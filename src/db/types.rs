//! Scalar value types for duckconn.
//!
//! Defines the structures used to represent individual cells and column
//! metadata read out of Arrow result batches.

use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, UInt16Type,
    UInt32Type, UInt64Type, UInt8Type,
};
use arrow::util::display::{ArrayFormatter, FormatOptions};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata about a column in a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Column data type, as Arrow renders it.
    pub data_type: String,

    /// Whether the column may contain NULLs.
    pub nullable: bool,
}

impl ColumnInfo {
    /// Creates a new column info with the given name and type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }
}

/// Represents a single value read from a result table.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed integer (up to i64).
    Int(i64),

    /// Floating point number.
    Float(f64),

    /// Text/string value, also used for temporal and decimal columns.
    String(String),

    /// Binary data.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the value as an i64 if it is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as an f64 if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the value as a string slice if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a bool if it is boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Attempts to convert the value to a string representation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }

    /// Converts the value into plain JSON. Bytes become base64 text and
    /// non-finite floats become null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(STANDARD.encode(b)),
        }
    }

    /// Reads the cell at `index` of an Arrow array.
    ///
    /// Integer, float, boolean, string and binary columns map to their
    /// natural variant; everything else (dates, timestamps, decimals,
    /// nested types) is rendered as text by Arrow's formatter.
    pub fn from_array(array: &dyn Array, index: usize) -> Self {
        if index >= array.len() || array.is_null(index) {
            return Value::Null;
        }

        match array.data_type() {
            DataType::Boolean => Value::Bool(array.as_boolean().value(index)),
            DataType::Int8 => Value::Int(array.as_primitive::<Int8Type>().value(index) as i64),
            DataType::Int16 => Value::Int(array.as_primitive::<Int16Type>().value(index) as i64),
            DataType::Int32 => Value::Int(array.as_primitive::<Int32Type>().value(index) as i64),
            DataType::Int64 => Value::Int(array.as_primitive::<Int64Type>().value(index)),
            DataType::UInt8 => Value::Int(array.as_primitive::<UInt8Type>().value(index) as i64),
            DataType::UInt16 => Value::Int(array.as_primitive::<UInt16Type>().value(index) as i64),
            DataType::UInt32 => Value::Int(array.as_primitive::<UInt32Type>().value(index) as i64),
            DataType::UInt64 => {
                let v = array.as_primitive::<UInt64Type>().value(index);
                i64::try_from(v)
                    .map(Value::Int)
                    .unwrap_or_else(|_| Value::String(v.to_string()))
            }
            DataType::Float32 => {
                Value::Float(array.as_primitive::<Float32Type>().value(index) as f64)
            }
            DataType::Float64 => Value::Float(array.as_primitive::<Float64Type>().value(index)),
            DataType::Utf8 => Value::String(array.as_string::<i32>().value(index).to_string()),
            DataType::LargeUtf8 => {
                Value::String(array.as_string::<i64>().value(index).to_string())
            }
            DataType::Binary => Value::Bytes(array.as_binary::<i32>().value(index).to_vec()),
            DataType::LargeBinary => Value::Bytes(array.as_binary::<i64>().value(index).to_vec()),
            _ => ArrayFormatter::try_new(array, &FormatOptions::default())
                .map(|formatter| Value::String(formatter.value(index).to_string()))
                .unwrap_or(Value::Null),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

// Conversion implementations for common types
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
