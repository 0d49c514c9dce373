//! SQL text builders shared by the load helpers.

use arrow::datatypes::{DataType, Schema, TimeUnit};
use serde_json::{Map, Value as JsonValue};

use crate::error::{ConnectorError, Result};

/// Flags for [`create_table`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    pub replace: bool,
    pub temp: bool,
    pub view: bool,
}

/// Builds `CREATE [OR REPLACE] [TEMP] TABLE|VIEW [IF NOT EXISTS] name AS query`.
///
/// `IF NOT EXISTS` is emitted only when not replacing.
pub fn create_table(name: &str, query: &str, options: CreateOptions) -> String {
    let mut sql = String::from("CREATE");
    sql.push_str(if options.replace { " OR REPLACE " } else { " " });
    if options.temp {
        sql.push_str("TEMP ");
    }
    sql.push_str(if options.view { "VIEW" } else { "TABLE" });
    sql.push_str(if options.replace {
        " "
    } else {
        " IF NOT EXISTS "
    });
    sql.push_str(name);
    sql.push_str(" AS ");
    sql.push_str(query);
    sql
}

/// Quotes text as a SQL string literal.
pub fn quote_string(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Quotes an identifier with double quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Renders a JSON value as a DuckDB literal.
///
/// Arrays become list literals and objects become struct literals.
pub fn literal_to_sql(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_string(),
        JsonValue::Bool(true) => "TRUE".to_string(),
        JsonValue::Bool(false) => "FALSE".to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => quote_string(s),
        JsonValue::Array(items) => {
            let items: Vec<String> = items.iter().map(literal_to_sql).collect();
            format!("[{}]", items.join(", "))
        }
        JsonValue::Object(fields) => {
            let fields: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("{}: {}", quote_string(k), literal_to_sql(v)))
                .collect();
            format!("{{{}}}", fields.join(", "))
        }
    }
}

/// Renders reader parameters as `key=value` pairs.
pub fn parameters(params: &Map<String, JsonValue>) -> String {
    params
        .iter()
        .map(|(key, value)| format!("{key}={}", literal_to_sql(value)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds a query producing `rows` as a relation.
///
/// Columns default to the keys of the first row. Each row becomes one
/// `SELECT` and the rows are joined with `UNION ALL`; keys missing from a row
/// read as NULL.
pub fn sql_from(rows: &[Map<String, JsonValue>], columns: Option<&[String]>) -> Result<String> {
    let columns: Vec<String> = match columns {
        Some(columns) => columns.to_vec(),
        None => rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default(),
    };
    if columns.is_empty() {
        return Err(ConnectorError::query(
            "Can not create table from empty column set",
        ));
    }

    let selects: Vec<String> = rows
        .iter()
        .map(|row| {
            let fields: Vec<String> = columns
                .iter()
                .map(|column| {
                    let value = row.get(column).unwrap_or(&JsonValue::Null);
                    format!("{} AS {}", literal_to_sql(value), quote_identifier(column))
                })
                .collect();
            format!("(SELECT {})", fields.join(", "))
        })
        .collect();
    Ok(selects.join(" UNION ALL "))
}

/// DuckDB column type matching what the Arrow appender writes for `data_type`.
///
/// Dictionary columns map to their value type.
pub fn arrow_type_sql(data_type: &DataType) -> Result<String> {
    let sql = match data_type {
        DataType::Boolean => "BOOLEAN".to_string(),
        DataType::Int8 => "TINYINT".to_string(),
        DataType::Int16 => "SMALLINT".to_string(),
        DataType::Int32 => "INTEGER".to_string(),
        DataType::Int64 => "BIGINT".to_string(),
        DataType::UInt8 => "UTINYINT".to_string(),
        DataType::UInt16 => "USMALLINT".to_string(),
        DataType::UInt32 => "UINTEGER".to_string(),
        DataType::UInt64 => "UBIGINT".to_string(),
        DataType::Float32 => "FLOAT".to_string(),
        DataType::Float64 => "DOUBLE".to_string(),
        DataType::Decimal128(precision, scale) if *scale > 0 => {
            format!("DECIMAL({precision}, {scale})")
        }
        DataType::Utf8 | DataType::LargeUtf8 => "VARCHAR".to_string(),
        DataType::Binary | DataType::LargeBinary | DataType::FixedSizeBinary(_) => {
            "BLOB".to_string()
        }
        DataType::Date32 | DataType::Date64 => "DATE".to_string(),
        DataType::Time32(_) | DataType::Time64(_) => "TIME".to_string(),
        DataType::Timestamp(_, Some(_)) => "TIMESTAMPTZ".to_string(),
        DataType::Timestamp(unit, None) => match unit {
            TimeUnit::Second => "TIMESTAMP_S",
            TimeUnit::Millisecond => "TIMESTAMP_MS",
            TimeUnit::Microsecond => "TIMESTAMP",
            TimeUnit::Nanosecond => "TIMESTAMP_NS",
        }
        .to_string(),
        DataType::Duration(_) | DataType::Interval(_) => "INTERVAL".to_string(),
        DataType::List(child) | DataType::LargeList(child) => {
            format!("{}[]", arrow_type_sql(child.data_type())?)
        }
        DataType::FixedSizeList(child, size) => {
            format!("{}[{size}]", arrow_type_sql(child.data_type())?)
        }
        DataType::Struct(fields) => {
            let members = fields
                .iter()
                .map(|field| {
                    arrow_type_sql(field.data_type())
                        .map(|ty| format!("{} {ty}", quote_identifier(field.name())))
                })
                .collect::<Result<Vec<_>>>()?;
            format!("STRUCT({})", members.join(", "))
        }
        DataType::Dictionary(_, value) => arrow_type_sql(value)?,
        other => {
            return Err(ConnectorError::unsupported(format!(
                "Arrow type {other} cannot be loaded"
            )))
        }
    };
    Ok(sql)
}

/// Column definitions, `"name" TYPE, ...`, for an Arrow schema.
pub fn column_definitions(schema: &Schema) -> Result<String> {
    if schema.fields().is_empty() {
        return Err(ConnectorError::query(
            "Can not create table from empty column set",
        ));
    }
    let columns = schema
        .fields()
        .iter()
        .map(|field| {
            arrow_type_sql(field.data_type())
                .map(|ty| format!("{} {ty}", quote_identifier(field.name())))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(columns.join(", "))
}
