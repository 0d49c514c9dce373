//! Data-loading helpers.
//!
//! Pure functions composing the SQL that ingests files, row objects and
//! Arrow data. The connector runs the resulting statements like any other
//! query; nothing here touches an engine.

mod sql;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::db::Table;
use crate::error::Result;

pub use sql::{
    arrow_type_sql, column_definitions, create_table, literal_to_sql, parameters,
    quote_identifier, quote_string, sql_from, CreateOptions,
};

/// DuckDB reader used to load a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMethod {
    /// Let DuckDB pick the reader from the file name.
    #[default]
    Auto,
    ReadCsv,
    ReadJson,
    ReadNdjson,
    ReadParquet,
    /// Arrow IPC files.
    ReadIpc,
    /// Spatial formats through the `spatial` extension.
    StRead,
}

impl LoadMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::ReadCsv => "read_csv",
            Self::ReadJson => "read_json",
            Self::ReadNdjson => "read_ndjson",
            Self::ReadParquet => "read_parquet",
            Self::ReadIpc => "read_ipc",
            Self::StRead => "st_read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "read_csv" | "csv" => Some(Self::ReadCsv),
            "read_json" | "json" => Some(Self::ReadJson),
            "read_ndjson" | "ndjson" => Some(Self::ReadNdjson),
            "read_parquet" | "parquet" => Some(Self::ReadParquet),
            "read_ipc" | "ipc" | "arrow" => Some(Self::ReadIpc),
            "st_read" | "spatial" => Some(Self::StRead),
            _ => None,
        }
    }
}

/// Options shared by every load helper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Schema to create the table in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Columns to select; `*` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,

    /// WHERE clause applied to the source.
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    #[serde(default)]
    pub view: bool,

    #[serde(default)]
    pub temp: bool,

    #[serde(default)]
    pub replace: bool,

    /// Reader-specific parameters, passed through as `key=value`.
    #[serde(flatten)]
    pub params: Map<String, JsonValue>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn view(mut self) -> Self {
        self.view = true;
        self
    }

    pub fn temp(mut self) -> Self {
        self.temp = true;
        self
    }

    pub fn replace(mut self) -> Self {
        self.replace = true;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Table name qualified with the schema, if any.
    pub fn qualified_name(&self, table: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{table}"),
            None => table.to_string(),
        }
    }

    fn create_options(&self) -> CreateOptions {
        CreateOptions {
            replace: self.replace,
            temp: self.temp,
            view: self.view,
        }
    }

    fn select_list(&self) -> String {
        match &self.select {
            Some(columns) if !columns.is_empty() => columns.join(", "),
            _ => "*".to_string(),
        }
    }

    fn selects_everything(&self) -> bool {
        match &self.select {
            None => true,
            Some(columns) => columns.is_empty() || (columns.len() == 1 && columns[0] == "*"),
        }
    }
}

/// `open_options` for the spatial reader, in any of the accepted shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpatialOpenOptions {
    List(Vec<String>),
    Text(String),
    Map(Map<String, JsonValue>),
}

impl SpatialOpenOptions {
    /// Renders the options as the upper-cased `open_options` string.
    pub fn render(&self) -> String {
        let text = match self {
            Self::List(items) => items.join(", "),
            Self::Text(text) => text.clone(),
            Self::Map(entries) => entries
                .iter()
                .map(|(key, value)| match value {
                    JsonValue::String(s) => format!("{key}={s}"),
                    other => format!("{key}={other}"),
                })
                .collect::<Vec<_>>()
                .join(", "),
        };
        text.to_uppercase()
    }
}

/// Options for loading a file: the reader plus the shared options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadFileOptions {
    #[serde(default)]
    pub method: LoadMethod,

    /// Only used with [`LoadMethod::StRead`].
    #[serde(default, rename = "options", skip_serializing_if = "Option::is_none")]
    pub open_options: Option<SpatialOpenOptions>,

    #[serde(flatten)]
    pub options: LoadOptions,
}

impl LoadFileOptions {
    pub fn new(method: LoadMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_open_options(mut self, open_options: SpatialOpenOptions) -> Self {
        self.open_options = Some(open_options);
        self
    }
}

/// A file to load.
#[derive(Debug, Clone, PartialEq)]
pub enum FileSource {
    /// A path readable by the engine.
    Path(PathBuf),
    /// In-memory file contents. `name` supplies the extension the reader
    /// sniffs, and is used as the path on transports that cannot upload.
    Bytes { name: String, data: Vec<u8> },
}

impl FileSource {
    pub fn bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes {
            name: name.into(),
            data: data.into(),
        }
    }

    /// The path or file name as text.
    pub fn name(&self) -> String {
        match self {
            Self::Path(path) => path.to_string_lossy().into_owned(),
            Self::Bytes { name, .. } => name.clone(),
        }
    }

    /// Lower-cased extension of the path or name.
    pub fn extension(&self) -> Option<String> {
        let name = self.name();
        Path::new(&name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
    }
}

impl From<PathBuf> for FileSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for FileSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<&str> for FileSource {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<String> for FileSource {
    fn from(path: String) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

/// Arrow data to load: a decoded table or an IPC stream.
#[derive(Debug, Clone)]
pub enum ArrowSource {
    Table(Table),
    Ipc(Vec<u8>),
}

impl ArrowSource {
    pub fn into_table(self) -> Result<Table> {
        match self {
            Self::Table(table) => Ok(table),
            Self::Ipc(bytes) => Table::from_ipc_stream(&bytes),
        }
    }
}

impl From<Table> for ArrowSource {
    fn from(table: Table) -> Self {
        Self::Table(table)
    }
}

impl From<Vec<u8>> for ArrowSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Ipc(bytes)
    }
}

/// Builds the statement loading `file_name` into `table` with `method`.
///
/// `defaults` are reader parameters that `options.params` may override.
pub fn load(
    method: LoadMethod,
    table: &str,
    file_name: &str,
    options: &LoadOptions,
    defaults: &Map<String, JsonValue>,
) -> String {
    let mut params = defaults.clone();
    for (key, value) in &options.params {
        params.insert(key.clone(), value.clone());
    }
    let params = parameters(&params);
    let args = if params.is_empty() {
        quote_string(file_name)
    } else {
        format!("{}, {params}", quote_string(file_name))
    };

    let read = match method {
        LoadMethod::Auto => args,
        other => format!("{}({args})", other.as_str()),
    };
    load_relation(table, &read, options)
}

/// Builds the statement creating `table` from `relation`, anything that can
/// follow `FROM`: a table name, a reader call or a quoted file name.
pub fn load_relation(table: &str, relation: &str, options: &LoadOptions) -> String {
    let filter = options
        .filter
        .as_ref()
        .map(|f| format!(" WHERE {f}"))
        .unwrap_or_default();
    let query = format!("SELECT {} FROM {relation}{filter}", options.select_list());

    create_table(
        &options.qualified_name(table),
        &query,
        options.create_options(),
    )
}

/// CSV with sniffing over the whole file.
pub fn load_csv(table: &str, file_name: &str, options: &LoadOptions) -> String {
    let mut defaults = Map::new();
    defaults.insert("auto_detect".into(), JsonValue::Bool(true));
    defaults.insert("sample_size".into(), JsonValue::from(-1));
    load(LoadMethod::ReadCsv, table, file_name, options, &defaults)
}

pub fn load_json(table: &str, file_name: &str, options: &LoadOptions) -> String {
    let mut defaults = Map::new();
    defaults.insert("auto_detect".into(), JsonValue::Bool(true));
    defaults.insert("format".into(), JsonValue::from("auto"));
    load(LoadMethod::ReadJson, table, file_name, options, &defaults)
}

pub fn load_parquet(table: &str, file_name: &str, options: &LoadOptions) -> String {
    load(
        LoadMethod::ReadParquet,
        table,
        file_name,
        options,
        &Map::new(),
    )
}

/// Spatial formats via `st_read`. Requires the spatial extension.
pub fn load_spatial(
    table: &str,
    file_name: &str,
    options: &LoadOptions,
    open_options: Option<&SpatialOpenOptions>,
) -> String {
    let mut options = options.clone();
    if let Some(open) = open_options {
        options
            .params
            .insert("open_options".into(), JsonValue::String(open.render()));
    }
    load(LoadMethod::StRead, table, file_name, &options, &Map::new())
}

/// Dispatches on the method in `options`.
pub fn load_file(table: &str, file_name: &str, options: &LoadFileOptions) -> String {
    match options.method {
        LoadMethod::StRead => load_spatial(
            table,
            file_name,
            &options.options,
            options.open_options.as_ref(),
        ),
        method => load(method, table, file_name, &options.options, &Map::new()),
    }
}

/// Builds the statement creating `table` from row objects.
///
/// Fails on an empty row set, since no columns can be derived from it.
pub fn load_objects(
    table: &str,
    rows: &[Map<String, JsonValue>],
    options: &LoadOptions,
) -> Result<String> {
    let values = sql_from(rows, None)?;
    let query = if options.selects_everything() {
        values
    } else {
        format!("SELECT {} FROM ({values})", options.select_list())
    };
    Ok(create_table(
        &options.qualified_name(table),
        &query,
        options.create_options(),
    ))
}
