//! Error types for duckconn.
//!
//! Defines the main error enum used throughout the connector, plus the
//! structured engine error and the line/column pointer rendered from it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Main error type for connector operations.
///
/// `Clone` so that one shared initialization future can hand the same
/// failure to every caller awaiting it.
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    /// Bootstrap, connect or authentication failure. Never retried automatically.
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Engine-reported query failure.
    #[error("Query error: {0}")]
    Query(QueryFailure),

    /// The query was cancelled, by the caller or through a linked token.
    #[error("Query aborted: {0}")]
    Aborted(String),

    /// Socket closed, unreachable or unauthorized.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation not available on this transport.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Invalid configuration (bad URL, unreadable config file, ...).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected states, panicked worker tasks.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConnectorError {
    /// Creates an initialization error with the given message.
    pub fn initialization(msg: impl Into<String>) -> Self {
        Self::Initialization(msg.into())
    }

    /// Creates an unstructured query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(QueryFailure::plain(msg))
    }

    /// Creates the error returned for cancelled queries.
    pub fn aborted() -> Self {
        Self::Aborted("Query was cancelled".to_string())
    }

    /// Creates a transport error with the given message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates an unsupported-operation error with the given message.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this error means the query was cancelled rather than failed.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// Returns the structured engine error, if the engine reported one.
    pub fn structured(&self) -> Option<&StructuredQueryError> {
        match self {
            Self::Query(failure) => failure.structured.as_ref(),
            _ => None,
        }
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Initialization(_) => "Initialization Error",
            Self::Query(_) => "Query Error",
            Self::Aborted(_) => "Cancelled",
            Self::Transport(_) => "Transport Error",
            Self::Unsupported(_) => "Unsupported Operation",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

impl From<arrow::error::ArrowError> for ConnectorError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::query(format!("Arrow decoding failed: {err}"))
    }
}

/// Result type alias using ConnectorError.
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// An engine failure, with the structured payload when one could be parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFailure {
    /// Rendered message, including the line/column pointer when known.
    pub message: String,

    /// Machine-readable error details.
    pub structured: Option<StructuredQueryError>,
}

impl QueryFailure {
    /// A failure with no structured details.
    pub fn plain(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            structured: None,
        }
    }
}

impl fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Syntax or semantic error reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredQueryError {
    /// Exception type, e.g. `Catalog` or `Parser`.
    pub error_type: String,

    /// Exception subtype, e.g. `MISSING_ENTRY`.
    pub subtype: Option<String>,

    /// Engine message without the pointer.
    pub message: String,

    /// Byte offset into the SQL text.
    pub position: Option<usize>,
}

/// A 1-based line/column location inside a SQL string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPointer {
    pub line: usize,
    pub column: usize,
    /// Text of the offending line.
    pub line_text: String,
}

impl ErrorPointer {
    /// Renders the pointer as `LINE n:` followed by a caret under the column.
    pub fn render(&self) -> String {
        let prefix = format!("LINE {}: ", self.line);
        let padding = prefix.chars().count() + self.column.saturating_sub(1);
        format!("{prefix}{}\n{}^", self.line_text, " ".repeat(padding))
    }
}

/// Computes the line/column of a byte offset into `sql`.
///
/// Offsets past the end are clamped to the end; offsets inside a multi-byte
/// character are snapped back to the character start.
pub fn locate_position(sql: &str, byte_position: usize) -> ErrorPointer {
    let mut pos = byte_position.min(sql.len());
    while !sql.is_char_boundary(pos) {
        pos -= 1;
    }

    let before = &sql[..pos];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = sql[line_start..pos].chars().count() + 1;
    let line_end = sql[line_start..]
        .find('\n')
        .map(|i| line_start + i)
        .unwrap_or(sql.len());

    ErrorPointer {
        line,
        column,
        line_text: sql[line_start..line_end].trim_end_matches('\r').to_string(),
    }
}

/// JSON error payload emitted by DuckDB when `errors_as_json` is enabled.
#[derive(Deserialize)]
struct EngineErrorPayload {
    exception_type: String,
    exception_message: String,
    #[serde(default)]
    error_subtype: Option<String>,
    #[serde(default)]
    position: Option<serde_json::Value>,
}

fn textual_error_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)^(?P<kind>[A-Z][A-Za-z ]*?) Error: (?P<msg>.*)$").expect("valid regex")
    })
}

/// Turns a raw engine error into a query error.
///
/// A JSON payload with a byte position gets a pointer into `sql` prepended to
/// its message. A textual `"<Type> Error: ..."` payload keeps its text and
/// gains a structured type. Anything else is propagated as-is.
pub fn parse_engine_error(sql: &str, raw: &str) -> ConnectorError {
    let trimmed = raw.trim();

    if let Ok(payload) = serde_json::from_str::<EngineErrorPayload>(trimmed) {
        let position = payload.position.as_ref().and_then(|p| match p {
            serde_json::Value::Number(n) => n.as_u64().map(|n| n as usize),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });
        let headline = format!(
            "{} Error: {}",
            payload.exception_type, payload.exception_message
        );
        let message = match position {
            Some(pos) => format!("{}\n{headline}", locate_position(sql, pos).render()),
            None => headline,
        };
        return ConnectorError::Query(QueryFailure {
            message,
            structured: Some(StructuredQueryError {
                error_type: payload.exception_type,
                subtype: payload.error_subtype,
                message: payload.exception_message,
                position,
            }),
        });
    }

    if let Some(caps) = textual_error_regex().captures(trimmed) {
        return ConnectorError::Query(QueryFailure {
            message: trimmed.to_string(),
            structured: Some(StructuredQueryError {
                error_type: caps["kind"].to_string(),
                subtype: None,
                message: caps["msg"].to_string(),
                position: None,
            }),
        });
    }

    ConnectorError::query(trimmed)
}
