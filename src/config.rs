//! Configuration management for duckconn.
//!
//! Handles loading configuration from TOML files and environment variables
//! for both the in-process engine and the remote WebSocket server.

use crate::error::{ConnectorError, Result};
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

/// Main configuration structure for duckconn.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Which transport the connector uses.
    #[serde(default)]
    pub transport: TransportKind,

    /// Embedded engine settings.
    #[serde(default)]
    pub in_process: InProcessConfig,

    /// Remote server settings.
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Embedded engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InProcessConfig {
    /// Database file, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// SQL run once after the engine opens.
    pub initialization_query: Option<String>,

    /// Worker threads used by the engine. Engine default when unset.
    pub threads: Option<u32>,

    /// Ask the engine for JSON error payloads so positions can be rendered.
    #[serde(default = "default_structured_errors")]
    pub structured_errors: bool,
}

fn default_db_path() -> String {
    ":memory:".to_string()
}

fn default_structured_errors() -> bool {
    true
}

impl Default for InProcessConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            initialization_query: None,
            threads: None,
            structured_errors: default_structured_errors(),
        }
    }
}

impl InProcessConfig {
    /// Returns true if the database lives in memory only.
    pub fn is_in_memory(&self) -> bool {
        self.db_path.is_empty() || self.db_path == ":memory:"
    }

    /// Applies `DUCKCONN_DB_PATH` when no path was configured.
    pub fn apply_env_defaults(&mut self) {
        if self.is_in_memory() {
            if let Ok(path) = std::env::var("DUCKCONN_DB_PATH") {
                if !path.is_empty() {
                    self.db_path = path;
                }
            }
        }
    }
}

/// Remote server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// WebSocket endpoint.
    #[serde(default = "default_ws_url")]
    pub url: String,

    /// Token sent in the auth handshake; no handshake when unset.
    pub auth_token: Option<String>,

    /// Notification channels subscribed on every (re)connect.
    #[serde(default)]
    pub channels: Vec<String>,

    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub auth_timeout_secs: u64,

    /// SQL run once after the first connect.
    pub initialization_query: Option<String>,
}

fn default_ws_url() -> String {
    "ws://localhost:4000/ws".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            auth_token: None,
            channels: Vec::new(),
            connect_timeout_secs: default_timeout_secs(),
            auth_timeout_secs: default_timeout_secs(),
            initialization_query: None,
        }
    }
}

impl RemoteConfig {
    /// Creates a remote config for the given URL with default timeouts.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Parses and checks the endpoint URL.
    ///
    /// Only `ws` and `wss` schemes are accepted.
    pub fn validate(&self) -> Result<Url> {
        let url = Url::parse(&self.url)
            .map_err(|e| ConnectorError::config(format!("Invalid WebSocket URL: {e}")))?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConnectorError::config(format!(
                "Invalid scheme '{}'. Expected 'ws' or 'wss'",
                url.scheme()
            )));
        }

        Ok(url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Applies `DUCKCONN_WS_URL` and `DUCKCONN_AUTH_TOKEN` as defaults.
    pub fn apply_env_defaults(&mut self) {
        if self.url == default_ws_url() {
            if let Ok(url) = std::env::var("DUCKCONN_WS_URL") {
                if !url.is_empty() {
                    self.url = url;
                }
            }
        }
        if self.auth_token.is_none() {
            self.auth_token = std::env::var("DUCKCONN_AUTH_TOKEN")
                .ok()
                .filter(|t| !t.is_empty());
        }
    }

    /// Returns a display-safe string (no token) for logs.
    pub fn display_string(&self) -> String {
        let auth = if self.auth_token.is_some() {
            " (token auth)"
        } else {
            ""
        };
        format!("{}{auth}", self.url)
    }
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("duckconn")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file. A missing file yields defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConnectorError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            ConnectorError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })
    }

    /// Applies environment variables to both transport sections.
    pub fn apply_env_defaults(&mut self) {
        self.in_process.apply_env_defaults();
        self.remote.apply_env_defaults();
    }
}
