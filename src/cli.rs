//! Command-line argument parsing for duckconn.

use clap::Parser;
use duckconn::config::Config;
use duckconn::load::LoadMethod;
use duckconn::transport::TransportKind;
use std::path::PathBuf;

/// How query results are printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Boxed table.
    #[default]
    Table,
    /// One JSON object per row.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Invalid output format: {s}. Expected: table or json"
            )),
        }
    }
}

/// Run SQL against an embedded DuckDB engine or a remote DuckDB server.
#[derive(Parser, Debug)]
#[command(name = "duckconn")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// SQL statements, run in order
    #[arg(value_name = "SQL")]
    pub sql: Vec<String>,

    /// WebSocket URL of a remote DuckDB server (selects the remote transport)
    #[arg(short = 'r', long, value_name = "URL")]
    pub remote: Option<String>,

    /// Token for the remote auth handshake
    #[arg(short = 't', long, value_name = "TOKEN")]
    pub token: Option<String>,

    /// Database file for the embedded engine (selects the in-process transport)
    #[arg(short = 'd', long, value_name = "PATH", conflicts_with = "remote")]
    pub db: Option<String>,

    /// Config file path
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// File to load before running the statements
    #[arg(short = 'l', long, value_name = "FILE")]
    pub load: Option<PathBuf>,

    /// Table the loaded file goes into (defaults to the file stem)
    #[arg(long, value_name = "NAME", requires = "load")]
    pub table: Option<String>,

    /// Reader used for --load (auto, read_csv, read_json, read_ndjson, read_parquet, read_ipc, st_read)
    #[arg(long, value_name = "METHOD", default_value = "auto", requires = "load")]
    pub method: String,

    /// Notification channel to subscribe to (remote only, repeatable)
    #[arg(short = 's', long, value_name = "CHANNEL")]
    pub subscribe: Vec<String>,

    /// Output format: table or json
    #[arg(short = 'o', long, value_name = "FORMAT", default_value = "table")]
    pub output: String,

    /// Write logs to the state directory instead of stderr
    #[arg(long)]
    pub log_file: bool,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    pub fn output_format(&self) -> std::result::Result<OutputFormat, String> {
        self.output.parse()
    }

    pub fn load_method(&self) -> std::result::Result<LoadMethod, String> {
        LoadMethod::parse(&self.method)
            .ok_or_else(|| format!("Invalid load method: {}", self.method))
    }

    /// Target table for --load.
    pub fn load_table(&self) -> Option<String> {
        if let Some(table) = &self.table {
            return Some(table.clone());
        }
        self.load
            .as_ref()?
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
    }

    /// Applies command-line overrides on top of the file configuration.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(url) = &self.remote {
            config.transport = TransportKind::Remote;
            config.remote.url = url.clone();
        }
        if let Some(token) = &self.token {
            config.remote.auth_token = Some(token.clone());
        }
        if let Some(path) = &self.db {
            config.transport = TransportKind::InProcess;
            config.in_process.db_path = path.clone();
        }
        for channel in &self.subscribe {
            if !config.remote.channels.contains(channel) {
                config.remote.channels.push(channel.clone());
            }
        }
    }

    /// Validates argument combinations clap cannot express.
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.output_format()?;
        if self.load.is_some() {
            self.load_method()?;
        }
        if self.sql.is_empty() && self.load.is_none() && self.subscribe.is_empty() {
            return Err("Nothing to do: pass SQL, --load or --subscribe".to_string());
        }
        Ok(())
    }
}
