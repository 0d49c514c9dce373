//! Logging setup for the duckconn binary.
//!
//! The library only emits `tracing` events. The binary installs a subscriber
//! writing to stderr, so query output on stdout stays clean, or to a log
//! file under the platform state directory.

use std::fs::{self, File};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Variable read for the log filter before `RUST_LOG`.
pub const LOG_ENV: &str = "DUCKCONN_LOG";

/// Where log output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogTarget {
    #[default]
    Stderr,
    File,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber for `target`.
///
/// A log file that cannot be created falls back to stderr with a warning.
pub fn init(target: LogTarget) {
    match target {
        LogTarget::Stderr => init_stderr(),
        LogTarget::File => match open_log_file() {
            Ok(file) => tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(file)
                .with_ansi(false)
                .init(),
            Err(e) => {
                eprintln!("Warning: Could not open log file: {e}");
                init_stderr();
            }
        },
    }
}

fn init_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

/// Creates the log file, truncating the previous run's log.
fn open_log_file() -> std::io::Result<File> {
    let path = log_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}

/// `duckconn.log` in the state directory, else the config directory, else
/// the temp directory.
pub fn log_path() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::config_dir)
        .map(|dir| dir.join("duckconn").join("duckconn.log"))
        .unwrap_or_else(|| std::env::temp_dir().join("duckconn.log"))
}
