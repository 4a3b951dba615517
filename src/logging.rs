//! Logging setup for bridge processes.
//!
//! # Example
//!
//! ```rust,no_run
//! use sd_bridge::logging::init_logging;
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging("worker")?;
//!
//!     tracing::info!("Worker started");
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::expand_path;

/// Base directory for bridge log files.
pub const DEFAULT_LOG_DIR: &str = "~/.sd-bridge/logs";

/// Standard log directory, with `~` expanded.
pub fn log_dir() -> PathBuf {
    expand_path(Path::new(DEFAULT_LOG_DIR))
}

/// Log file for one component, e.g. `worker` or `host`.
pub fn log_file_path(component: &str) -> PathBuf {
    log_dir().join(format!("{}.log", component))
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Initialize file logging for one component.
///
/// Appends plain-text records to `~/.sd-bridge/logs/<component>.log`.
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_logging(component: &str) -> Result<()> {
    init_logging_in(&log_dir(), component)
}

/// Like [`init_logging`] but writing under `dir`.
pub fn init_logging_in(dir: &Path, component: &str) -> Result<()> {
    fs::create_dir_all(dir).context("Failed to create log directory")?;

    let log_path = dir.join(format!("{}.log", component));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let subscriber = tracing_subscriber::registry().with(env_filter("info")).with(
        fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true),
    );

    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;
    Ok(())
}

/// Initialize logging to stderr, for demos and interactive runs.
pub fn init_stderr_logging(default_filter: &str) -> Result<()> {
    let subscriber = tracing_subscriber::registry().with(env_filter(default_filter)).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_names(true),
    );

    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;
    Ok(())
}

/// Initialize file logging with daily rotation.
///
/// Older logs are kept as `<component>.log.YYYY-MM-DD`.
#[cfg(feature = "log-rotation")]
pub fn init_logging_with_rotation(component: &str) -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let dir = log_dir();
    fs::create_dir_all(&dir).context("Failed to create log directory")?;

    let appender = RollingFileAppender::new(Rotation::DAILY, &dir, format!("{}.log", component));

    let subscriber = tracing_subscriber::registry().with(env_filter("info")).with(
        fmt::layer()
            .with_writer(appender)
            .with_ansi(false)
            .with_target(true)
            .with_thread_names(true),
    );

    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;
    Ok(())
}
