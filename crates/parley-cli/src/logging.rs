//! Logging setup.
//!
//! Everything goes to stderr through `tracing-subscriber`. The supervisor
//! also appends every line to its log file through a non-blocking writer;
//! the returned guard must be held until exit so buffered lines are flushed.

use std::fs::OpenOptions;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Filter from `RUST_LOG`, else `debug` when verbose, else `level`
fn build_filter(level: &str, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "debug".to_string()
        } else {
            level.to_lowercase()
        })
    })
}

/// Install the global subscriber.
///
/// With `file`, lines are also appended to that file (without ANSI colors).
///
/// # Errors
///
/// Returns an error if the log file cannot be opened or a subscriber is
/// already installed.
pub fn init(level: &str, verbose: bool, file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = build_filter(level, verbose);
    let console = fmt::layer().with_writer(std::io::stderr).with_target(verbose);

    match file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {}", path.display(), e))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let file_layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);

            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file_layer)
                .try_init()?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .try_init()?;
            Ok(None)
        }
    }
}
