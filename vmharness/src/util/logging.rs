//! Tracing subscriber setup.
//!
//! Filtering follows `RUST_LOG` (default `info`), e.g.
//! `RUST_LOG=vmharness=trace` to see every monitor message.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt};
use vmharness_shared::{HarnessError, HarnessResult};

const DEFAULT_FILTER: &str = "info";

/// File written by [`init_logging_to`].
pub const LOG_FILE_NAME: &str = "vmharness.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Log to stderr. Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let _ = fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

/// Log to `<dir>/vmharness.log`.
///
/// Keep the returned guard alive for as long as logging is needed; dropping
/// it flushes and stops the background writer.
pub fn init_logging_to(dir: &Path) -> HarnessResult<WorkerGuard> {
    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| HarnessError::Config(format!("logging already initialized: {}", e)))?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        init_logging();
        init_logging();
        tracing::info!("logging initialized twice");
    }
}
