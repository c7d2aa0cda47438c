use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Environment variable consulted for the log filter before `RUST_LOG`.
pub const LOG_ENV: &str = "DUPE_LOG";

/// Initialize file-based logging with daily log rotation.
///
/// Logs are written to `dupe.log.YYYY-MM-DD` in `log_dir`, or in
/// [`default_log_dir`] when none is given, so they never interleave with the
/// progress bar. The level defaults to `info` and can be overridden via the
/// `DUPE_LOG` or `RUST_LOG` environment variables.
///
/// Returns a [`WorkerGuard`] that **must** be held for the lifetime of the program
/// to ensure buffered log records are flushed on shutdown.
pub fn init(log_dir: Option<&Path>) -> Result<WorkerGuard> {
    let dir = log_dir.map(Path::to_path_buf).unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&dir, "dupe.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true),
        )
        .with(env_filter())
        .try_init()
        .context("failed to install the log subscriber")?;

    Ok(guard)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// `<temp dir>/dupe-logs`
pub fn default_log_dir() -> PathBuf {
    std::env::temp_dir().join("dupe-logs")
}
