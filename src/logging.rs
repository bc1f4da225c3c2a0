//! Logging initialisation for hyfervisor.
//!
//! When the `HYFERVISOR_LOG` environment variable is set to `1`, structured
//! logs are also written to `hyfervisor.log` in the application log
//! directory. Otherwise only stderr output (filtered by `RUST_LOG`, default
//! `warn`) is enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::PathBuf;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::AppPaths;

pub const LOG_ENV: &str = "HYFERVISOR_LOG";
pub const LOG_FILE: &str = "hyfervisor.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber. Call once from `main`.
pub fn init() -> LogGuard {
    let file_guard = if file_logging_requested() {
        let dir = log_dir();
        let file_appender = tracing_appender::rolling::never(dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}

fn file_logging_requested() -> bool {
    std::env::var(LOG_ENV).as_deref() == Ok("1")
}

/// The application log directory, created if needed; a temp directory when
/// `HOME` is unset or the directories cannot be created.
fn log_dir() -> PathBuf {
    match AppPaths::resolve() {
        Some(paths) if paths.ensure().is_ok() => paths.logs,
        _ => {
            let dir = std::env::temp_dir().join("hyfervisor");
            let _ = std::fs::create_dir_all(&dir);
            dir
        }
    }
}
