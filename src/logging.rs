//! Tracing setup for the host process.
//!
//! Everything goes to stderr, filtered by `RUST_LOG` (default `warn`).
//! Setting `VCOMPUTER_LOG=1` adds a non-blocking file layer writing
//! `vcomputer.log` into the host log directory and raises the default filter
//! to `info`, which is where computer lifecycle and mount decisions are
//! logged.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::{APP_NAME, HostPaths};

pub const LOG_FILE: &str = "vcomputer.log";

/// Keeps the file writer's worker alive. Dropping it flushes pending lines.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

fn log_dir() -> PathBuf {
    HostPaths::resolve()
        .map(|p| p.logs)
        .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME))
}

/// Install the global subscriber. Call once from `main` and hold the guard.
pub fn init() -> LogGuard {
    let to_file = std::env::var("VCOMPUTER_LOG").as_deref() == Ok("1");
    let default_level = if to_file { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let mut guard = None;
    let file_layer = to_file.then(|| {
        let dir = log_dir();
        // A missing directory surfaces as write errors in the appender.
        let _ = std::fs::create_dir_all(&dir);
        let (writer, worker) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE));
        guard = Some(worker);
        fmt::layer().with_writer(writer).with_ansi(false).with_thread_names(true)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    LogGuard { _file: guard }
}
