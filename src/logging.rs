//! Tracing setup for the CLI.
//!
//! Two layers: a human-readable layer on stderr filtered by `LOG_LEVEL`,
//! and a JSON file layer under `.ad-sdlc/logs/` for later inspection via
//! `ad-sdlc logs`. Correlation ids and session ids travel as structured
//! fields on the events themselves.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Name stem of the rolling log file.
pub const LOG_FILE_PREFIX: &str = "ad-sdlc.log";

/// Install the global subscriber. Returns the appender guard, which must
/// stay alive for the process lifetime to flush the file layer.
///
/// `LOG_LEVEL` wins; without it, `--verbose` selects debug over info.
/// Safe to call more than once (later calls are no-ops), so tests that
/// pull in the library can install their own subscribers.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> Option<WorkerGuard> {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(fallback));

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().json().with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .try_init();
            None
        }
    }
}
