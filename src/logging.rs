//! Structured logging setup, ported from the same `tracing`/`tracing-appender`
//! shape used throughout this crate's subsystems.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::Config;

/// Installs the global subscriber and returns the `WorkerGuard` that must be
/// held for the lifetime of the process — dropping it flushes and stops the
/// non-blocking writer.
pub fn init_logging(config: &Config) -> WorkerGuard {
    let logging = &config.logging;
    let file_appender = match logging.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&logging.log_dir, &logging.log_file),
        "daily" => tracing_appender::rolling::daily(&logging.log_dir, &logging.log_file),
        _ => tracing_appender::rolling::never(&logging.log_dir, &logging.log_file),
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    if logging.use_json {
        let file_layer = fmt::layer().json().with_target(true).with_writer(non_blocking).with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer().with_target(false).with_writer(non_blocking).with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}
