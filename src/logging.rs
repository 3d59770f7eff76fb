//! Logging setup
//!
//! File output goes through a non-blocking rolling appender; text mode adds
//! an ANSI stdout layer for interactive runs. `RUST_LOG` overrides the
//! configured directives.

use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Target of the per-frame logs emitted by the gateway worker
pub const WIRE_TARGET: &str = "wire";

/// Filter directives: configured level plus the wire target switch
pub fn filter_directives(config: &AppConfig) -> String {
    let wire_level = if config.enable_tracing { "trace" } else { "off" };
    format!("{},{}={}", config.log_level, WIRE_TARGET, wire_level)
}

fn rolling_appender(config: &AppConfig) -> RollingFileAppender {
    let dir = &config.log_dir;
    let file = &config.log_file;
    match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(dir, file),
        "daily" => tracing_appender::rolling::daily(dir, file),
        _ => tracing_appender::rolling::never(dir, file),
    }
}

/// Install the global subscriber. Keep the guard alive until exit or
/// buffered lines are lost.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(rolling_appender(config));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        // Targets stay in JSON so wire logs can be queried separately
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false)
            .with_writer(writer)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(writer)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    tracing::info!(
        level = %config.log_level,
        dir = %config.log_dir,
        rotation = %config.rotation,
        json = config.use_json,
        "Logging initialised"
    );
    guard
}
