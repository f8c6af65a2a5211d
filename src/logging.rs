//! Tracing setup
//!
//! Console output always goes to stderr. When a debug log path is given, the
//! same events are also appended to that file through a non-blocking writer
//! so disk latency never reaches the proxy hot path.

use once_cell::sync::OnceCell;
use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Install the global subscriber. Repeated calls are no-ops.
pub fn init_logging(debug_log: Option<&Path>) -> anyhow::Result<()> {
    let level = resolve_log_level();

    let file_layer = match debug_log {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let dir = dir.unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let file_name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "tapline_debug.log".into());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = LOG_GUARD.set(guard);
            Some(fmt::layer().with_ansi(false).with_writer(writer))
        }
        None => None,
    };

    // Another component may already own the global subscriber; not fatal.
    let _ = tracing_subscriber::registry()
        .with(level)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();

    tracing::info!("Tapline core logging initialized v{}", crate::VERSION);
    Ok(())
}

fn resolve_log_level() -> LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(val) => match val.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => LevelFilter::INFO,
        },
        Err(_) => LevelFilter::INFO,
    }
}
