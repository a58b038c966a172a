//! Tracing subscriber setup.

use std::path::Path;

use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, fmt::writer::BoxMakeWriter, prelude::*};

use crate::config::LogFormat;

const LOG_FILE_PREFIX: &str = "appforge.log";

/// `RUST_LOG` wins over the configured level when set.
fn filter_directive(level: &str, rust_log: Option<String>) -> String {
    match rust_log.filter(|v| !v.trim().is_empty()) {
        Some(directive) => directive,
        None => format!("{},tower_http=warn,bollard=warn,hyper=warn", level.trim()),
    }
}

fn build_filter(level: &str) -> EnvFilter {
    let directive = filter_directive(level, std::env::var("RUST_LOG").ok());
    EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("Invalid log filter {:?} ({}), using 'info'", directive, e);
        EnvFilter::new("info")
    })
}

/// Install the global subscriber. With a log directory, output goes to a
/// daily rolling file through a background writer; keep the returned guard
/// alive for the life of the process so buffered lines are flushed.
pub fn init_logging(level: &str, format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (writer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let filter = build_filter(level);
    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(writer))
            .try_init(),
    };

    if let Err(err) = result {
        warn!("Tracing already initialised, skipping duplicate subscriber: {err}");
    }
    guard
}
