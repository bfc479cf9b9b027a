// Logging setup - console plus optional rotating JSON files
//
// Precedence for the filter: RUST_LOG env var > config file > default "info".
// The daemon logs to stdout. The capture hook logs to stderr because Claude
// Code reads hook stdout.

use crate::config::{LogRotation, LoggingConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Where human-readable logs go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Console {
    Stdout,
    Stderr,
}

/// Default filter directive for a configured level
pub fn default_filter(level: &str) -> String {
    format!("hookq={level},tower_http=warn,axum=warn")
}

/// Install the global subscriber
///
/// The returned guard flushes the file writer on drop and must be kept alive
/// for the life of the process. `None` when file logging is off or its
/// directory could not be created.
pub fn init(config: &LoggingConfig, console: Console) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.level)));

    let console_layer = match console {
        Console::Stdout => tracing_subscriber::fmt::layer().boxed(),
        Console::Stderr => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let (file_layer, guard) = match file_writer(config) {
        Some((non_blocking, guard)) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            ),
            Some(guard),
        ),
        None => (None, None),
    };

    // try_init: tests and embedders may already have a subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    guard
}

fn file_writer(
    config: &LoggingConfig,
) -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    if !config.file_enabled {
        return None;
    }
    if let Err(e) = std::fs::create_dir_all(&config.file_dir) {
        eprintln!(
            "Warning: Could not create log directory {:?}: {}",
            config.file_dir, e
        );
        return None;
    }

    let appender = match config.file_rotation {
        LogRotation::Hourly => {
            tracing_appender::rolling::hourly(&config.file_dir, &config.file_prefix)
        }
        LogRotation::Daily => tracing_appender::rolling::daily(&config.file_dir, &config.file_prefix),
        LogRotation::Never => tracing_appender::rolling::never(&config.file_dir, &config.file_prefix),
    };

    // Writes happen on a background thread
    Some(tracing_appender::non_blocking(appender))
}
