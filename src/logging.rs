//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use crate::error::{Result, SpikepipeError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file name prefix inside the configured directory
pub const LOG_FILE_PREFIX: &str = "spikepipe.log";

/// Build the filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| {
            SpikepipeError::Config(format!("Invalid log level '{}': {}", config.level, e))
        })
}

/// Install the global subscriber.
///
/// Logs go to stderr, and to a daily rolling file when a directory is
/// configured. Keep the returned guard alive for as long as file logging is
/// wanted; dropping it flushes and stops the writer.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(config)?;

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| SpikepipeError::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    tracing::info!("Logging initialized at level '{}'", config.level);
    Ok(guard)
}
