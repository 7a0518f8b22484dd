//! Logging for the LLM loader
//!
//! Installs a `tracing` subscriber with an environment filter, plain or JSON
//! stdout output and an optional daily rolling log file.

pub use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use common::error::{Error, Result};
use loader_config::LoggingSettings;

/// File name prefix of the rolling log
pub const LOG_FILE_PREFIX: &str = "llm-loader.log";

/// Builds the filter: `RUST_LOG` wins over the configured level
pub fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&settings.level)
            .map_err(|e| Error::Config(format!("Invalid log level '{}': {}", settings.level, e))),
    }
}

/// Initializes global logging.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process when a log directory is configured.
pub fn init_logging(settings: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(settings)?;

    let stdout_layer = if settings.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let (file_layer, guard) = match &settings.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_line_number(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))?;

    tracing::debug!(level = %settings.level, json = settings.json, "Logging initialized");

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let settings = LoggingSettings {
            level: "model_manager=notalevel".to_string(),
            ..Default::default()
        };
        assert!(build_filter(&settings).unwrap_err().is_config());
    }

    #[test]
    fn test_valid_level_builds() {
        let settings = LoggingSettings {
            level: "debug,config=warn".to_string(),
            ..Default::default()
        };
        assert!(build_filter(&settings).is_ok());
    }
}
