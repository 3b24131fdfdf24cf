//! Logging setup for the model lifecycle runtime
//!
//! Installs a global `tracing` subscriber with an environment filter
//! (`RUST_LOG` wins over the configured level), a console layer in text or
//! JSON form and an optional daily-rolling file layer.

use anyhow::Result;
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use runtime_config::LoggingConfiguration;

/// File name prefix of rolling log files
const LOG_FILE_PREFIX: &str = "model-lifecycle.log";

/// Keeps the background file writer alive; drop it at shutdown to flush
#[must_use = "dropping the guard stops the file writer"]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Builds the filter from `RUST_LOG`, falling back to the configured level
pub fn build_filter(config: &LoggingConfiguration) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.to_string()))
}

/// Initializes global logging
///
/// Returns an error if a global subscriber is already installed.
pub fn init(config: &LoggingConfiguration) -> Result<LoggingGuard> {
    let console = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let (file_layer, file_guard) = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)?;
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> =
        std::iter::once(console).chain(file_layer).collect();

    tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(config))
        .try_init()?;

    debug!("Logging initialized (json: {}, file: {:?})", config.json, config.directory);

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// Initializes logging for tests; repeated calls are ignored
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::LogLevel;

    #[test]
    fn test_filter_uses_configured_level() {
        let config = LoggingConfiguration {
            level: LogLevel::Debug,
            ..LoggingConfiguration::default()
        };
        if std::env::var("RUST_LOG").is_err() {
            assert_eq!(build_filter(&config).to_string(), "debug");
        }
    }

    #[test]
    fn test_init_for_tests_is_idempotent() {
        init_for_tests();
        init_for_tests();
    }
}
