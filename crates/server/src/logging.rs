//! Tracing subscriber setup for the server binary.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// File name prefix of the rolling log files in `log_dir`.
const LOG_FILE_PREFIX: &str = "tether-server.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `--verbose`, which wins over `log_level`. When
/// `log_dir` is set, logs are also written to a daily rolling file; keep the
/// returned guard alive until exit so buffered lines are flushed.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directive(config, verbose))
            .with_context(|| format!("Invalid log level: {}", config.log_level))?,
    };

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {:?}", dir))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn directive(config: &LoggingConfig, verbose: bool) -> &str {
    if verbose {
        "debug"
    } else {
        &config.log_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_overrides_level() {
        let config = LoggingConfig {
            log_level: "warn".to_string(),
            log_dir: None,
        };
        assert_eq!(directive(&config, true), "debug");
        assert_eq!(directive(&config, false), "warn");
    }

    #[test]
    fn test_configured_level_is_valid_filter() {
        let config = LoggingConfig::default();
        assert!(EnvFilter::try_new(directive(&config, false)).is_ok());
    }
}
