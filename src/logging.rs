//! Tracing subscriber setup.

use crate::config::LoggingConfig;
use crate::relay_paths;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding a filter directive, e.g. `printf_relay=debug`.
pub const LOG_ENV: &str = "PRINTF_RELAY_LOG";

/// Builds the filter: `PRINTF_RELAY_LOG` wins over the configured level.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_env(LOG_ENV) {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("Invalid log level: {}", config.level)),
    }
}

/// Installs the global subscriber. Logs go to stderr so command output on
/// stdout stays clean, and optionally to `~/.printf-relay/logs/relay.log`.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;

    let writer = if config.to_file {
        let path = relay_paths::log_path()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        BoxMakeWriter::new(std::io::stderr.and(Mutex::new(file)))
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(writer);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}

/// Logs the startup banner with build info.
pub fn log_startup(component: &str) {
    tracing::info!(
        component,
        version = env!("CARGO_PKG_VERSION"),
        git_sha = crate::BUILD_SHA,
        "starting"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_filter_falls_back_to_config_level() {
        std::env::remove_var(LOG_ENV);
        let config = LoggingConfig {
            level: "debug".to_string(),
            ..LoggingConfig::default()
        };
        assert!(build_filter(&config).is_ok());
    }

    #[test]
    #[serial_test::serial]
    fn test_invalid_level_rejected() {
        std::env::remove_var(LOG_ENV);
        let config = LoggingConfig {
            level: "not a [level".to_string(),
            ..LoggingConfig::default()
        };
        assert!(build_filter(&config).is_err());
    }
}
