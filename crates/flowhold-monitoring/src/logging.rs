//! Structured logging using tracing.
//!
//! Pretty output for development, JSON for log aggregation, and an optional
//! daily-rotated JSON file.

use anyhow::Context;
use std::path::Path;
use tracing::info;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};

use crate::MonitoringConfig;

/// Filter from `RUST_LOG`, falling back to the configured filter
pub fn env_filter(config: &MonitoringConfig) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.log_filter)
            .with_context(|| format!("Invalid log filter '{}'", config.log_filter)),
    }
}

/// Daily-rotated appender for `log_file`; the file name is the rotation prefix
pub fn file_appender(log_file: &str) -> anyhow::Result<RollingFileAppender> {
    let path = Path::new(log_file);
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("Log file '{}' has no file name", log_file))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .build(directory)
        .with_context(|| format!("Failed to open log file '{}'", log_file))
}

/// Install the global subscriber
pub fn init_logging(config: &MonitoringConfig) -> anyhow::Result<()> {
    let filter = env_filter(config)?;

    let json_layer = config.enable_json_logging.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });
    let pretty_layer = (!config.enable_json_logging).then(|| {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });
    let file_layer = match &config.log_file {
        Some(log_file) => Some(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(file_appender(log_file)?),
        ),
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(pretty_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global default subscriber")?;

    info!(
        service_name = %config.service_name,
        log_format = if config.enable_json_logging { "json" } else { "pretty" },
        log_file = ?config.log_file,
        "Logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_is_reported() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = MonitoringConfig {
            log_filter: "flowhold_core=[".to_string(),
            ..MonitoringConfig::default()
        };
        let err = env_filter(&config).unwrap_err();
        assert!(err.to_string().contains("Invalid log filter"));
    }

    #[test]
    fn test_file_appender_rejects_directory_only_path() {
        assert!(file_appender("..").is_err());
    }
}
