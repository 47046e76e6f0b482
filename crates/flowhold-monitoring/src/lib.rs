//! Monitoring for flowhold: logging setup and run lifecycle observation.

use serde::{Deserialize, Serialize};
use tracing::info;

pub mod lifecycle;
pub mod logging;

pub use lifecycle::{LifecycleRecorder, LifecycleSummary};
pub use logging::init_logging;

/// Configuration for initializing monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log level filter (e.g., "info,flowhold_core=debug"); `RUST_LOG` wins
    pub log_filter: String,
    /// JSON output on stdout instead of the pretty format
    pub enable_json_logging: bool,
    /// Daily-rotated JSON log file, if any
    pub log_file: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "flowhold".to_string(),
            log_filter: "info".to_string(),
            enable_json_logging: false,
            log_file: None,
        }
    }
}

/// Initialize the monitoring system
pub fn init(config: &MonitoringConfig) -> anyhow::Result<()> {
    logging::init_logging(config)?;
    info!(service_name = %config.service_name, "Monitoring initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MonitoringConfig::default();
        assert_eq!(config.service_name, "flowhold");
        assert_eq!(config.log_filter, "info");
        assert!(!config.enable_json_logging);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_config_partial_json() {
        let raw = r#"{"enable_json_logging": true, "log_file": "logs/flowhold.log"}"#;
        let config: MonitoringConfig = serde_json::from_str(raw).unwrap();
        assert!(config.enable_json_logging);
        assert_eq!(config.log_file.as_deref(), Some("logs/flowhold.log"));
        assert_eq!(config.service_name, "flowhold");
    }
}
