//! Engine configuration
//!
//! Defaults, `FLOWHOLD_*` environment overrides and YAML loading.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::EngineError;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Background watcher tick for condition polling and timeouts
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,

    /// Polling period applied when a condition is armed without one
    #[serde(default = "default_condition_check_interval_secs")]
    pub default_condition_check_interval_secs: u64,

    /// Upper bound on one resume predicate check; a check that runs longer
    /// counts as a predicate error
    #[serde(default = "default_predicate_timeout_ms")]
    pub predicate_timeout_ms: u64,

    /// Consecutive predicate errors that fail a paused run
    #[serde(default = "default_max_predicate_failures")]
    pub max_predicate_failures: u32,

    /// Fan-out concurrency used when a step leaves it at zero
    #[serde(default = "default_max_concurrency")]
    pub default_max_concurrency: usize,

    /// Publish `flow_run.*` events on the bus
    #[serde(default = "default_publish_lifecycle_events")]
    pub publish_lifecycle_events: bool,
}

fn default_watch_interval_ms() -> u64 {
    1000
}

fn default_condition_check_interval_secs() -> u64 {
    60
}

fn default_predicate_timeout_ms() -> u64 {
    10_000
}

fn default_max_predicate_failures() -> u32 {
    5
}

fn default_max_concurrency() -> usize {
    10
}

fn default_publish_lifecycle_events() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watch_interval_ms: default_watch_interval_ms(),
            default_condition_check_interval_secs: default_condition_check_interval_secs(),
            predicate_timeout_ms: default_predicate_timeout_ms(),
            max_predicate_failures: default_max_predicate_failures(),
            default_max_concurrency: default_max_concurrency(),
            publish_lifecycle_events: default_publish_lifecycle_events(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults and environment variables
    pub fn load() -> Result<Self, EngineError> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;

        info!(
            watch_interval_ms = config.watch_interval_ms,
            max_predicate_failures = config.max_predicate_failures,
            default_max_concurrency = config.default_max_concurrency,
            "Engine configuration loaded"
        );
        Ok(config)
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self, EngineError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FLOWHOLD_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&lookup, "FLOWHOLD_WATCH_INTERVAL_MS", &mut self.watch_interval_ms);
        override_from(
            &lookup,
            "FLOWHOLD_CONDITION_CHECK_INTERVAL_SECS",
            &mut self.default_condition_check_interval_secs,
        );
        override_from(
            &lookup,
            "FLOWHOLD_PREDICATE_TIMEOUT_MS",
            &mut self.predicate_timeout_ms,
        );
        override_from(
            &lookup,
            "FLOWHOLD_MAX_PREDICATE_FAILURES",
            &mut self.max_predicate_failures,
        );
        override_from(
            &lookup,
            "FLOWHOLD_DEFAULT_MAX_CONCURRENCY",
            &mut self.default_max_concurrency,
        );

        if let Some(publish) = lookup("FLOWHOLD_PUBLISH_LIFECYCLE_EVENTS") {
            match publish.to_lowercase().as_str() {
                "true" | "1" => self.publish_lifecycle_events = true,
                "false" | "0" => self.publish_lifecycle_events = false,
                _ => warn!("Invalid FLOWHOLD_PUBLISH_LIFECYCLE_EVENTS value: {}", publish),
            }
        }
    }

    /// Reject zero intervals, thresholds and concurrency
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.watch_interval_ms == 0 {
            return Err(EngineError::ConfigurationError(
                "watch_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.default_condition_check_interval_secs == 0 {
            return Err(EngineError::ConfigurationError(
                "default_condition_check_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.predicate_timeout_ms == 0 {
            return Err(EngineError::ConfigurationError(
                "predicate_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_predicate_failures == 0 {
            return Err(EngineError::ConfigurationError(
                "max_predicate_failures must be greater than zero".to_string(),
            ));
        }
        if self.default_max_concurrency == 0 {
            return Err(EngineError::ConfigurationError(
                "default_max_concurrency must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Watcher tick as a duration
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    /// Predicate check bound as a duration
    pub fn predicate_timeout(&self) -> Duration {
        Duration::from_millis(self.predicate_timeout_ms)
    }

    /// Default condition polling period as a duration
    pub fn default_condition_check_interval(&self) -> Duration {
        Duration::from_secs(self.default_condition_check_interval_secs)
    }
}

fn override_from<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Invalid {} value: {}", key, raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.watch_interval(), Duration::from_secs(1));
        assert_eq!(config.default_condition_check_interval(), Duration::from_secs(60));
        assert_eq!(config.max_predicate_failures, 5);
        assert_eq!(config.predicate_timeout(), Duration::from_secs(10));
        assert_eq!(config.default_max_concurrency, 10);
        assert!(config.publish_lifecycle_events);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_and_invalid_values() {
        let mut config = EngineConfig::default();
        config.apply_overrides(lookup(&[
            ("FLOWHOLD_WATCH_INTERVAL_MS", "250"),
            ("FLOWHOLD_PREDICATE_TIMEOUT_MS", "1500"),
            ("FLOWHOLD_MAX_PREDICATE_FAILURES", "not-a-number"),
            ("FLOWHOLD_PUBLISH_LIFECYCLE_EVENTS", "false"),
        ]));

        assert_eq!(config.watch_interval_ms, 250);
        assert_eq!(config.predicate_timeout_ms, 1500);
        assert_eq!(config.max_predicate_failures, 5);
        assert!(!config.publish_lifecycle_events);
    }

    #[test]
    fn test_from_yaml_fills_defaults() {
        let config =
            EngineConfig::from_yaml_str("watch_interval_ms: 50\ndefault_max_concurrency: 4\n")
                .unwrap();
        assert_eq!(config.watch_interval_ms, 50);
        assert_eq!(config.default_max_concurrency, 4);
        assert_eq!(config.default_condition_check_interval_secs, 60);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let result = EngineConfig::from_yaml_str("default_max_concurrency: 0\n");
        assert!(matches!(result, Err(EngineError::ConfigurationError(_))));

        let result = EngineConfig::from_yaml_str("watch_interval_ms: [1, 2]\n");
        assert!(matches!(result, Err(EngineError::ConfigurationError(_))));
    }
}
