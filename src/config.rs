//! Engine Configuration
//!
//! Host-facing settings for the engine, the monitor's alert thresholds and
//! the persistence store. Every section has defaults, so a YAML file only
//! needs the values it changes:
//!
//! ```yaml
//! engine:
//!   sender_id: orchestrator
//!   max_parallel: 8
//!   failure_policy: continue
//! monitor:
//!   response_time_secs: 2.5
//! storage:
//!   root: /var/lib/conductor
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::monitoring::AlertThresholds;
use crate::workflow::RetryPolicy;

/// What the sequential bucket does after a step fails permanently.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop dispatching further sequential steps; they stay pending.
    #[default]
    Halt,
    /// Keep dispatching the remaining sequential steps.
    Continue,
}

/// Settings for [`Engine`](crate::execution::Engine).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Sender identity stamped on dispatched messages
    pub sender_id: String,

    /// Upper bound on step dispatches in flight per run
    pub max_parallel: usize,

    pub failure_policy: FailurePolicy,

    /// Capability directory freshness window
    pub capability_ttl_secs: u64,

    /// Policy for template steps that do not declare one
    pub default_retry: RetryPolicy,

    /// Resource sampling period during runs; 0 disables sampling
    pub resource_sample_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sender_id: "workflow_engine".to_string(),
            max_parallel: num_cpus::get().max(4),
            failure_policy: FailurePolicy::default(),
            capability_ttl_secs: 300,
            default_retry: RetryPolicy::default(),
            resource_sample_ms: 0,
        }
    }
}

/// Settings for [`WorkflowStore`](crate::persistence::WorkflowStore).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("workflow_data"),
        }
    }
}

/// Complete configuration document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub monitor: AlertThresholds,
    pub storage: StorageConfig,
}

impl Config {
    /// Loads and validates a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::parse(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses and validates a YAML configuration string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.engine.max_parallel == 0 {
            problems.push("engine.max_parallel must be at least 1".to_string());
        }
        if self.engine.sender_id.trim().is_empty() {
            problems.push("engine.sender_id must not be empty".to_string());
        }
        if !self.engine.default_retry.backoff_factor.is_finite()
            || self.engine.default_retry.backoff_factor < 0.0
        {
            problems.push("engine.default_retry.backoff_factor must be >= 0".to_string());
        }
        problems.extend(self.monitor.problems());

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("\n")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engine.failure_policy, FailurePolicy::Halt);
        assert!(config.engine.max_parallel >= 4);
        assert_eq!(config.engine.capability_ttl_secs, 300);
        assert_eq!(config.monitor.response_time_secs, 1.0);
        assert_eq!(config.storage.root, PathBuf::from("workflow_data"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::parse(
            r#"
engine:
  max_parallel: 2
  failure_policy: continue
monitor:
  cpu_percent: 95
"#,
        )
        .unwrap();

        assert_eq!(config.engine.max_parallel, 2);
        assert_eq!(config.engine.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.engine.sender_id, "workflow_engine");
        assert_eq!(config.monitor.cpu_percent, 95.0);
        assert_eq!(config.monitor.memory_percent, 80.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = Config::parse("engine:\n  max_parallel: 0\n  sender_id: ' '\n");
        match result {
            Err(ConfigError::Invalid(message)) => {
                assert!(message.contains("max_parallel"));
                assert!(message.contains("sender_id"));
            }
            other => panic!("expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "storage:\n  root: /tmp/conductor-test").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/tmp/conductor-test"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/conductor.yaml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
