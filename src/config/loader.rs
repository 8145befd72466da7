//! Configuration loading with multi-layer merge

use super::error::ConfigError;
use super::sections::{
    DatabaseConfig, ExecutionConfig, PathsConfig, RetryConfig, SchedulerConfig, WorkersConfig,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Longest configurable retry delay (30 days)
pub const MAX_RETRY_DELAY_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Top-level flowsched configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FlowschedConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    /// Exposed to parameter templates as `vars`
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

impl FlowschedConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/flowsched/config.toml
    /// 3. .flowsched/config.toml (project)
    /// 4. `explicit`, if given (must exist)
    pub fn load(project_dir: Option<&Path>, explicit: Option<&Path>) -> Result<Self> {
        let mut layers = Vec::new();

        if let Some(user_config_path) = Self::user_config_path() {
            if user_config_path.exists() {
                layers.push(user_config_path);
            }
        }

        let project_config_path = project_dir
            .map(|p| p.join(".flowsched/config.toml"))
            .unwrap_or_else(|| PathBuf::from(".flowsched/config.toml"));
        if project_config_path.exists() {
            layers.push(project_config_path);
        }

        if let Some(path) = explicit {
            if !path.exists() {
                anyhow::bail!("config file {} does not exist", path.display());
            }
            layers.push(path.to_path_buf());
        }

        let mut merged = toml::Value::Table(toml::map::Map::new());
        for path in &layers {
            let layer = Self::load_value(path)?;
            merge_values(&mut merged, layer);
        }

        let config: Self = merged
            .try_into()
            .context("merging configuration layers")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_file(path: &Path) -> Result<Self> {
        let value = Self::load_value(path)?;
        let config: Self = value
            .try_into()
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read one layer, checking it against the schema on its own
    fn load_value(path: &Path) -> Result<toml::Value> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let value: toml::Value =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        value
            .clone()
            .try_into::<Self>()
            .with_context(|| format!("loading {}", path.display()))?;
        Ok(value)
    }

    /// Get the user config path (~/.config/flowsched/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("flowsched/config.toml"))
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::invalid("scheduler", "batch_size", "at least 1"));
        }
        if self.workers.pool_size == 0 {
            return Err(ConfigError::invalid("workers", "pool_size", "at least 1"));
        }
        if self.retry.default_max_retries == 0 {
            return Err(ConfigError::invalid(
                "retry",
                "default_max_retries",
                "at least 1",
            ));
        }
        if self.retry.default_timeout_seconds == 0 {
            return Err(ConfigError::invalid(
                "retry",
                "default_timeout_seconds",
                "at least 1",
            ));
        }
        if !(self.retry.resource_backoff_multiplier >= 1.0) {
            return Err(ConfigError::invalid(
                "retry",
                "resource_backoff_multiplier",
                "at least 1.0",
            ));
        }
        for (field, value) in [
            ("resource_initial_delay_ms", self.retry.resource_initial_delay_ms),
            ("resource_max_delay_ms", self.retry.resource_max_delay_ms),
            ("logical_retry_delay_ms", self.retry.logical_retry_delay_ms),
        ] {
            if value > MAX_RETRY_DELAY_MS {
                return Err(ConfigError::invalid("retry", field, "at most 30 days"));
            }
        }
        if self.retry.resource_max_delay_ms < self.retry.resource_initial_delay_ms {
            return Err(ConfigError::invalid(
                "retry",
                "resource_max_delay_ms",
                "no smaller than resource_initial_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Merge `other` into `base` (other takes precedence, tables merge recursively)
fn merge_values(base: &mut toml::Value, other: toml::Value) {
    match (base, other) {
        (toml::Value::Table(base), toml::Value::Table(other)) => {
            for (key, value) in other {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, other) => *base = other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FailurePolicy, TieBreak};
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_load_empty_config() {
        let config = FlowschedConfig::default();
        assert_eq!(config.scheduler.batch_size, 16);
        assert_eq!(config.execution.failure_policy, FailurePolicy::SkipDependents);
        assert!(config.variables.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_file() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
            [scheduler]
            batch_size = 4
            tie_break = "most_rejections"

            [execution]
            failure_policy = "abort_run"
            run_timeout_seconds = 600

            [variables]
            region = "eu-west-1"
        "#
        )
        .unwrap();

        let config = FlowschedConfig::load_file(&config_path).unwrap();
        assert_eq!(config.scheduler.batch_size, 4);
        assert_eq!(config.scheduler.tie_break, TieBreak::MostRejections);
        assert_eq!(config.execution.failure_policy, FailurePolicy::AbortRun);
        assert_eq!(config.execution.run_timeout_seconds, Some(600));
        assert_eq!(config.variables["region"], "eu-west-1");
        // Untouched sections keep their defaults
        assert_eq!(config.workers.pool_size, 4);
    }

    #[test]
    fn test_reject_oversized_delays() {
        let mut config = FlowschedConfig::default();
        config.retry.logical_retry_delay_ms = MAX_RETRY_DELAY_MS;
        config.retry.resource_max_delay_ms = MAX_RETRY_DELAY_MS;
        assert!(config.validate().is_ok());

        config.retry.resource_max_delay_ms = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = FlowschedConfig::default();
        config.retry.logical_retry_delay_ms = MAX_RETRY_DELAY_MS + 1;
        assert!(config.validate().is_err());

        let mut config = FlowschedConfig::default();
        config.retry.resource_initial_delay_ms = 5_000;
        config.retry.resource_max_delay_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_file_validates() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, "[scheduler]\nbatch_size = 0\n").unwrap();

        let err = FlowschedConfig::load_file(&config_path).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_reject_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(&config_path, "[workers]\nthreads = 8\n").unwrap();
        assert!(FlowschedConfig::load_file(&config_path).is_err());
    }

    #[test]
    fn test_layers_merge() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".flowsched")).unwrap();
        std::fs::write(
            dir.path().join(".flowsched/config.toml"),
            r#"
            [workers]
            pool_size = 2
            shutdown_grace_ms = 1000

            [retry]
            jitter = false
            "#,
        )
        .unwrap();

        let explicit = dir.path().join("override.toml");
        std::fs::write(&explicit, "[workers]\npool_size = 12\n").unwrap();

        let config = FlowschedConfig::load(Some(dir.path()), Some(&explicit)).unwrap();
        // Explicit file wins for the key it sets
        assert_eq!(config.workers.pool_size, 12);
        // Project layer survives where it is not overridden
        assert_eq!(config.workers.shutdown_grace_ms, 1000);
        assert!(!config.retry.jitter);
    }

    #[test]
    fn test_missing_explicit_file() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(FlowschedConfig::load(Some(dir.path()), Some(&missing)).is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = FlowschedConfig::default();
        config.workers.pool_size = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::invalid("workers", "pool_size", "at least 1"))
        );

        let mut config = FlowschedConfig::default();
        config.retry.resource_max_delay_ms = 10;
        assert!(config.validate().is_err());
    }
}
