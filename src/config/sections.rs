//! Individual configuration sections

use crate::store::{FailurePolicy, TieBreak};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// `[database]`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database file; `~` and `$VARS` are expanded
    pub path: Option<String>,

    /// How long a writer waits for the SQLite lock
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    /// Resolved database path, defaulting to the user data directory
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => expand_path(path),
            None => dirs::data_dir()
                .map(|dir| dir.join("flowsched").join("flowsched.db"))
                .unwrap_or_else(|| PathBuf::from(".flowsched/flowsched.db")),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// `[scheduler]`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Most entries fetched per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sleep between ticks when nothing was claimed
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub tie_break: TieBreak,

    /// Claim owner name; defaults to `<hostname>-<pid>`
    pub worker_id: Option<String>,
}

fn default_batch_size() -> usize {
    16
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            tie_break: TieBreak::default(),
            worker_id: None,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn resolved_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "flowsched".to_string());
        format!("{}-{}", host, std::process::id())
    }
}

/// `[workers]`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Concurrent executor calls per process
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long in-flight work may drain on shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_pool_size() -> usize {
    4
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl WorkersConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// `[retry]`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Logical attempts per node when the workflow does not say
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,

    #[serde(default)]
    pub logical_retry_delay_ms: u64,

    #[serde(default = "default_resource_initial_delay_ms")]
    pub resource_initial_delay_ms: u64,

    #[serde(default = "default_resource_max_delay_ms")]
    pub resource_max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub resource_backoff_multiplier: f64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Added to a node's timeout before its claim counts as abandoned
    #[serde(default = "default_claim_lease_grace_seconds")]
    pub claim_lease_grace_seconds: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_resource_initial_delay_ms() -> u64 {
    1000
}

fn default_resource_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_claim_lease_grace_seconds() -> u64 {
    30
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: default_max_retries(),
            default_timeout_seconds: default_timeout_seconds(),
            logical_retry_delay_ms: 0,
            resource_initial_delay_ms: default_resource_initial_delay_ms(),
            resource_max_delay_ms: default_resource_max_delay_ms(),
            resource_backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
            claim_lease_grace_seconds: default_claim_lease_grace_seconds(),
        }
    }
}

/// `[execution]`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Wall-clock budget for a run when the workflow does not set one
    pub run_timeout_seconds: Option<u64>,

    /// Run-level retries when the workflow does not set them
    #[serde(default)]
    pub max_run_retries: u32,
}

/// `[paths]`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    /// Directory of `<workflow>.toml` definitions
    pub workflows_dir: Option<String>,

    /// Directory of `<script>.sh` global scripts
    pub scripts_dir: Option<String>,
}

impl PathsConfig {
    pub fn resolved_workflows_dir(&self) -> PathBuf {
        self.workflows_dir
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| PathBuf::from(".flowsched/workflows"))
    }

    pub fn resolved_scripts_dir(&self) -> PathBuf {
        self.scripts_dir
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| PathBuf::from(".flowsched/scripts"))
    }
}

/// Expand `~` and environment variables, keeping the raw text on failure
fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}
