//! Executor trait and request types

use crate::signals::CancellationToken;
use crate::store::{NodeOutput, ScheduleEntry};
use crate::workflow::NodeSnapshot;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Errors an executor can report for one attempt
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Admission control refused the attempt; retried without spending budget
    #[error("resource rejected: {reason}")]
    ResourceRejected { reason: String },

    #[error("execution failed: {message}")]
    Failed {
        message: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("failed to spawn: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl ExecutorError {
    pub fn failed(exit_code: Option<i32>, stdout: String, stderr: String) -> Self {
        let message = match exit_code {
            Some(code) => format!("exit status {}", code),
            None => "terminated without exit status".to_string(),
        };
        let message = match stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => format!("{}: {}", message, line.trim()),
            None => message,
        };
        ExecutorError::Failed {
            message,
            exit_code,
            stdout,
            stderr,
        }
    }
}

/// One attempt of one node, with params already resolved
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub execution_id: i64,
    pub entry_id: i64,
    pub node_id: String,
    pub attempt: u32,
    pub snapshot: NodeSnapshot,
    pub params: BTreeMap<String, serde_json::Value>,
    pub timeout: Duration,
}

impl ExecutionRequest {
    pub fn for_entry(entry: &ScheduleEntry, params: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            execution_id: entry.execution_id,
            entry_id: entry.id,
            node_id: entry.node_id.clone(),
            attempt: entry.attempt,
            snapshot: entry.snapshot.clone(),
            params,
            timeout: Duration::from_secs(entry.timeout_seconds),
        }
    }
}

/// Runs a node's script snapshot
///
/// Implementations should return promptly once `cancel` fires; the
/// dispatcher also enforces `request.timeout` around the call.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<NodeOutput, ExecutorError>;
}
