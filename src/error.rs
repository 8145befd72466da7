//! Error types for the scheduler core

use crate::workflow::{GraphError, ProviderError, SnapshotError};
use thiserror::Error;

/// Errors raised by the schedule store and the components built on it
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Admission control rejected the attempt; retried without touching the logical budget
    #[error("resource rejected node '{node_id}': {reason}")]
    TransientResourceRejection { node_id: String, reason: String },

    /// Script or runtime failure
    #[error("node '{node_id}' failed: {message}")]
    NodeExecutionFailure { node_id: String, message: String },

    /// Execution exceeded the node's timeout
    #[error("node '{node_id}' timed out after {timeout_seconds}s")]
    NodeTimeout {
        node_id: String,
        timeout_seconds: u64,
    },

    /// A guarded dependency decrement matched no row
    #[error(
        "dependency invariant violated in execution {execution_id}: '{dependent}' cannot be decremented for '{predecessor}'"
    )]
    DependencyInvariantViolation {
        execution_id: i64,
        predecessor: String,
        dependent: String,
    },

    /// The persistence layer failed or is unreachable
    #[error("schedule store failure: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("schedule store lock poisoned")]
    StorePoisoned,

    #[error("workflow graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("execution {0} not found")]
    ExecutionNotFound(i64),

    #[error("schedule entry {0} not found")]
    EntryNotFound(i64),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Dispatch for this run stopped after a store failure
    #[error("dispatch halted for execution {0} after a store failure")]
    DispatchHalted(i64),
}

impl SchedulerError {
    /// Whether this error means the store itself can no longer be trusted
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            SchedulerError::Store(_) | SchedulerError::StorePoisoned
        )
    }
}

pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;
