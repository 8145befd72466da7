//! Failure classification and propagation

use super::backoff::RetryPolicy;
use crate::dispatcher::ExecutorError;
use crate::error::{Result, SchedulerError};
use crate::lifecycle::LifecycleManager;
use crate::store::{FailureOutcome, FailureReport, NodeOutput, ScheduleEntry, SqliteStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// A failed attempt, classified
#[derive(Debug, Clone, PartialEq)]
pub enum NodeFailure {
    /// Admission control turned the attempt away
    Rejected { reason: String },

    /// Script or runtime failure
    Failed {
        message: String,
        output: Option<NodeOutput>,
    },

    /// Attempt exceeded the node's timeout
    TimedOut { timeout_seconds: u64 },

    /// Claim holder stopped renewing; presumed dead
    LeaseExpired,
}

impl NodeFailure {
    /// Classify an executor error; timeouts count as logical failures
    pub fn from_executor_error(error: ExecutorError, timeout_seconds: u64) -> Self {
        match error {
            ExecutorError::ResourceRejected { reason } => NodeFailure::Rejected { reason },
            ExecutorError::Timeout(_) => NodeFailure::TimedOut { timeout_seconds },
            ExecutorError::Failed {
                message,
                exit_code,
                stdout,
                stderr,
            } => NodeFailure::Failed {
                message,
                output: Some(NodeOutput {
                    stdout,
                    stderr,
                    exit_status: exit_code,
                    ..Default::default()
                }),
            },
            other => NodeFailure::Failed {
                message: other.to_string(),
                output: None,
            },
        }
    }

    /// The error this failure represents for `node_id`
    pub fn to_error(&self, node_id: &str) -> SchedulerError {
        match self {
            NodeFailure::Rejected { reason } => SchedulerError::TransientResourceRejection {
                node_id: node_id.to_string(),
                reason: reason.clone(),
            },
            NodeFailure::Failed { message, .. } => SchedulerError::NodeExecutionFailure {
                node_id: node_id.to_string(),
                message: message.clone(),
            },
            NodeFailure::TimedOut { timeout_seconds } => SchedulerError::NodeTimeout {
                node_id: node_id.to_string(),
                timeout_seconds: *timeout_seconds,
            },
            NodeFailure::LeaseExpired => SchedulerError::NodeTimeout {
                node_id: node_id.to_string(),
                timeout_seconds: 0,
            },
        }
    }

    fn into_report(self) -> FailureReport {
        match self {
            NodeFailure::Rejected { reason } => FailureReport::rejected(reason),
            NodeFailure::Failed { message, output } => {
                let exit_status = output.as_ref().and_then(|o| o.exit_status);
                let mut report = FailureReport::failed(message);
                if let Some(code) = exit_status {
                    report = report.with_details(serde_json::json!({ "exit_status": code }));
                }
                match output {
                    Some(output) => report.with_output(output),
                    None => report,
                }
            }
            NodeFailure::TimedOut { timeout_seconds } => {
                FailureReport::timed_out(format!("timed out after {}s", timeout_seconds))
            }
            NodeFailure::LeaseExpired => FailureReport::timed_out("claim lease expired"),
        }
    }
}

/// Charges failures to entries and applies the run's failure policy
pub struct RetryController {
    store: Arc<SqliteStore>,
    lifecycle: Arc<LifecycleManager>,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(
        store: Arc<SqliteStore>,
        lifecycle: Arc<LifecycleManager>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            lifecycle,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failure, then propagate it if the entry's budget is spent
    ///
    /// Returns `None` if the entry was no longer held by `worker_id`.
    pub fn handle_failure(
        &self,
        entry: &ScheduleEntry,
        worker_id: Option<&str>,
        failure: NodeFailure,
    ) -> Result<Option<FailureOutcome>> {
        self.handle_failure_at(entry, worker_id, failure, Utc::now())
    }

    pub fn handle_failure_at(
        &self,
        entry: &ScheduleEntry,
        worker_id: Option<&str>,
        failure: NodeFailure,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureOutcome>> {
        let error = failure.to_error(&entry.node_id);
        let report = failure.into_report();
        let Some(outcome) = self
            .store
            .record_failure(entry.id, worker_id, &report, &self.policy, now)?
        else {
            debug!(entry_id = entry.id, node_id = %entry.node_id, "failure discarded; claim no longer held");
            return Ok(None);
        };

        if outcome.is_terminal() {
            warn!(
                execution_id = outcome.execution_id,
                node_id = %outcome.node_id,
                attempts = outcome.retry.attempts,
                error = %error,
                "node failed terminally"
            );
            self.lifecycle
                .on_terminal_failure(outcome.execution_id, &outcome.node_id)?;
            self.lifecycle.finalize(outcome.execution_id)?;
        } else {
            warn!(
                execution_id = outcome.execution_id,
                node_id = %outcome.node_id,
                attempts = outcome.retry.attempts,
                rejections = outcome.retry.transient_attempts,
                next_eligible_at = ?outcome.retry.next_eligible_at,
                error = %error,
                "node re-armed for retry"
            );
        }
        Ok(Some(outcome))
    }

    /// Recover claims whose holder outlived the lease
    pub fn requeue_abandoned(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut recovered = 0;
        for entry in self.store.abandoned_claims(now, self.policy.lease_grace)? {
            warn!(
                entry_id = entry.id,
                node_id = %entry.node_id,
                claimed_by = ?entry.claimed_by,
                "claim lease expired"
            );
            if self
                .handle_failure_at(&entry, None, NodeFailure::LeaseExpired, now)?
                .is_some()
            {
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
