//! Persisted records and the values passed in and out of the store

use crate::retry::{RetryKind, RetryState};
use crate::workflow::NodeSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
            ExecutionStatus::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "CANCELLED" => Some(Self::Cancelled),
            "TIMEOUT" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling state of one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Predecessors outstanding
    Waiting,
    Ready,
    Claimed,
    Running,
    Succeeded,
    FailedTerminal,
    Cancelled,
    /// Dependent of a terminally failed node
    Skipped,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Waiting => "waiting",
            EntryState::Ready => "ready",
            EntryState::Claimed => "claimed",
            EntryState::Running => "running",
            EntryState::Succeeded => "succeeded",
            EntryState::FailedTerminal => "failed_terminal",
            EntryState::Cancelled => "cancelled",
            EntryState::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(Self::Waiting),
            "ready" => Some(Self::Ready),
            "claimed" => Some(Self::Claimed),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed_terminal" => Some(Self::FailedTerminal),
            "cancelled" => Some(Self::Cancelled),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryState::Succeeded
                | EntryState::FailedTerminal
                | EntryState::Cancelled
                | EntryState::Skipped
        )
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded for the latest attempt of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Timeout,
    Cancelled,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pending => "PENDING",
            ResultStatus::Running => "RUNNING",
            ResultStatus::Success => "SUCCESS",
            ResultStatus::Failed => "FAILED",
            ResultStatus::Skipped => "SKIPPED",
            ResultStatus::Timeout => "TIMEOUT",
            ResultStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "SKIPPED" => Some(Self::Skipped),
            "TIMEOUT" => Some(Self::Timeout),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to a run when one of its nodes fails terminally
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip the failed node's transitive dependents, keep running the rest
    #[default]
    SkipDependents,
    /// Fail the whole run and cancel everything still in flight
    AbortRun,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::SkipDependents => "skip_dependents",
            FailurePolicy::AbortRun => "abort_run",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "skip_dependents" => Some(Self::SkipDependents),
            "abort_run" => Some(Self::AbortRun),
            _ => None,
        }
    }
}

/// Secondary ordering of ready entries with equal priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Entries rejected less often go first
    #[default]
    FewestRejections,
    /// Entries rejected more often go first
    MostRejections,
}

impl TieBreak {
    pub(crate) fn wait_factor_order(&self) -> &'static str {
        match self {
            TieBreak::FewestRejections => "ASC",
            TieBreak::MostRejections => "DESC",
        }
    }
}

/// One workflow run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub trigger_data: serde_json::Value,
    pub total_nodes: u32,
    pub pending_nodes: u32,
    pub running_nodes: u32,
    pub completed_nodes: u32,
    /// Completed nodes that ended in FAILED_TERMINAL
    pub failed_nodes: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub is_retry: bool,
    pub parent_execution_id: Option<i64>,
    pub failure_policy: FailurePolicy,
    pub deadline_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One node of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub id: i64,
    pub execution_id: i64,
    pub node_id: String,
    pub state: EntryState,
    pub dependency_count: u32,
    pub priority: u32,
    pub timeout_seconds: u64,
    pub retry: RetryState,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Number of claims so far
    pub attempt: u32,
    pub snapshot: NodeSnapshot,
    pub created_at: DateTime<Utc>,
}

impl ScheduleEntry {
    /// Ready exactly when no predecessor is outstanding and budget remains
    pub fn is_ready(&self) -> bool {
        self.dependency_count == 0 && !self.retry.is_exhausted() && !self.state.is_terminal()
    }
}

/// Resource usage reported by an executor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub duration_ms: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub peak_memory_kb: Option<u64>,
}

/// Latest outcome of one node of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultEntry {
    pub id: i64,
    pub execution_id: i64,
    pub node_id: String,
    pub status: ResultStatus,
    pub result_data: Option<serde_json::Value>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub usage: ResourceUsage,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub retry_count: u32,
    pub attempt: u32,
}

/// What an executor produced for one attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    pub result_data: Option<serde_json::Value>,
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<i32>,
    pub usage: ResourceUsage,
}

/// Parameters of a run about to be created
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: String,
    pub trigger_data: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub is_retry: bool,
    pub parent_execution_id: Option<i64>,
    pub failure_policy: FailurePolicy,
    pub run_timeout_seconds: Option<u64>,
}

impl NewExecution {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            trigger_data: serde_json::Value::Null,
            retry_count: 0,
            max_retries: 0,
            is_retry: false,
            parent_execution_id: None,
            failure_policy: FailurePolicy::default(),
            run_timeout_seconds: None,
        }
    }
}

/// One entry to create
#[derive(Debug, Clone)]
pub struct EntrySpec {
    pub node_id: String,
    pub priority: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub snapshot: NodeSnapshot,
}

/// Effect of a successful completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub execution_id: i64,
    pub node_id: String,
    /// Decrements applied to dependents
    pub decremented: usize,
    /// Dependents that reached zero and became READY
    pub newly_ready: Vec<String>,
}

/// A failed attempt as reported to the store
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub kind: RetryKind,
    pub timed_out: bool,
    pub reason: String,
    pub output: Option<NodeOutput>,
    pub details: Option<serde_json::Value>,
}

impl FailureReport {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            kind: RetryKind::Transient,
            timed_out: false,
            reason: reason.into(),
            output: None,
            details: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            kind: RetryKind::Logical,
            timed_out: false,
            reason: reason.into(),
            output: None,
            details: None,
        }
    }

    pub fn timed_out(reason: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::failed(reason)
        }
    }

    pub fn with_output(mut self, output: NodeOutput) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Result status written for this attempt
    pub fn result_status(&self) -> ResultStatus {
        match (self.kind, self.timed_out) {
            (RetryKind::Transient, _) => ResultStatus::Pending,
            (RetryKind::Logical, true) => ResultStatus::Timeout,
            (RetryKind::Logical, false) => ResultStatus::Failed,
        }
    }
}

/// Effect of a recorded failure
#[derive(Debug, Clone, PartialEq)]
pub struct FailureOutcome {
    pub entry_id: i64,
    pub execution_id: i64,
    pub node_id: String,
    pub state: EntryState,
    pub retry: RetryState,
}

impl FailureOutcome {
    pub fn is_terminal(&self) -> bool {
        self.state == EntryState::FailedTerminal
    }
}

/// Effect of force-terminating a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub execution_id: i64,
    pub status: ExecutionStatus,
    /// Every node moved to CANCELLED
    pub cancelled: Vec<String>,
    /// Subset that was CLAIMED or RUNNING
    pub in_flight: Vec<String>,
}
