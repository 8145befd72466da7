//! Execution lifecycle management
//!
//! Owns the status of every [`ExecutionRecord`]: starting runs from a
//! workflow graph, run-level retries, cancellation, deadlines and the final
//! COMPLETED/FAILED verdict derived from the node counters.

use crate::config::FlowschedConfig;
use crate::error::{Result, SchedulerError};
use crate::signals::CancellationToken;
use crate::store::{
    CancelOutcome, EntrySpec, ExecutionRecord, ExecutionStatus, FailurePolicy, NewExecution,
    SqliteStore,
};
use crate::workflow::{GraphProvider, ScriptCatalog, WorkflowGraph, snapshot_graph};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Values applied when a workflow leaves them unset
#[derive(Debug, Clone, PartialEq)]
pub struct RunDefaults {
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub failure_policy: FailurePolicy,
    pub run_timeout_seconds: Option<u64>,
    pub max_run_retries: u32,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self::from_config(&FlowschedConfig::default())
    }
}

impl RunDefaults {
    pub fn from_config(config: &FlowschedConfig) -> Self {
        Self {
            max_retries: config.retry.default_max_retries,
            timeout_seconds: config.retry.default_timeout_seconds,
            failure_policy: config.execution.failure_policy,
            run_timeout_seconds: config.execution.run_timeout_seconds,
            max_run_retries: config.execution.max_run_retries,
        }
    }
}

/// Final status implied by a run's counters, if it is done
///
/// Under `skip_dependents` a run whose nodes all reached a terminal state is
/// COMPLETED even if some failed; the failures stay visible in
/// `failed_nodes`. Under `abort_run` any terminal failure means FAILED.
pub fn evaluate(record: &ExecutionRecord) -> Option<(ExecutionStatus, Option<String>)> {
    if record.status.is_terminal() || record.completed_nodes < record.total_nodes {
        return None;
    }

    let failures = (record.failed_nodes > 0)
        .then(|| format!("{} node(s) failed terminally", record.failed_nodes));
    match record.failure_policy {
        FailurePolicy::SkipDependents => Some((ExecutionStatus::Completed, failures)),
        FailurePolicy::AbortRun if record.failed_nodes > 0 => {
            Some((ExecutionStatus::Failed, failures))
        }
        FailurePolicy::AbortRun => Some((ExecutionStatus::Completed, None)),
    }
}

pub struct LifecycleManager {
    store: Arc<SqliteStore>,
    graphs: Arc<dyn GraphProvider>,
    catalog: Arc<dyn ScriptCatalog>,
    defaults: RunDefaults,
    signals: Mutex<HashMap<i64, CancellationToken>>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<SqliteStore>,
        graphs: Arc<dyn GraphProvider>,
        catalog: Arc<dyn ScriptCatalog>,
        defaults: RunDefaults,
    ) -> Self {
        Self {
            store,
            graphs,
            catalog,
            defaults,
            signals: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Start a run of `workflow_id`; nothing is written unless every node resolves
    pub async fn start_execution(
        &self,
        workflow_id: &str,
        trigger_data: serde_json::Value,
    ) -> Result<i64> {
        let graph = self.graphs.get_definition(workflow_id).await?;
        let mut new = NewExecution::new(workflow_id);
        new.trigger_data = trigger_data;
        new.max_retries = graph.max_run_retries.unwrap_or(self.defaults.max_run_retries);
        new.failure_policy = self.defaults.failure_policy;
        new.run_timeout_seconds = graph.run_timeout_seconds.or(self.defaults.run_timeout_seconds);
        self.create_run(&graph, new)
    }

    /// Start a fresh run of a FAILED or TIMEOUT run's workflow
    pub async fn retry_execution(&self, execution_id: i64) -> Result<i64> {
        let parent = self.store.get_execution(execution_id)?;
        if !matches!(
            parent.status,
            ExecutionStatus::Failed | ExecutionStatus::Timeout
        ) {
            return Err(SchedulerError::InvalidTransition(format!(
                "execution {} is {}; only FAILED or TIMEOUT runs can be retried",
                execution_id, parent.status
            )));
        }
        if parent.retry_count >= parent.max_retries {
            return Err(SchedulerError::InvalidTransition(format!(
                "execution {} has used {} of {} run retries",
                execution_id, parent.retry_count, parent.max_retries
            )));
        }

        let graph = self.graphs.get_definition(&parent.workflow_id).await?;
        let new = NewExecution {
            workflow_id: parent.workflow_id.clone(),
            trigger_data: parent.trigger_data.clone(),
            retry_count: parent.retry_count + 1,
            max_retries: parent.max_retries,
            is_retry: true,
            parent_execution_id: Some(parent.id),
            failure_policy: parent.failure_policy,
            run_timeout_seconds: graph.run_timeout_seconds.or(self.defaults.run_timeout_seconds),
        };
        self.create_run(&graph, new)
    }

    fn create_run(&self, graph: &WorkflowGraph, new: NewExecution) -> Result<i64> {
        graph.validate()?;
        let snapshots = snapshot_graph(graph, self.catalog.as_ref())?;

        let specs: Vec<EntrySpec> = graph
            .nodes()
            .iter()
            .zip(snapshots)
            .map(|(node, snapshot)| EntrySpec {
                node_id: node.id.clone(),
                priority: node.priority,
                // A zero budget would make the node never ready
                max_retries: node.max_retries.unwrap_or(self.defaults.max_retries).max(1),
                timeout_seconds: node
                    .timeout_seconds
                    .unwrap_or(self.defaults.timeout_seconds),
                snapshot,
            })
            .collect();
        let edges: Vec<_> = graph.edges().cloned().collect();

        let execution_id = self.store.create_execution(&new, &specs, &edges)?;
        info!(
            execution_id,
            workflow_id = %new.workflow_id,
            nodes = specs.len(),
            is_retry = new.is_retry,
            "execution started"
        );
        Ok(execution_id)
    }

    pub fn get_status(&self, execution_id: i64) -> Result<ExecutionRecord> {
        self.store.get_execution(execution_id)
    }

    /// Cancel a run and signal its in-flight executors
    ///
    /// Returns `None` if the run was already terminal.
    pub fn cancel_execution(&self, execution_id: i64) -> Result<Option<CancelOutcome>> {
        self.terminate(execution_id, ExecutionStatus::Cancelled, "cancelled by request")
    }

    /// Abort a run after a terminal node failure
    pub fn fail_execution(&self, execution_id: i64, reason: &str) -> Result<Option<CancelOutcome>> {
        self.terminate(execution_id, ExecutionStatus::Failed, reason)
    }

    fn terminate(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        reason: &str,
    ) -> Result<Option<CancelOutcome>> {
        let outcome = self.store.terminate_execution(execution_id, status, reason)?;
        if let Some(outcome) = &outcome {
            info!(
                execution_id,
                status = %status,
                cancelled = outcome.cancelled.len(),
                in_flight = outcome.in_flight.len(),
                reason,
                "execution terminated"
            );
        }
        self.fire_signal(execution_id);
        Ok(outcome)
    }

    /// Apply the run's failure policy after `node_id` failed terminally
    pub fn on_terminal_failure(&self, execution_id: i64, node_id: &str) -> Result<()> {
        let record = self.store.get_execution(execution_id)?;
        match record.failure_policy {
            FailurePolicy::SkipDependents => {
                let skipped = self.store.skip_dependents(execution_id, node_id)?;
                if !skipped.is_empty() {
                    info!(execution_id, node_id, skipped = ?skipped, "skipped dependents of failed node");
                }
            }
            FailurePolicy::AbortRun => {
                self.fail_execution(execution_id, &format!("node '{}' failed", node_id))?;
            }
        }
        Ok(())
    }

    /// Move a finished run to its final status
    pub fn finalize(&self, execution_id: i64) -> Result<Option<ExecutionStatus>> {
        let record = self.store.get_execution(execution_id)?;
        let Some((status, message)) = evaluate(&record) else {
            return Ok(None);
        };

        if !self
            .store
            .finish_execution(execution_id, status, message.as_deref())?
        {
            return Ok(None);
        }

        if record.failed_nodes > 0 {
            warn!(execution_id, status = %status, failed_nodes = record.failed_nodes, "execution finished with failures");
        } else {
            info!(execution_id, status = %status, "execution finished");
        }
        self.release_signal(execution_id);
        Ok(Some(status))
    }

    /// Time out every run past its deadline
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let mut expired = Vec::new();
        for execution_id in self.store.overdue_executions(now)? {
            if self
                .terminate(execution_id, ExecutionStatus::Timeout, "run deadline exceeded")?
                .is_some()
            {
                expired.push(execution_id);
            }
        }
        Ok(expired)
    }

    /// Token fired when this run is cancelled, failed or timed out
    pub fn signal_for(&self, execution_id: i64) -> CancellationToken {
        match self.signals.lock() {
            Ok(mut signals) => signals.entry(execution_id).or_default().clone(),
            // Treat a poisoned registry as a cancelled run
            Err(_) => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    /// Fire local signals for runs another process has terminated
    pub fn sync_signals(&self, execution_ids: &[i64]) -> Result<Vec<i64>> {
        let terminal = self.store.terminal_statuses(execution_ids)?;
        let mut fired = Vec::new();
        for (execution_id, status) in terminal {
            if matches!(
                status,
                ExecutionStatus::Cancelled | ExecutionStatus::Failed | ExecutionStatus::Timeout
            ) {
                self.fire_signal(execution_id);
                fired.push(execution_id);
            } else {
                self.release_signal(execution_id);
            }
        }
        fired.sort_unstable();
        Ok(fired)
    }

    fn fire_signal(&self, execution_id: i64) {
        if let Ok(mut signals) = self.signals.lock() {
            if let Some(token) = signals.remove(&execution_id) {
                token.cancel();
            }
        }
    }

    fn release_signal(&self, execution_id: i64) {
        if let Ok(mut signals) = self.signals.lock() {
            signals.remove(&execution_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::store::{EntryState, FailureReport, NodeOutput, ResultStatus};
    use crate::workflow::{
        Edge, MemoryGraphProvider, MemoryScriptCatalog, NodeDefinition, ScriptReference,
    };

    fn node(id: &str) -> NodeDefinition {
        NodeDefinition::new(id, ScriptReference::Global("noop".into()))
    }

    fn manager_with(graph: WorkflowGraph, defaults: RunDefaults) -> LifecycleManager {
        let graphs = MemoryGraphProvider::new();
        graphs.insert(graph);
        LifecycleManager::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(graphs),
            Arc::new(MemoryScriptCatalog::new().with_script("noop", "true")),
            defaults,
        )
    }

    fn chain() -> WorkflowGraph {
        WorkflowGraph::new(
            "chain",
            vec![node("a"), node("b"), node("c")],
            vec![Edge::new("a", "b"), Edge::new("b", "c")],
        )
    }

    fn succeed(manager: &LifecycleManager, execution_id: i64, node_id: &str) {
        let store = manager.store();
        let entry = store.find_entry(execution_id, node_id).unwrap().unwrap();
        assert!(store.claim(entry.id, "w").unwrap());
        store
            .complete_success(entry.id, "w", &NodeOutput::default())
            .unwrap()
            .unwrap();
        manager.finalize(execution_id).unwrap();
    }

    fn fail_terminally(manager: &LifecycleManager, execution_id: i64, node_id: &str) {
        let store = manager.store();
        let entry = store.find_entry(execution_id, node_id).unwrap().unwrap();
        assert!(store.claim(entry.id, "w").unwrap());
        let outcome = store
            .record_failure(entry.id, Some("w"), &FailureReport::failed("boom"), &RetryPolicy::immediate(), Utc::now())
            .unwrap()
            .unwrap();
        assert!(outcome.is_terminal());
        manager.on_terminal_failure(execution_id, node_id).unwrap();
        manager.finalize(execution_id).unwrap();
    }

    #[tokio::test]
    async fn test_start_and_complete() {
        let manager = manager_with(chain(), RunDefaults::default());
        let id = manager
            .start_execution("chain", serde_json::json!({"k": "v"}))
            .await
            .unwrap();

        let record = manager.get_status(id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert_eq!(record.total_nodes, 3);
        assert_eq!(record.trigger_data["k"], "v");

        for n in ["a", "b", "c"] {
            assert!(!manager.get_status(id).unwrap().status.is_terminal());
            succeed(&manager, id, n);
        }
        let record = manager.get_status(id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.completed_nodes, 3);
        assert!(record.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_unresolved_script_creates_nothing() {
        let graph = WorkflowGraph::new(
            "broken",
            vec![node("a"), NodeDefinition::new("b", ScriptReference::Global("missing".into()))],
            vec![],
        );
        let manager = manager_with(graph, RunDefaults::default());

        let result = manager.start_execution("broken", serde_json::Value::Null).await;
        assert!(matches!(result, Err(SchedulerError::Snapshot(_))));
        assert!(manager.store().list_executions(10).unwrap().is_empty());

        let missing = manager.start_execution("absent", serde_json::Value::Null).await;
        assert!(matches!(missing, Err(SchedulerError::Provider(_))));
    }

    #[tokio::test]
    async fn test_skip_policy_completes_with_failures() {
        let graph = WorkflowGraph::new(
            "fanout",
            vec![node("a"), node("b"), node("other")],
            vec![Edge::new("a", "b")],
        );
        let manager = manager_with(graph, RunDefaults::default());
        let id = manager.start_execution("fanout", serde_json::Value::Null).await.unwrap();

        fail_terminally(&manager, id, "a");
        let b = manager.store().find_entry(id, "b").unwrap().unwrap();
        assert_eq!(b.state, EntryState::Skipped);
        assert_eq!(manager.get_status(id).unwrap().status, ExecutionStatus::Running);

        succeed(&manager, id, "other");
        let record = manager.get_status(id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(record.failed_nodes, 1);
        assert!(record.error_message.unwrap().contains("1 node(s) failed"));
    }

    #[tokio::test]
    async fn test_abort_policy_fails_run() {
        let defaults = RunDefaults {
            failure_policy: FailurePolicy::AbortRun,
            ..RunDefaults::default()
        };
        let graph = WorkflowGraph::new("pair", vec![node("a"), node("b")], vec![]);
        let manager = manager_with(graph, defaults);
        let id = manager.start_execution("pair", serde_json::Value::Null).await.unwrap();

        let b = manager.store().find_entry(id, "b").unwrap().unwrap();
        assert!(manager.store().claim(b.id, "w").unwrap());
        let signal = manager.signal_for(id);

        fail_terminally(&manager, id, "a");
        let record = manager.get_status(id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(signal.is_cancelled());
        assert_eq!(
            manager.store().get_result(id, "b").unwrap().unwrap().status,
            ResultStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_fires_signal_once() {
        let manager = manager_with(chain(), RunDefaults::default());
        let id = manager.start_execution("chain", serde_json::Value::Null).await.unwrap();
        let signal = manager.signal_for(id);

        let outcome = manager.cancel_execution(id).unwrap().unwrap();
        assert_eq!(outcome.cancelled.len(), 3);
        assert!(signal.is_cancelled());
        assert_eq!(manager.get_status(id).unwrap().status, ExecutionStatus::Cancelled);

        assert!(manager.cancel_execution(id).unwrap().is_none());
        assert_eq!(manager.get_status(id).unwrap().status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_deadline_expiry() {
        let mut graph = chain();
        graph.run_timeout_seconds = Some(5);
        let manager = manager_with(graph, RunDefaults::default());
        let id = manager.start_execution("chain", serde_json::Value::Null).await.unwrap();

        assert!(manager.expire_overdue(Utc::now()).unwrap().is_empty());
        let later = Utc::now() + chrono::Duration::seconds(6);
        assert_eq!(manager.expire_overdue(later).unwrap(), vec![id]);
        assert_eq!(manager.get_status(id).unwrap().status, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn test_retry_execution() {
        let mut graph = chain();
        graph.run_timeout_seconds = Some(1);
        graph.max_run_retries = Some(1);
        let manager = manager_with(graph, RunDefaults::default());
        let id = manager
            .start_execution("chain", serde_json::json!({"n": 1}))
            .await
            .unwrap();

        // Not retryable while running
        assert!(matches!(
            manager.retry_execution(id).await,
            Err(SchedulerError::InvalidTransition(_))
        ));

        manager
            .expire_overdue(Utc::now() + chrono::Duration::seconds(2))
            .unwrap();
        let retry_id = manager.retry_execution(id).await.unwrap();
        let retry = manager.get_status(retry_id).unwrap();
        assert!(retry.is_retry);
        assert_eq!(retry.parent_execution_id, Some(id));
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.trigger_data["n"], 1);
        assert_eq!(retry.status, ExecutionStatus::Pending);

        manager
            .expire_overdue(Utc::now() + chrono::Duration::seconds(2))
            .unwrap();
        // Budget of one run retry is used up
        assert!(matches!(
            manager.retry_execution(retry_id).await,
            Err(SchedulerError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_signals_from_other_process() {
        let manager = manager_with(chain(), RunDefaults::default());
        let id = manager.start_execution("chain", serde_json::Value::Null).await.unwrap();
        let signal = manager.signal_for(id);

        // Another process cancels through the shared store
        manager
            .store()
            .terminate_execution(id, ExecutionStatus::Cancelled, "remote")
            .unwrap();
        assert!(!signal.is_cancelled());

        assert_eq!(manager.sync_signals(&[id]).unwrap(), vec![id]);
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_evaluate() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = crate::store::fixtures::seed(&store, &["a"], &[]);
        let mut record = store.get_execution(id).unwrap();
        assert_eq!(evaluate(&record), None);

        record.pending_nodes = 0;
        record.completed_nodes = 1;
        assert_eq!(evaluate(&record), Some((ExecutionStatus::Completed, None)));

        record.failed_nodes = 1;
        record.failure_policy = FailurePolicy::AbortRun;
        assert!(matches!(evaluate(&record), Some((ExecutionStatus::Failed, Some(_)))));

        record.status = ExecutionStatus::Cancelled;
        assert_eq!(evaluate(&record), None);
    }

    #[test]
    fn test_zero_retry_budget_is_clamped() {
        let graph = WorkflowGraph::new("one", vec![node("a")], vec![]);
        let defaults = RunDefaults {
            max_retries: 0,
            ..RunDefaults::default()
        };
        let manager = manager_with(graph.clone(), defaults);
        let id = manager.create_run(&graph, NewExecution::new("one")).unwrap();
        let entry = manager.store().find_entry(id, "a").unwrap().unwrap();
        assert_eq!(entry.retry.max_attempts, 1);
        assert_eq!(entry.state, EntryState::Ready);
    }
}
