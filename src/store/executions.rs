//! Execution record transitions

use super::entries::insert_entries;
use super::models::{CancelOutcome, EntrySpec, ExecutionStatus, NewExecution, ResultStatus};
use super::sqlite::{SqliteStore, load_execution, to_ms};
use crate::error::{Result, SchedulerError};
use crate::workflow::Edge;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use std::collections::HashMap;

impl SqliteStore {
    /// Create a run and all of its entries in one transaction
    pub fn create_execution(
        &self,
        new: &NewExecution,
        specs: &[EntrySpec],
        edges: &[Edge],
    ) -> Result<i64> {
        let now = Utc::now();
        let now_ms = to_ms(now);
        let deadline_ms = new
            .run_timeout_seconds
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| now_ms.saturating_add(secs.saturating_mul(1000)));

        self.write(|tx| {
            tx.execute(
                "INSERT INTO executions
                    (workflow_id, status, trigger_data, retry_count, max_retries, is_retry,
                     parent_execution_id, failure_policy, deadline_at_ms, created_at_ms)
                 VALUES (?1, 'PENDING', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new.workflow_id,
                    new.trigger_data.to_string(),
                    new.retry_count,
                    new.max_retries,
                    new.is_retry,
                    new.parent_execution_id,
                    new.failure_policy.as_str(),
                    deadline_ms,
                    now_ms,
                ],
            )?;
            let execution_id = tx.last_insert_rowid();
            insert_entries(tx, execution_id, specs, edges, now)?;
            Ok(execution_id)
        })
    }

    /// Force a run into a terminal status, cancelling every unfinished entry
    ///
    /// Returns `None` if the run was already terminal.
    pub fn terminate_execution(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        reason: &str,
    ) -> Result<Option<CancelOutcome>> {
        if !status.is_terminal() {
            return Err(SchedulerError::InvalidTransition(format!(
                "cannot terminate execution {} as {}",
                execution_id, status
            )));
        }

        let now_ms = to_ms(Utc::now());
        self.write(|tx| {
            let updated = tx.execute(
                "UPDATE executions SET status = ?2, ended_at_ms = ?3, error_message = ?4
                 WHERE id = ?1 AND status IN ('PENDING', 'RUNNING')",
                params![execution_id, status.as_str(), now_ms, reason],
            )?;
            if updated == 0 {
                if load_execution(tx, execution_id)?.is_none() {
                    return Err(SchedulerError::ExecutionNotFound(execution_id));
                }
                return Ok(None);
            }

            let unfinished: Vec<(String, String)> = tx
                .prepare(
                    "SELECT node_id, state FROM schedule_entries
                     WHERE execution_id = ?1 AND state IN ('waiting', 'ready', 'claimed', 'running')
                     ORDER BY id",
                )?
                .query_map([execution_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;

            tx.execute(
                "UPDATE schedule_entries
                 SET state = 'cancelled', claimed_by = NULL, updated_at_ms = ?2
                 WHERE execution_id = ?1 AND state IN ('waiting', 'ready', 'claimed', 'running')",
                params![execution_id, now_ms],
            )?;

            for (node_id, _) in &unfinished {
                super::entries::write_result(
                    tx,
                    execution_id,
                    node_id,
                    ResultStatus::Cancelled,
                    None,
                    Some(reason),
                    None,
                    now_ms,
                )?;
            }

            tx.execute(
                "UPDATE executions
                 SET completed_nodes = completed_nodes + pending_nodes + running_nodes,
                     pending_nodes = 0,
                     running_nodes = 0
                 WHERE id = ?1",
                [execution_id],
            )?;

            let in_flight = unfinished
                .iter()
                .filter(|(_, state)| state == "claimed" || state == "running")
                .map(|(node, _)| node.clone())
                .collect();

            Ok(Some(CancelOutcome {
                execution_id,
                status,
                cancelled: unfinished.into_iter().map(|(node, _)| node).collect(),
                in_flight,
            }))
        })
    }

    /// Move a run to a terminal status once all of its entries are done
    ///
    /// Returns `false` if the run was already terminal or still has
    /// unfinished entries.
    pub fn finish_execution(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(SchedulerError::InvalidTransition(format!(
                "cannot finish execution {} as {}",
                execution_id, status
            )));
        }

        let now_ms = to_ms(Utc::now());
        self.write(|tx| {
            let updated = tx.execute(
                "UPDATE executions SET status = ?2, ended_at_ms = ?3, error_message = ?4
                 WHERE id = ?1 AND status IN ('PENDING', 'RUNNING')
                   AND completed_nodes = total_nodes",
                params![execution_id, status.as_str(), now_ms, message],
            )?;
            Ok(updated == 1)
        })
    }

    /// Non-terminal runs whose deadline has passed
    pub fn overdue_executions(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM executions
             WHERE status IN ('PENDING', 'RUNNING')
               AND deadline_at_ms IS NOT NULL AND deadline_at_ms <= ?1
             ORDER BY id",
        )?;
        let ids = stmt
            .query_map([to_ms(now)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Runs among `execution_ids` that have reached a terminal status
    pub fn terminal_statuses(
        &self,
        execution_ids: &[i64],
    ) -> Result<HashMap<i64, ExecutionStatus>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status FROM executions WHERE id = ?1")?;
        let mut terminal = HashMap::new();
        for &id in execution_ids {
            let status: Option<String> = stmt.query_row([id], |row| row.get(0)).optional()?;
            match status.as_deref().and_then(ExecutionStatus::parse) {
                Some(status) if status.is_terminal() => {
                    terminal.insert(id, status);
                }
                Some(_) => {}
                // A run we hold work for vanished; treat it as cancelled
                None => {
                    terminal.insert(id, ExecutionStatus::Cancelled);
                }
            }
        }
        Ok(terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::super::sqlite::fixtures::{seed, spec};
    use super::*;
    use crate::store::{EntryState, FailurePolicy, NodeOutput};

    #[test]
    fn test_create_execution() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut new = NewExecution::new("nightly");
        new.trigger_data = serde_json::json!({"date": "2026-10-14"});
        new.failure_policy = FailurePolicy::AbortRun;
        new.max_retries = 2;
        new.run_timeout_seconds = Some(60);

        let id = store
            .create_execution(&new, &[spec("a", 3), spec("b", 3)], &[Edge::new("a", "b")])
            .unwrap();
        let record = store.get_execution(id).unwrap();
        assert_eq!(record.workflow_id, "nightly");
        assert_eq!(record.status, ExecutionStatus::Pending);
        assert_eq!(record.total_nodes, 2);
        assert_eq!(record.pending_nodes, 2);
        assert_eq!(record.failure_policy, FailurePolicy::AbortRun);
        assert_eq!(record.trigger_data["date"], "2026-10-14");
        assert!(record.deadline_at.unwrap() > record.created_at);
        assert!(record.started_at.is_none());
        assert_eq!(store.list_entries(id).unwrap().len(), 2);
    }

    #[test]
    fn test_create_execution_is_all_or_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        // Duplicate node ids violate UNIQUE(execution_id, node_id)
        let result = store.create_execution(
            &NewExecution::new("wf"),
            &[spec("a", 3), spec("a", 3)],
            &[],
        );
        assert!(result.is_err());
        assert!(store.list_executions(10).unwrap().is_empty());
    }

    #[test]
    fn test_create_entries_on_running_execution() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = seed(&store, &["a"], &[]);
        assert_eq!(
            store
                .create_entries(id, &[spec("b", 1)], &[Edge::new("a", "b")])
                .unwrap(),
            1
        );

        let record = store.get_execution(id).unwrap();
        assert_eq!(record.total_nodes, 2);
        assert_eq!(
            store.find_entry(id, "b").unwrap().unwrap().state,
            EntryState::Waiting
        );

        store.terminate_execution(id, ExecutionStatus::Cancelled, "stop").unwrap();
        assert!(matches!(
            store.create_entries(id, &[spec("c", 1)], &[]),
            Err(SchedulerError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_create_entries_after_predecessor_succeeded() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = seed(&store, &["a", "z"], &[]);
        let a = store.find_entry(id, "a").unwrap().unwrap().id;
        assert!(store.claim(a, "w1").unwrap());
        store
            .complete_success(a, "w1", &NodeOutput::default())
            .unwrap()
            .unwrap();

        store
            .create_entries(id, &[spec("b", 1)], &[Edge::new("a", "b")])
            .unwrap();
        let b = store.find_entry(id, "b").unwrap().unwrap();
        assert_eq!(b.dependency_count, 0);
        assert_eq!(b.state, EntryState::Ready);

        let mut ready: Vec<String> = store
            .fetch_ready(10)
            .unwrap()
            .into_iter()
            .map(|e| e.node_id)
            .collect();
        ready.sort();
        assert_eq!(ready, vec!["b", "z"]);
        // The edge is already spent; a second decrement changes nothing
        assert_eq!(store.decrement_dependents(id, &["a".to_string()]).unwrap(), 0);
    }

    #[test]
    fn test_create_entries_rejects_unknown_predecessor() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = seed(&store, &["a"], &[]);

        assert!(matches!(
            store.create_entries(id, &[spec("b", 1)], &[Edge::new("ghost", "b")]),
            Err(SchedulerError::InvalidTransition(_))
        ));
        assert!(store.find_entry(id, "b").unwrap().is_none());
        assert_eq!(store.get_execution(id).unwrap().total_nodes, 1);
    }

    #[test]
    fn test_terminate_cancels_unfinished() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = seed(&store, &["a", "b", "c"], &[("a", "c")]);
        let a = store.find_entry(id, "a").unwrap().unwrap().id;
        let b = store.find_entry(id, "b").unwrap().unwrap().id;
        assert!(store.claim(a, "w1").unwrap());
        assert!(store.claim(b, "w1").unwrap());
        store.complete_success(b, "w1", &NodeOutput::default()).unwrap();

        let outcome = store
            .terminate_execution(id, ExecutionStatus::Cancelled, "cancelled by user")
            .unwrap()
            .unwrap();
        assert_eq!(outcome.cancelled, vec!["a", "c"]);
        assert_eq!(outcome.in_flight, vec!["a"]);

        let record = store.get_execution(id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert_eq!(record.completed_nodes, 3);
        assert_eq!(record.running_nodes + record.pending_nodes, 0);
        assert!(record.ended_at.is_some());
        assert_eq!(
            store.get_result(id, "c").unwrap().unwrap().status,
            ResultStatus::Cancelled
        );
        assert_eq!(
            store.get_result(id, "b").unwrap().unwrap().status,
            ResultStatus::Success
        );

        // The cancelled worker's late completion is discarded
        assert!(store
            .complete_success(a, "w1", &NodeOutput::default())
            .unwrap()
            .is_none());

        // Terminal statuses never change again
        assert!(store
            .terminate_execution(id, ExecutionStatus::Timeout, "late")
            .unwrap()
            .is_none());
        assert!(!store.finish_execution(id, ExecutionStatus::Completed, None).unwrap());
        assert_eq!(store.get_execution(id).unwrap().status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn test_finish_requires_all_nodes_completed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = seed(&store, &["a"], &[]);
        assert!(!store.finish_execution(id, ExecutionStatus::Completed, None).unwrap());

        let a = store.find_entry(id, "a").unwrap().unwrap().id;
        assert!(store.claim(a, "w1").unwrap());
        store.complete_success(a, "w1", &NodeOutput::default()).unwrap();
        assert!(store.finish_execution(id, ExecutionStatus::Completed, None).unwrap());
        assert_eq!(store.get_execution(id).unwrap().status, ExecutionStatus::Completed);

        assert!(matches!(
            store.finish_execution(id, ExecutionStatus::Running, None),
            Err(SchedulerError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_overdue_and_terminal_queries() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut new = NewExecution::new("wf");
        new.run_timeout_seconds = Some(10);
        let timed = store.create_execution(&new, &[spec("a", 1)], &[]).unwrap();
        let untimed = seed(&store, &["a"], &[]);

        let now = Utc::now();
        assert!(store.overdue_executions(now).unwrap().is_empty());
        assert_eq!(
            store
                .overdue_executions(now + chrono::Duration::seconds(11))
                .unwrap(),
            vec![timed]
        );

        store
            .terminate_execution(timed, ExecutionStatus::Timeout, "deadline passed")
            .unwrap();
        let terminal = store.terminal_statuses(&[timed, untimed, 999]).unwrap();
        assert_eq!(terminal.get(&timed), Some(&ExecutionStatus::Timeout));
        assert_eq!(terminal.get(&untimed), None);
        assert_eq!(terminal.get(&999), Some(&ExecutionStatus::Cancelled));
    }

    #[test]
    fn test_terminate_missing_execution() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            store.terminate_execution(5, ExecutionStatus::Cancelled, "x"),
            Err(SchedulerError::ExecutionNotFound(5))
        ));
    }
}
