//! Schedule entry transitions
//!
//! Every public method here is one `BEGIN IMMEDIATE` transaction. Entry
//! transitions and the run counters they imply are written together.

use super::models::{
    CompletionOutcome, EntrySpec, EntryState, FailureOutcome, FailureReport, NodeOutput,
    ResultStatus, ScheduleEntry,
};
use super::sqlite::{ENTRY_COLUMNS, SqliteStore, entry_from_row, load_entry, to_ms};
use crate::error::{Result, SchedulerError};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::workflow::Edge;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::time::Duration;

const ACTIVE_EXECUTION: &str = "EXISTS (SELECT 1 FROM executions x WHERE x.id = e.execution_id AND x.status IN ('PENDING', 'RUNNING'))";

impl SqliteStore {
    /// Add entries to an existing, non-terminal run
    ///
    /// Each node's dependency count starts at its in-degree over `edges`.
    pub fn create_entries(
        &self,
        execution_id: i64,
        specs: &[EntrySpec],
        edges: &[Edge],
    ) -> Result<usize> {
        let now = Utc::now();
        self.write(|tx| insert_entries(tx, execution_id, specs, edges, now))
    }

    /// Ready entries in dispatch order; does not claim
    pub fn fetch_ready(&self, limit: usize) -> Result<Vec<ScheduleEntry>> {
        self.fetch_ready_at(limit, Utc::now())
    }

    pub fn fetch_ready_at(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<ScheduleEntry>> {
        self.fetch_ready_excluding(limit, now, &HashSet::new())
    }

    /// Like `fetch_ready_at`, leaving out entries of the `excluded` runs
    ///
    /// The exclusion happens before `LIMIT`, so a run with many ready
    /// entries cannot crowd out the rest.
    pub fn fetch_ready_excluding(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        excluded: &HashSet<i64>,
    ) -> Result<Vec<ScheduleEntry>> {
        let exclusion = if excluded.is_empty() {
            String::new()
        } else {
            let ids: Vec<String> = excluded.iter().map(|id| id.to_string()).collect();
            format!("AND e.execution_id NOT IN ({})", ids.join(", "))
        };
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {columns} FROM schedule_entries e
             WHERE e.state = 'ready'
               AND e.dependency_count = 0
               AND e.retry_count < e.max_retries
               AND (e.next_eligible_at_ms IS NULL OR e.next_eligible_at_ms <= ?1)
               AND {active}
               {exclusion}
             ORDER BY e.priority DESC, e.wait_factor {order}, e.id ASC
             LIMIT ?2",
            columns = ENTRY_COLUMNS,
            active = ACTIVE_EXECUTION,
            exclusion = exclusion,
            order = self.tie_break.wait_factor_order(),
        ))?;
        let entries = stmt
            .query_map(params![to_ms(now), limit as i64], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Atomically move a ready entry to CLAIMED for `worker_id`
    ///
    /// Returns `false` if another worker won or the entry stopped being ready.
    pub fn claim(&self, entry_id: i64, worker_id: &str) -> Result<bool> {
        self.claim_at(entry_id, worker_id, Utc::now())
    }

    pub fn claim_at(&self, entry_id: i64, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let now_ms = to_ms(now);
        self.write(|tx| {
            let claimed = tx.execute(
                &format!(
                    "UPDATE schedule_entries AS e
                     SET state = 'claimed', claimed_by = ?2, claimed_at_ms = ?3,
                         attempt = attempt + 1, updated_at_ms = ?3
                     WHERE e.id = ?1
                       AND e.state = 'ready'
                       AND e.dependency_count = 0
                       AND e.retry_count < e.max_retries
                       AND (e.next_eligible_at_ms IS NULL OR e.next_eligible_at_ms <= ?3)
                       AND {}",
                    ACTIVE_EXECUTION
                ),
                params![entry_id, worker_id, now_ms],
            )?;
            if claimed == 0 {
                return Ok(false);
            }

            let (execution_id, node_id, attempt, retry_count): (i64, String, u32, u32) = tx
                .query_row(
                    "SELECT execution_id, node_id, attempt, retry_count FROM schedule_entries WHERE id = ?1",
                    [entry_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;

            tx.execute(
                "INSERT INTO node_results (execution_id, node_id, status, started_at_ms, retry_count, attempt, updated_at_ms)
                 VALUES (?1, ?2, 'RUNNING', ?3, ?4, ?5, ?3)
                 ON CONFLICT(execution_id, node_id) DO UPDATE SET
                    status = 'RUNNING',
                    started_at_ms = excluded.started_at_ms,
                    ended_at_ms = NULL,
                    result_data = NULL,
                    stdout = NULL,
                    stderr = NULL,
                    duration_ms = NULL,
                    cpu_time_ms = NULL,
                    peak_memory_kb = NULL,
                    error_message = NULL,
                    error_details = NULL,
                    retry_count = excluded.retry_count,
                    attempt = excluded.attempt,
                    updated_at_ms = excluded.updated_at_ms",
                params![execution_id, node_id, now_ms, retry_count, attempt],
            )?;

            tx.execute(
                "UPDATE executions
                 SET pending_nodes = pending_nodes - 1,
                     running_nodes = running_nodes + 1,
                     status = CASE WHEN status = 'PENDING' THEN 'RUNNING' ELSE status END,
                     started_at_ms = COALESCE(started_at_ms, ?2)
                 WHERE id = ?1",
                params![execution_id, now_ms],
            )?;

            Ok(true)
        })
    }

    /// CLAIMED to RUNNING, only for the claim holder
    pub fn mark_running(&self, entry_id: i64, worker_id: &str) -> Result<bool> {
        let now_ms = to_ms(Utc::now());
        self.write(|tx| {
            let updated = tx.execute(
                "UPDATE schedule_entries SET state = 'running', updated_at_ms = ?3
                 WHERE id = ?1 AND state = 'claimed' AND claimed_by = ?2",
                params![entry_id, worker_id, now_ms],
            )?;
            Ok(updated == 1)
        })
    }

    /// Record a successful attempt and cascade to dependents
    ///
    /// Returns `None` if `worker_id` no longer holds the claim, e.g. because
    /// the run was cancelled meanwhile.
    pub fn complete_success(
        &self,
        entry_id: i64,
        worker_id: &str,
        output: &NodeOutput,
    ) -> Result<Option<CompletionOutcome>> {
        let now_ms = to_ms(Utc::now());
        self.write(|tx| {
            let updated = tx.execute(
                "UPDATE schedule_entries
                 SET state = 'succeeded', claimed_by = NULL, updated_at_ms = ?3
                 WHERE id = ?1 AND state IN ('claimed', 'running') AND claimed_by = ?2",
                params![entry_id, worker_id, now_ms],
            )?;
            if updated == 0 {
                return Ok(None);
            }

            let (execution_id, node_id): (i64, String) = tx.query_row(
                "SELECT execution_id, node_id FROM schedule_entries WHERE id = ?1",
                [entry_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            write_result(
                tx,
                execution_id,
                &node_id,
                ResultStatus::Success,
                Some(output),
                None,
                None,
                now_ms,
            )?;

            let (decremented, newly_ready) =
                apply_decrements(tx, execution_id, std::slice::from_ref(&node_id), now_ms)?;

            tx.execute(
                "UPDATE executions
                 SET running_nodes = running_nodes - 1, completed_nodes = completed_nodes + 1
                 WHERE id = ?1",
                [execution_id],
            )?;

            Ok(Some(CompletionOutcome {
                execution_id,
                node_id,
                decremented,
                newly_ready,
            }))
        })
    }

    /// Apply each not-yet-applied edge out of `completed` exactly once
    ///
    /// Returns the number of decrements applied; repeating the call is a no-op.
    pub fn decrement_dependents(&self, execution_id: i64, completed: &[String]) -> Result<usize> {
        let now_ms = to_ms(Utc::now());
        self.write(|tx| Ok(apply_decrements(tx, execution_id, completed, now_ms)?.0))
    }

    /// Charge a failed attempt to the entry's retry state
    ///
    /// With `worker_id` set the failure only applies while that worker still
    /// holds the claim. Returns `None` if the entry is no longer in flight.
    pub fn record_failure(
        &self,
        entry_id: i64,
        worker_id: Option<&str>,
        report: &FailureReport,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureOutcome>> {
        let now_ms = to_ms(now);
        self.write(|tx| {
            let entry = load_entry(tx, entry_id)?.ok_or(SchedulerError::EntryNotFound(entry_id))?;
            let in_flight = matches!(entry.state, EntryState::Claimed | EntryState::Running);
            let holder_matches =
                worker_id.is_none_or(|worker| entry.claimed_by.as_deref() == Some(worker));
            if !in_flight || !holder_matches {
                return Ok(None);
            }

            let mut retry = entry.retry.clone();
            let state = match retry.record(report.kind, &report.reason, policy, now) {
                RetryDecision::Rearm { .. } => EntryState::Ready,
                RetryDecision::Exhausted => EntryState::FailedTerminal,
            };

            let updated = tx.execute(
                "UPDATE schedule_entries
                 SET state = ?2, retry_count = ?3, resource_retry_count = ?4, wait_factor = ?5,
                     next_eligible_at_ms = ?6, last_rejection_reason = ?7, last_failure_kind = ?8,
                     claimed_by = NULL, claimed_at_ms = NULL, updated_at_ms = ?9
                 WHERE id = ?1 AND state IN ('claimed', 'running')",
                params![
                    entry_id,
                    state.as_str(),
                    retry.attempts,
                    retry.transient_attempts,
                    retry.wait_factor,
                    retry.next_eligible_at.map(to_ms),
                    retry.last_rejection_reason,
                    retry.last_kind.map(|k| k.as_str()),
                    now_ms,
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }

            write_result(
                tx,
                entry.execution_id,
                &entry.node_id,
                report.result_status(),
                report.output.as_ref(),
                Some(&report.reason),
                report.details.as_ref(),
                now_ms,
            )?;
            tx.execute(
                "UPDATE node_results SET retry_count = ?3 WHERE execution_id = ?1 AND node_id = ?2",
                params![entry.execution_id, entry.node_id, retry.attempts],
            )?;

            let counters = if state == EntryState::FailedTerminal {
                "running_nodes = running_nodes - 1, completed_nodes = completed_nodes + 1, failed_nodes = failed_nodes + 1"
            } else {
                "running_nodes = running_nodes - 1, pending_nodes = pending_nodes + 1"
            };
            tx.execute(
                &format!("UPDATE executions SET {} WHERE id = ?1", counters),
                [entry.execution_id],
            )?;

            Ok(Some(FailureOutcome {
                entry_id,
                execution_id: entry.execution_id,
                node_id: entry.node_id,
                state,
                retry,
            }))
        })
    }

    /// Skip every transitive dependent of `node_id` that has not started
    ///
    /// Returns the node ids moved to SKIPPED.
    pub fn skip_dependents(&self, execution_id: i64, node_id: &str) -> Result<Vec<String>> {
        let now_ms = to_ms(Utc::now());
        self.write(|tx| {
            let mut skipped = Vec::new();
            for dependent in transitive_dependents(tx, execution_id, node_id)? {
                let updated = tx.execute(
                    "UPDATE schedule_entries SET state = 'skipped', updated_at_ms = ?3
                     WHERE execution_id = ?1 AND node_id = ?2 AND state IN ('waiting', 'ready')",
                    params![execution_id, dependent, now_ms],
                )?;
                if updated == 1 {
                    let reason = format!("upstream node '{}' failed", node_id);
                    write_result(
                        tx,
                        execution_id,
                        &dependent,
                        ResultStatus::Skipped,
                        None,
                        Some(&reason),
                        None,
                        now_ms,
                    )?;
                    skipped.push(dependent);
                }
            }

            if !skipped.is_empty() {
                tx.execute(
                    "UPDATE executions
                     SET pending_nodes = pending_nodes - ?2, completed_nodes = completed_nodes + ?2
                     WHERE id = ?1",
                    params![execution_id, skipped.len() as i64],
                )?;
            }
            Ok(skipped)
        })
    }

    /// Give a claim back without charging any budget
    pub fn release_claim(&self, entry_id: i64, worker_id: &str) -> Result<bool> {
        let now_ms = to_ms(Utc::now());
        self.write(|tx| {
            let Some((execution_id, node_id)) = tx
                .query_row(
                    "SELECT execution_id, node_id FROM schedule_entries
                     WHERE id = ?1 AND state IN ('claimed', 'running') AND claimed_by = ?2",
                    params![entry_id, worker_id],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?
            else {
                return Ok(false);
            };

            tx.execute(
                "UPDATE schedule_entries
                 SET state = 'ready', claimed_by = NULL, claimed_at_ms = NULL, updated_at_ms = ?2
                 WHERE id = ?1",
                params![entry_id, now_ms],
            )?;
            tx.execute(
                "UPDATE node_results SET status = 'PENDING', updated_at_ms = ?3
                 WHERE execution_id = ?1 AND node_id = ?2",
                params![execution_id, node_id, now_ms],
            )?;
            tx.execute(
                "UPDATE executions
                 SET running_nodes = running_nodes - 1, pending_nodes = pending_nodes + 1
                 WHERE id = ?1",
                [execution_id],
            )?;
            Ok(true)
        })
    }

    /// In-flight entries whose claim outlived `timeout_seconds + grace`
    pub fn abandoned_claims(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<ScheduleEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedule_entries e
             WHERE e.state IN ('claimed', 'running')
               AND e.claimed_at_ms IS NOT NULL
               AND e.claimed_at_ms + e.timeout_seconds * 1000 + ?2 < ?1
               AND {}
             ORDER BY e.id",
            ENTRY_COLUMNS, ACTIVE_EXECUTION
        ))?;
        let grace_ms = i64::try_from(grace.as_millis()).unwrap_or(i64::MAX);
        let entries = stmt
            .query_map(params![to_ms(now), grace_ms], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}

/// Insert entries and edges for a run and grow its counters
pub(crate) fn insert_entries(
    conn: &Connection,
    execution_id: i64,
    specs: &[EntrySpec],
    edges: &[Edge],
    now: DateTime<Utc>,
) -> Result<usize> {
    let now_ms = to_ms(now);
    let mut in_degree: BTreeMap<&str, u32> =
        specs.iter().map(|spec| (spec.node_id.as_str(), 0)).collect();
    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(edges.len());
    for edge in edges {
        if !seen.insert((edge.from.as_str(), edge.to.as_str())) {
            continue;
        }
        if !in_degree.contains_key(edge.to.as_str()) {
            return Err(SchedulerError::InvalidTransition(format!(
                "edge {} -> {} targets no new entry",
                edge.from, edge.to
            )));
        }
        // Predecessors outside this batch must already belong to the run
        let applied = if in_degree.contains_key(edge.from.as_str()) {
            false
        } else {
            match existing_state(conn, execution_id, &edge.from)? {
                Some(EntryState::Succeeded) => true,
                Some(
                    EntryState::Waiting
                    | EntryState::Ready
                    | EntryState::Claimed
                    | EntryState::Running,
                ) => false,
                Some(state) => {
                    return Err(SchedulerError::InvalidTransition(format!(
                        "predecessor {} of {} is already {}",
                        edge.from, edge.to, state
                    )));
                }
                None => {
                    return Err(SchedulerError::InvalidTransition(format!(
                        "predecessor {} of {} is not part of execution {}",
                        edge.from, edge.to, execution_id
                    )));
                }
            }
        };
        if !applied {
            if let Some(count) = in_degree.get_mut(edge.to.as_str()) {
                *count += 1;
            }
        }
        resolved.push((edge, applied));
    }

    let grown = conn.execute(
        "UPDATE executions
         SET total_nodes = total_nodes + ?2, pending_nodes = pending_nodes + ?2
         WHERE id = ?1 AND status IN ('PENDING', 'RUNNING')",
        params![execution_id, specs.len() as i64],
    )?;
    if grown == 0 {
        return Err(SchedulerError::InvalidTransition(format!(
            "execution {} is missing or terminal",
            execution_id
        )));
    }

    let mut stmt = conn.prepare(
        "INSERT INTO schedule_entries
            (execution_id, node_id, state, dependency_count, priority, max_retries,
             timeout_seconds, snapshot, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
    )?;
    for spec in specs {
        let dependency_count = in_degree.get(spec.node_id.as_str()).copied().unwrap_or(0);
        let state = if dependency_count == 0 {
            EntryState::Ready
        } else {
            EntryState::Waiting
        };
        let snapshot = serde_json::to_string(&spec.snapshot)
            .map_err(|e| SchedulerError::InvalidTransition(format!("unserializable snapshot: {}", e)))?;
        stmt.execute(params![
            execution_id,
            spec.node_id,
            state.as_str(),
            dependency_count,
            spec.priority,
            spec.max_retries,
            i64::try_from(spec.timeout_seconds).unwrap_or(i64::MAX),
            snapshot,
            now_ms,
        ])?;
    }

    let mut edge_stmt = conn.prepare(
        "INSERT OR IGNORE INTO schedule_edges (execution_id, predecessor, dependent, applied)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (edge, applied) in resolved {
        edge_stmt.execute(params![execution_id, edge.from, edge.to, applied])?;
    }

    Ok(specs.len())
}

fn existing_state(conn: &Connection, execution_id: i64, node_id: &str) -> Result<Option<EntryState>> {
    let state: Option<String> = conn
        .query_row(
            "SELECT state FROM schedule_entries WHERE execution_id = ?1 AND node_id = ?2",
            params![execution_id, node_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(state.as_deref().and_then(EntryState::parse))
}

/// Guarded decrements for every unapplied edge out of `completed`
fn apply_decrements(
    conn: &Connection,
    execution_id: i64,
    completed: &[String],
    now_ms: i64,
) -> Result<(usize, Vec<String>)> {
    let mut decremented = 0;
    let mut newly_ready = Vec::new();

    for predecessor in completed {
        let dependents: Vec<String> = conn
            .prepare(
                "SELECT dependent FROM schedule_edges
                 WHERE execution_id = ?1 AND predecessor = ?2 AND applied = 0
                 ORDER BY dependent",
            )?
            .query_map(params![execution_id, predecessor], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        for dependent in dependents {
            let marked = conn.execute(
                "UPDATE schedule_edges SET applied = 1
                 WHERE execution_id = ?1 AND predecessor = ?2 AND dependent = ?3 AND applied = 0",
                params![execution_id, predecessor, dependent],
            )?;
            if marked == 0 {
                continue;
            }

            let state: Option<String> = conn
                .query_row(
                    "UPDATE schedule_entries
                     SET dependency_count = dependency_count - 1,
                         state = CASE
                             WHEN dependency_count = 1 AND state = 'waiting' THEN 'ready'
                             ELSE state
                         END,
                         updated_at_ms = ?3
                     WHERE execution_id = ?1 AND node_id = ?2 AND dependency_count > 0
                     RETURNING state",
                    params![execution_id, dependent, now_ms],
                    |row| row.get(0),
                )
                .optional()?;

            match state {
                Some(state) => {
                    decremented += 1;
                    if state == EntryState::Ready.as_str() {
                        tracing::debug!(execution_id, node_id = %dependent, "dependent became ready");
                        newly_ready.push(dependent);
                    }
                }
                None => {
                    let violation = SchedulerError::DependencyInvariantViolation {
                        execution_id,
                        predecessor: predecessor.clone(),
                        dependent,
                    };
                    tracing::error!(execution_id, error = %violation, "guarded decrement matched no entry");
                }
            }
        }
    }

    Ok((decremented, newly_ready))
}

/// Breadth-first walk over the run's stored edges
fn transitive_dependents(
    conn: &Connection,
    execution_id: i64,
    node_id: &str,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT dependent FROM schedule_edges WHERE execution_id = ?1 AND predecessor = ?2 ORDER BY dependent",
    )?;
    let mut visited = BTreeSet::new();
    let mut order = Vec::new();
    let mut queue = VecDeque::from([node_id.to_string()]);

    while let Some(current) = queue.pop_front() {
        let next: Vec<String> = stmt
            .query_map(params![execution_id, current], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        for dependent in next {
            if dependent != node_id && visited.insert(dependent.clone()) {
                order.push(dependent.clone());
                queue.push_back(dependent);
            }
        }
    }
    Ok(order)
}

/// Upsert the result row of one node
#[allow(clippy::too_many_arguments)]
pub(crate) fn write_result(
    conn: &Connection,
    execution_id: i64,
    node_id: &str,
    status: ResultStatus,
    output: Option<&NodeOutput>,
    error_message: Option<&str>,
    error_details: Option<&serde_json::Value>,
    now_ms: i64,
) -> Result<()> {
    let result_data = output
        .and_then(|o| o.result_data.as_ref())
        .map(|v| v.to_string());
    let details = error_details.map(|v| v.to_string());
    let to_i64 = |v: Option<u64>| v.map(|v| i64::try_from(v).unwrap_or(i64::MAX));

    conn.execute(
        "INSERT INTO node_results
            (execution_id, node_id, status, result_data, stdout, stderr, ended_at_ms,
             duration_ms, cpu_time_ms, peak_memory_kb, error_message, error_details, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?7)
         ON CONFLICT(execution_id, node_id) DO UPDATE SET
            status = excluded.status,
            result_data = excluded.result_data,
            stdout = excluded.stdout,
            stderr = excluded.stderr,
            ended_at_ms = excluded.ended_at_ms,
            duration_ms = COALESCE(excluded.duration_ms,
                excluded.ended_at_ms - node_results.started_at_ms),
            cpu_time_ms = excluded.cpu_time_ms,
            peak_memory_kb = excluded.peak_memory_kb,
            error_message = excluded.error_message,
            error_details = excluded.error_details,
            updated_at_ms = excluded.updated_at_ms",
        params![
            execution_id,
            node_id,
            status.as_str(),
            result_data,
            output.map(|o| o.stdout.as_str()),
            output.map(|o| o.stderr.as_str()),
            now_ms,
            to_i64(output.and_then(|o| o.usage.duration_ms)),
            to_i64(output.and_then(|o| o.usage.cpu_time_ms)),
            to_i64(output.and_then(|o| o.usage.peak_memory_kb)),
            error_message,
            details,
        ],
    )?;
    Ok(())
}
