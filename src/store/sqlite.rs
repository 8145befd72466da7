//! Connection handling, row mapping and read queries

use super::models::{
    EntryState, ExecutionRecord, ExecutionStatus, FailurePolicy, ResourceUsage, ResultEntry,
    ResultStatus, ScheduleEntry, TieBreak,
};
use super::schema::init_schema;
use crate::error::{Result, SchedulerError};
use crate::retry::{RetryKind, RetryState};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub(crate) const EXECUTION_COLUMNS: &str = "id, workflow_id, status, trigger_data, total_nodes, pending_nodes, \
     running_nodes, completed_nodes, failed_nodes, retry_count, max_retries, is_retry, \
     parent_execution_id, failure_policy, deadline_at_ms, error_message, created_at_ms, \
     started_at_ms, ended_at_ms";

pub(crate) const ENTRY_COLUMNS: &str = "e.id, e.execution_id, e.node_id, e.state, e.dependency_count, \
     e.priority, e.timeout_seconds, e.max_retries, e.retry_count, e.resource_retry_count, \
     e.wait_factor, e.next_eligible_at_ms, e.last_rejection_reason, e.last_failure_kind, \
     e.claimed_by, e.claimed_at_ms, e.attempt, e.snapshot, e.created_at_ms";

const RESULT_COLUMNS: &str = "id, execution_id, node_id, status, result_data, stdout, stderr, \
     started_at_ms, ended_at_ms, duration_ms, cpu_time_ms, peak_memory_kb, error_message, \
     error_details, retry_count, attempt";

/// Schedule, result and execution storage
pub struct SqliteStore {
    conn: Mutex<Connection>,
    pub(crate) tie_break: TieBreak,
}

impl SqliteStore {
    /// Open or create a database file shared by any number of processes
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                // Surfaces as SQLITE_CANTOPEN below if this fails
                let _ = std::fs::create_dir_all(parent);
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        Self::from_connection(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            tie_break: TieBreak::default(),
        })
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::StorePoisoned)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, committing only on `Ok`
    ///
    /// Blocks the calling thread while another process holds the write lock,
    /// up to `busy_timeout` per statement. Async callers on the worker path
    /// go through `spawn_blocking`.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Get an execution by id
    pub fn get_execution(&self, execution_id: i64) -> Result<ExecutionRecord> {
        let conn = self.conn()?;
        load_execution(&conn, execution_id)?.ok_or(SchedulerError::ExecutionNotFound(execution_id))
    }

    /// Most recent executions first
    pub fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM executions ORDER BY id DESC LIMIT ?1",
            EXECUTION_COLUMNS
        ))?;
        let records = stmt
            .query_map([limit as i64], execution_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Get a schedule entry by id
    pub fn get_entry(&self, entry_id: i64) -> Result<ScheduleEntry> {
        let conn = self.conn()?;
        load_entry(&conn, entry_id)?.ok_or(SchedulerError::EntryNotFound(entry_id))
    }

    /// All entries of a run in creation order
    pub fn list_entries(&self, execution_id: i64) -> Result<Vec<ScheduleEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedule_entries e WHERE e.execution_id = ?1 ORDER BY e.id",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map([execution_id], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Entry of one node of a run
    pub fn find_entry(&self, execution_id: i64, node_id: &str) -> Result<Option<ScheduleEntry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM schedule_entries e WHERE e.execution_id = ?1 AND e.node_id = ?2",
                    ENTRY_COLUMNS
                ),
                (execution_id, node_id),
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// All results of a run
    pub fn list_results(&self, execution_id: i64) -> Result<Vec<ResultEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM node_results WHERE execution_id = ?1 ORDER BY id",
            RESULT_COLUMNS
        ))?;
        let results = stmt
            .query_map([execution_id], result_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(results)
    }

    /// Result of one node of a run
    pub fn get_result(&self, execution_id: i64, node_id: &str) -> Result<Option<ResultEntry>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM node_results WHERE execution_id = ?1 AND node_id = ?2",
                    RESULT_COLUMNS
                ),
                (execution_id, node_id),
                result_from_row,
            )
            .optional()?;
        Ok(result)
    }
}

pub(crate) fn load_execution(
    conn: &Connection,
    execution_id: i64,
) -> rusqlite::Result<Option<ExecutionRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
        [execution_id],
        execution_from_row,
    )
    .optional()
}

pub(crate) fn load_entry(
    conn: &Connection,
    entry_id: i64,
) -> rusqlite::Result<Option<ScheduleEntry>> {
    conn.query_row(
        &format!("SELECT {} FROM schedule_entries e WHERE e.id = ?1", ENTRY_COLUMNS),
        [entry_id],
        entry_from_row,
    )
    .optional()
}

pub(crate) fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn invalid_column(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, message.into())
}

fn parse_column<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    parse(&value).ok_or_else(|| invalid_column(idx, Type::Text, format!("unexpected value '{}'", value)))
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let Some(text) = row.get::<_, Option<String>>(idx)? else {
        return Ok(None);
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_ms))
}

fn unsigned_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(|v| v.max(0) as u64))
}

pub(crate) fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        status: parse_column(row, 2, ExecutionStatus::parse)?,
        trigger_data: json_column(row, 3)?.unwrap_or(serde_json::Value::Null),
        total_nodes: row.get(4)?,
        pending_nodes: row.get(5)?,
        running_nodes: row.get(6)?,
        completed_nodes: row.get(7)?,
        failed_nodes: row.get(8)?,
        retry_count: row.get(9)?,
        max_retries: row.get(10)?,
        is_retry: row.get(11)?,
        parent_execution_id: row.get(12)?,
        failure_policy: parse_column(row, 13, FailurePolicy::parse)?,
        deadline_at: time_column(row, 14)?,
        error_message: row.get(15)?,
        created_at: from_ms(row.get(16)?),
        started_at: time_column(row, 17)?,
        ended_at: time_column(row, 18)?,
    })
}

pub(crate) fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleEntry> {
    let last_kind = match row.get::<_, Option<String>>(13)? {
        Some(kind) => Some(
            RetryKind::parse(&kind)
                .ok_or_else(|| invalid_column(13, Type::Text, format!("unexpected value '{}'", kind)))?,
        ),
        None => None,
    };

    let snapshot_text: String = row.get(17)?;
    let snapshot = serde_json::from_str(&snapshot_text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(17, Type::Text, Box::new(e)))?;

    Ok(ScheduleEntry {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        node_id: row.get(2)?,
        state: parse_column(row, 3, EntryState::parse)?,
        dependency_count: row.get(4)?,
        priority: row.get(5)?,
        timeout_seconds: unsigned_column(row, 6)?.unwrap_or(0),
        retry: RetryState {
            last_kind,
            attempts: row.get(8)?,
            max_attempts: row.get(7)?,
            transient_attempts: row.get(9)?,
            wait_factor: row.get(10)?,
            next_eligible_at: time_column(row, 11)?,
            last_rejection_reason: row.get(12)?,
        },
        claimed_by: row.get(14)?,
        claimed_at: time_column(row, 15)?,
        attempt: row.get(16)?,
        snapshot,
        created_at: from_ms(row.get(18)?),
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<ResultEntry> {
    Ok(ResultEntry {
        id: row.get(0)?,
        execution_id: row.get(1)?,
        node_id: row.get(2)?,
        status: parse_column(row, 3, ResultStatus::parse)?,
        result_data: json_column(row, 4)?,
        stdout: row.get(5)?,
        stderr: row.get(6)?,
        started_at: time_column(row, 7)?,
        ended_at: time_column(row, 8)?,
        usage: ResourceUsage {
            duration_ms: unsigned_column(row, 9)?,
            cpu_time_ms: unsigned_column(row, 10)?,
            peak_memory_kb: unsigned_column(row, 11)?,
        },
        error_message: row.get(12)?,
        error_details: json_column(row, 13)?,
        retry_count: row.get(14)?,
        attempt: row.get(15)?,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::SqliteStore;
    use crate::store::{EntrySpec, NewExecution};
    use crate::workflow::{Edge, NodeSnapshot, ScriptReference};
    use std::collections::BTreeMap;

    pub fn spec(node_id: &str, max_retries: u32) -> EntrySpec {
        EntrySpec {
            node_id: node_id.to_string(),
            priority: 0,
            max_retries,
            timeout_seconds: 30,
            snapshot: NodeSnapshot {
                node_id: node_id.to_string(),
                name: node_id.to_string(),
                script: ScriptReference::Custom(node_id.to_string()),
                script_body: format!("echo {}", node_id),
                params: BTreeMap::new(),
            },
        }
    }

    /// Create a run with the given nodes (max_retries 3) and edges
    pub fn seed(store: &SqliteStore, nodes: &[&str], edges: &[(&str, &str)]) -> i64 {
        let specs: Vec<EntrySpec> = nodes.iter().map(|n| spec(n, 3)).collect();
        let edges: Vec<Edge> = edges.iter().map(|(f, t)| Edge::new(*f, *t)).collect();
        store
            .create_execution(&NewExecution::new("wf"), &specs, &edges)
            .unwrap()
    }
}
