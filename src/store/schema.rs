//! Database schema for the schedule and result stores

use rusqlite::Connection;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            workflow_id TEXT NOT NULL,
            status TEXT NOT NULL,
            trigger_data TEXT NOT NULL DEFAULT 'null',
            total_nodes INTEGER NOT NULL DEFAULT 0 CHECK (total_nodes >= 0),
            pending_nodes INTEGER NOT NULL DEFAULT 0 CHECK (pending_nodes >= 0),
            running_nodes INTEGER NOT NULL DEFAULT 0 CHECK (running_nodes >= 0),
            completed_nodes INTEGER NOT NULL DEFAULT 0 CHECK (completed_nodes >= 0),
            failed_nodes INTEGER NOT NULL DEFAULT 0 CHECK (failed_nodes >= 0),
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 0,
            is_retry INTEGER NOT NULL DEFAULT 0,
            parent_execution_id INTEGER REFERENCES executions(id),
            failure_policy TEXT NOT NULL,
            deadline_at_ms INTEGER,
            error_message TEXT,
            created_at_ms INTEGER NOT NULL,
            started_at_ms INTEGER,
            ended_at_ms INTEGER,
            CHECK (pending_nodes + running_nodes + completed_nodes = total_nodes),
            CHECK (failed_nodes <= completed_nodes)
        );

        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
        CREATE INDEX IF NOT EXISTS idx_executions_parent ON executions(parent_execution_id);

        CREATE TABLE IF NOT EXISTS schedule_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id INTEGER NOT NULL REFERENCES executions(id),
            node_id TEXT NOT NULL,
            state TEXT NOT NULL,
            dependency_count INTEGER NOT NULL CHECK (dependency_count >= 0),
            priority INTEGER NOT NULL DEFAULT 0 CHECK (priority >= 0),
            wait_factor INTEGER NOT NULL DEFAULT 0 CHECK (wait_factor >= 0),
            max_retries INTEGER NOT NULL,
            timeout_seconds INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            resource_retry_count INTEGER NOT NULL DEFAULT 0 CHECK (resource_retry_count >= 0),
            last_rejection_reason TEXT,
            last_failure_kind TEXT,
            next_eligible_at_ms INTEGER,
            claimed_by TEXT,
            claimed_at_ms INTEGER,
            attempt INTEGER NOT NULL DEFAULT 0,
            snapshot TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            UNIQUE(execution_id, node_id)
        );

        CREATE INDEX IF NOT EXISTS idx_entries_ready
            ON schedule_entries(state, dependency_count, priority DESC);
        CREATE INDEX IF NOT EXISTS idx_entries_execution ON schedule_entries(execution_id);

        CREATE TABLE IF NOT EXISTS schedule_edges (
            execution_id INTEGER NOT NULL REFERENCES executions(id),
            predecessor TEXT NOT NULL,
            dependent TEXT NOT NULL,
            applied INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (execution_id, predecessor, dependent)
        );

        CREATE TABLE IF NOT EXISTS node_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id INTEGER NOT NULL REFERENCES executions(id),
            node_id TEXT NOT NULL,
            status TEXT NOT NULL,
            result_data TEXT,
            stdout TEXT,
            stderr TEXT,
            started_at_ms INTEGER,
            ended_at_ms INTEGER,
            duration_ms INTEGER,
            cpu_time_ms INTEGER,
            peak_memory_kb INTEGER,
            error_message TEXT,
            error_details TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            attempt INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL,
            UNIQUE(execution_id, node_id)
        );

        CREATE INDEX IF NOT EXISTS idx_results_execution ON node_results(execution_id);
        "#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        // Idempotent
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert!(tables.contains(&"executions".to_string()));
        assert!(tables.contains(&"schedule_entries".to_string()));
        assert!(tables.contains(&"schedule_edges".to_string()));
        assert!(tables.contains(&"node_results".to_string()));
    }

    #[test]
    fn test_counter_check_rejects_drift() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO executions (workflow_id, status, total_nodes, pending_nodes, failure_policy, created_at_ms)
             VALUES ('wf', 'PENDING', 2, 1, 'skip_dependents', 0)",
            [],
        );
        assert!(result.is_err());
    }
}
