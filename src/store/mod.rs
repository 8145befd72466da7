//! Schedule and result stores backed by SQLite
//!
//! All mutation of dependency counts, claim state, retry fields and run
//! counters happens inside `BEGIN IMMEDIATE` transactions with conditional
//! updates, so several processes can share one database file.

mod entries;
mod executions;
mod models;
mod schema;
mod sqlite;

pub use models::{
    CancelOutcome, CompletionOutcome, EntrySpec, EntryState, ExecutionRecord, ExecutionStatus,
    FailureOutcome, FailurePolicy, FailureReport, NewExecution, NodeOutput, ResourceUsage,
    ResultEntry, ResultStatus, ScheduleEntry, TieBreak,
};
pub use sqlite::SqliteStore;

#[cfg(test)]
pub(crate) use sqlite::fixtures;
