//! Distributed DAG scheduler for workflow runs
//!
//! Workers in any number of processes share one SQLite database. Each node
//! of a run becomes a schedule entry whose dependency count drops as its
//! predecessors succeed; entries at zero are claimed atomically, executed
//! under a timeout, and retried with separate budgets for logical failures
//! and admission-control rejections.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod retry;
pub mod scheduler;
pub mod signals;
pub mod store;
pub mod workflow;

pub use error::{Result, SchedulerError};
