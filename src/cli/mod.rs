//! CLI module for flowsched
//!
//! This module provides:
//! - Command implementations (start, run, worker, status, ...)
//! - Output handlers (console, JSON, quiet)

pub mod commands;
pub mod output;

pub use commands::{
    AppContext, cancel_execution, parse_trigger_args, retry_execution, run_worker, run_workflow,
    show_results, show_status, start_execution, validate_workflow,
};
pub use output::{OutputEvent, OutputHandler, OutputMode, create_handler};
