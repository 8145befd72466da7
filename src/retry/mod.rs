//! Retry and backoff
//!
//! Logical failures spend a bounded per-entry budget. Admission-control
//! rejections are retried indefinitely behind capped exponential backoff and
//! never touch that budget.

mod backoff;
mod controller;
mod state;

pub use backoff::{BackoffPolicy, RetryPolicy};
pub use controller::{NodeFailure, RetryController};
pub use state::{RetryDecision, RetryKind, RetryState};
