//! Readiness-driven claiming
//!
//! The scheduler turns READY entries into claims held by this worker.
//! Ordering from the store is a hint; losing a claim race to another
//! process is normal and costs the entry nothing.

use crate::error::Result;
use crate::store::{EntryState, ScheduleEntry, SqliteStore};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct Scheduler {
    store: Arc<SqliteStore>,
    worker_id: String,
    batch_size: usize,
}

impl Scheduler {
    pub fn new(store: Arc<SqliteStore>, worker_id: impl Into<String>, batch_size: usize) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim up to `capacity` ready entries, at most one batch, skipping runs in `halted`
    pub fn claim_batch(
        &self,
        capacity: usize,
        halted: &HashSet<i64>,
    ) -> Result<Vec<ScheduleEntry>> {
        self.claim_batch_at(capacity, halted, Utc::now())
    }

    pub fn claim_batch_at(
        &self,
        capacity: usize,
        halted: &HashSet<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleEntry>> {
        if capacity == 0 {
            return Ok(Vec::new());
        }

        let wanted = capacity.min(self.batch_size);
        // Over-fetch so claims lost to other workers don't starve the batch
        let limit = wanted.saturating_mul(2);
        let candidates = self.store.fetch_ready_excluding(limit, now, halted)?;

        let mut claimed = Vec::with_capacity(wanted);
        for mut entry in candidates {
            if claimed.len() == wanted {
                break;
            }
            if !self.store.claim_at(entry.id, &self.worker_id, now)? {
                debug!(entry_id = entry.id, node_id = %entry.node_id, "claim lost to another worker");
                continue;
            }

            entry.state = EntryState::Claimed;
            entry.claimed_by = Some(self.worker_id.clone());
            entry.claimed_at = Some(now);
            entry.attempt += 1;
            debug!(
                execution_id = entry.execution_id,
                entry_id = entry.id,
                node_id = %entry.node_id,
                worker_id = %self.worker_id,
                attempt = entry.attempt,
                "entry claimed"
            );
            claimed.push(entry);
        }
        Ok(claimed)
    }
}
