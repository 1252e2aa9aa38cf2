//! Reconciliation sweep
//!
//! Pulls every booking in a time window from the provider and pushes each
//! one through the booking applier, repairing whatever webhooks missed.
//!
//! ```text
//! try_set_lock ──held──▶ AlreadyRunning
//!      │
//!      ▼
//! window (given, or last success − lookback .. now + lookahead)
//!      │
//!      ▼
//! resource profiles ──▶ per-profile queries ──▶ pages ──▶ booking applier
//!      │                                          │            │
//!      ✗ fatal                          retry w/ backoff   item error → errors[]
//!      │                                          │
//!      ▼                                          ▼
//! release lock                          SyncRun persisted, state recorded, lock released
//! ```

pub mod job;
pub mod retry;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ItemError, SyncRun, SyncWindow};

pub use job::{SweepJob, UNKNOWN_BOOKING_ID};
pub use retry::RetryPolicy;

/// Outcome of one terminal sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    /// Persisted run id
    pub run_id: Uuid,
    /// Window reconciled
    pub window: SyncWindow,
    /// `true` when no item failed
    pub success: bool,
    /// Bookings the applier processed without error
    pub synced: u64,
    /// New local appointments
    pub created: u64,
    /// Changed local appointments
    pub updated: u64,
    /// Applier no-ops plus bookings outside the window
    pub skipped: u64,
    /// One entry per failed booking
    pub errors: Vec<ItemError>,
    /// Wall time of the run
    pub duration_ms: u64,
}

impl SyncResult {
    /// Summarize a finished run
    pub fn from_run(run: &SyncRun, elapsed: Duration) -> Self {
        Self {
            run_id: run.id,
            window: run.window(),
            success: run.success,
            synced: run.counts.synced,
            created: run.counts.created,
            updated: run.counts.updated,
            skipped: run.counts.skipped,
            errors: run.errors.clone(),
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}
