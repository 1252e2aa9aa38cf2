//! Appliers: external record in, idempotent local upsert out
//!
//! Each applier is split in two:
//!
//! - a pure `plan` function of `(existing record | none, incoming record)` that
//!   decides whether to create, update or skip, and
//! - an async `apply` that looks up the existing record, executes the plan,
//!   and appends the audit entry.
//!
//! Neither half keeps state between calls, so the webhook path and the sweep
//! can share them and replay the same record safely.
//!
//! ```text
//! incoming ──▶ lookup ──▶ plan(existing, incoming) ──▶ insert / update ──▶ audit
//!                               │                          │
//!                               ▼                          ▼
//!                         Skip (no write)        Conflict ──▶ re-plan as update (once)
//! ```

pub mod booking;
pub mod invoice;
pub mod payment;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::audit::{AuditEntry, AuditLog};
use crate::error::ApplyError;
use crate::metrics::global_metrics;
use crate::store::Datastore;

pub use payment::PaymentRecord;

/// What an applier did with one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// A new local record was inserted
    Created,
    /// An existing record changed
    Updated,
    /// Nothing was written
    Skipped,
}

impl ApplyOutcome {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a record produced no write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Stored state already matches
    Unchanged,
    /// Incoming provider timestamp is older than the stored one
    Stale,
    /// Unknown payment that has not reached terminal success
    NotTerminal,
    /// No local invoice carries the correlation key
    NoMatch,
    /// Invoice was already paid
    AlreadyPaid,
}

/// Which ingestion path produced the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplySource {
    /// Provider push
    Webhook,
    /// Reconciliation sweep
    Sweep,
}

impl ApplySource {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Sweep => "sweep",
        }
    }
}

/// Result of applying one record
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// What happened
    pub outcome: ApplyOutcome,
    /// The audit entry appended, if the change was audited
    pub audit: Option<AuditEntry>,
}

impl Applied {
    /// A no-op
    pub fn skipped() -> Self {
        Self {
            outcome: ApplyOutcome::Skipped,
            audit: None,
        }
    }
}

/// Storage and audit handles the appliers write through
#[derive(Clone)]
pub struct ApplyContext {
    /// Record repositories
    pub store: Arc<dyn Datastore>,
    /// Audit trail
    pub audit: Arc<dyn AuditLog>,
}

impl ApplyContext {
    /// Bundle a datastore and audit log
    pub fn new(store: Arc<dyn Datastore>, audit: Arc<dyn AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Append `entry`, turning a failure into a fatal [`ApplyError::Audit`]
    async fn record(
        &self,
        resource: &'static str,
        outcome: ApplyOutcome,
        entry: Option<AuditEntry>,
    ) -> Result<Applied, ApplyError> {
        if let Some(entry) = &entry {
            self.audit.append(entry).await.map_err(|e| {
                tracing::error!(
                    action = %entry.action,
                    resource_id = %entry.resource_id,
                    error = %e,
                    "Audit append failed after state change"
                );
                ApplyError::Audit(e)
            })?;
        }
        global_metrics().record_apply(resource, outcome);
        Ok(Applied {
            outcome,
            audit: entry,
        })
    }
}

impl fmt::Debug for ApplyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyContext").finish_non_exhaustive()
    }
}
