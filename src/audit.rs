//! Append-only audit trail
//!
//! Every state change made by an applier is recorded here. Entries are never
//! mutated or deleted, so the entry count only grows. A failed append is
//! returned to the caller as a [`PersistenceError`]; appliers propagate it so
//! that no audited change is silently lost.
//!
//! Two backends are provided:
//!
//! - [`InMemoryAuditLog`] for tests and embedded use
//! - [`JsonlAuditLog`] which appends one JSON object per line to a file

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::PersistenceError;

/// A single audited action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// What happened, e.g. `payment_webhook_received`
    pub action: String,
    /// Resource kind (`payment`, `invoice`, `appointment`)
    pub resource_type: String,
    /// External identifier of the affected resource when it has one
    pub resource_id: String,
    /// Free-form context such as before/after status
    pub details: serde_json::Value,
    /// When the entry was produced
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Build an entry stamped with the current time
    pub fn new(
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}

/// Audit log storage
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append an entry; an error means the entry was not recorded
    async fn append(&self, entry: &AuditEntry) -> Result<(), PersistenceError>;

    /// The most recent `limit` entries, oldest first
    async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, PersistenceError>;
}

/// In-memory audit log
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<(), PersistenceError> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, PersistenceError> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries[skip..].to_vec())
    }
}

/// File-backed audit log, one JSON object per line
///
/// Each append is flushed and synced before returning so an acknowledged
/// entry survives a crash.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    /// Serializes appends so lines never interleave
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    /// Create a log writing to `path`; the file is created on first append
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;

        debug!(
            action = %entry.action,
            resource_id = %entry.resource_id,
            "Audit entry appended"
        );
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, PersistenceError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
        let skip = lines.len().saturating_sub(limit);
        lines[skip..]
            .iter()
            .map(|line| serde_json::from_str(line).map_err(PersistenceError::from))
            .collect()
    }
}
