//! Sweep bookkeeping and the single-run lock
//!
//! Holds the last run's outcome (used to derive the default window) and a
//! lock that keeps two sweeps from running at once. The store is injected
//! into the sweep; there is no process-wide singleton.
//!
//! [`FileSyncStateStore`] layout under its directory:
//!
//! ```text
//! state.json   last run summary, replaced atomically (temp + rename)
//! sync.lock    present while a sweep runs; created with O_EXCL
//! ```
//!
//! Each lock carries a random token. Removing the lock, whether releasing our
//! own or breaking an abandoned one, first renames it aside and checks the
//! token; a lock that turns out to belong to someone else is linked back.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::sweep::SyncResult;

/// Current sync bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStateSnapshot {
    /// When the last terminal run finished
    pub last_run_at: Option<DateTime<Utc>>,
    /// Whether that run succeeded
    pub last_run_success: Option<bool>,
    /// When the last successful run finished
    pub last_success_at: Option<DateTime<Utc>>,
    /// Summary of the last terminal run
    pub last_result: Option<SyncResult>,
    /// Whether a sweep currently holds the lock
    #[serde(default)]
    pub lock_held: bool,
}

impl SyncStateSnapshot {
    fn apply(&mut self, result: &SyncResult, at: DateTime<Utc>) {
        self.last_run_at = Some(at);
        self.last_run_success = Some(result.success);
        if result.success {
            self.last_success_at = Some(at);
        }
        self.last_result = Some(result.clone());
    }
}

/// Durable sweep state plus mutual exclusion
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Read the current state
    async fn get(&self) -> Result<SyncStateSnapshot, PersistenceError>;

    /// Take the lock; `false` if another holder has it
    async fn try_set_lock(&self) -> Result<bool, PersistenceError>;

    /// Give the lock back
    async fn release_lock(&self) -> Result<(), PersistenceError>;

    /// Record a terminal run
    async fn record_run(&self, result: &SyncResult) -> Result<(), PersistenceError>;
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local state with an atomic lock flag
#[derive(Debug, Default)]
pub struct InMemorySyncStateStore {
    lock: AtomicBool,
    state: RwLock<SyncStateSnapshot>,
}

impl InMemorySyncStateStore {
    /// Empty state, lock free
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with a previous state, e.g. a last success for window tests
    pub fn with_snapshot(snapshot: SyncStateSnapshot) -> Self {
        Self {
            lock: AtomicBool::new(false),
            state: RwLock::new(snapshot),
        }
    }
}

#[async_trait]
impl SyncStateStore for InMemorySyncStateStore {
    async fn get(&self) -> Result<SyncStateSnapshot, PersistenceError> {
        let mut snapshot = self.state.read().clone();
        snapshot.lock_held = self.lock.load(Ordering::SeqCst);
        Ok(snapshot)
    }

    async fn try_set_lock(&self) -> Result<bool, PersistenceError> {
        Ok(self
            .lock
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok())
    }

    async fn release_lock(&self) -> Result<(), PersistenceError> {
        self.lock.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn record_run(&self, result: &SyncResult) -> Result<(), PersistenceError> {
        self.state.write().apply(result, Utc::now());
        Ok(())
    }
}

// =============================================================================
// File-backed
// =============================================================================

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "sync.lock";

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    token: Uuid,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Result of removing the lock file on behalf of one token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockRemoval {
    Removed,
    /// The file belonged to another holder and was put back
    NotOurs,
    Missing,
}

/// State and lock persisted under a directory, shared across processes
#[derive(Debug)]
pub struct FileSyncStateStore {
    dir: PathBuf,
    lock_ttl: Duration,
    /// Token of the lock this instance holds
    held: Mutex<Option<Uuid>>,
}

impl FileSyncStateStore {
    /// Store under `dir`; locks older than `lock_ttl` are treated as abandoned
    pub fn new(dir: impl Into<PathBuf>, lock_ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            lock_ttl,
            held: Mutex::new(None),
        }
    }

    /// Directory holding the state and lock files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    async fn read_state(&self) -> Result<SyncStateSnapshot, PersistenceError> {
        match tokio::fs::read(self.state_path()).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SyncStateSnapshot::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_state(&self, state: &SyncStateSnapshot) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!("{STATE_FILE}.tmp"));
        let bytes = serde_json::to_vec_pretty(state)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, self.state_path()).await?;
        Ok(())
    }

    async fn create_lock(&self) -> std::io::Result<Uuid> {
        let info = LockInfo {
            token: Uuid::new_v4(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path())
            .await?;
        let bytes = serde_json::to_vec(&info).map_err(std::io::Error::other)?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        Ok(info.token)
    }

    /// Token in a lock file; `None` when the file is unreadable as a lock
    async fn lock_token(path: &Path) -> std::io::Result<Option<Uuid>> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice::<LockInfo>(&bytes)
            .ok()
            .map(|info| info.token))
    }

    /// Remove the lock file only if it still carries `expected`
    async fn remove_lock_if(&self, expected: Option<Uuid>) -> Result<LockRemoval, PersistenceError> {
        let aside = self
            .dir
            .join(format!("{LOCK_FILE}.{}.removing", Uuid::new_v4()));
        match tokio::fs::rename(self.lock_path(), &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockRemoval::Missing),
            Err(e) => return Err(e.into()),
        }

        let found = match Self::lock_token(&aside).await {
            Ok(token) => token,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if found == expected {
            tokio::fs::remove_file(&aside).await?;
            return Ok(LockRemoval::Removed);
        }

        // A hard link keeps the original mtime, so staleness is unchanged
        match tokio::fs::hard_link(&aside, self.lock_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!(path = %self.lock_path().display(), "Sync lock re-taken while being restored");
            }
            Err(e) => return Err(e.into()),
        }
        tokio::fs::remove_file(&aside).await?;
        Ok(LockRemoval::NotOurs)
    }

    async fn lock_is_stale(&self) -> Result<bool, PersistenceError> {
        let metadata = match tokio::fs::metadata(self.lock_path()).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();
        Ok(age >= self.lock_ttl)
    }
}

#[async_trait]
impl SyncStateStore for FileSyncStateStore {
    async fn get(&self) -> Result<SyncStateSnapshot, PersistenceError> {
        let mut snapshot = self.read_state().await?;
        snapshot.lock_held = tokio::fs::try_exists(self.lock_path()).await?;
        Ok(snapshot)
    }

    async fn try_set_lock(&self) -> Result<bool, PersistenceError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        match self.create_lock().await {
            Ok(token) => {
                *self.held.lock() = Some(token);
                return Ok(true);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        if !self.lock_is_stale().await? {
            debug!(path = %self.lock_path().display(), "Sync lock held");
            return Ok(false);
        }

        let observed = match Self::lock_token(&self.lock_path()).await {
            Ok(token) => Some(token),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(token) = observed {
            warn!(
                path = %self.lock_path().display(),
                ttl_secs = self.lock_ttl.as_secs(),
                "Breaking stale sync lock"
            );
            // Only the lock judged stale is removed; one a racing breaker
            // just created is put back and we back off
            if self.remove_lock_if(token).await? == LockRemoval::NotOurs {
                return Ok(false);
            }
        }

        match self.create_lock().await {
            Ok(token) => {
                *self.held.lock() = Some(token);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_lock(&self) -> Result<(), PersistenceError> {
        let held = self.held.lock().take();
        let Some(token) = held else {
            return Ok(());
        };
        if self.remove_lock_if(Some(token)).await? == LockRemoval::NotOurs {
            warn!(
                path = %self.lock_path().display(),
                "Sync lock was broken while held; leaving the new holder's lock"
            );
        }
        Ok(())
    }

    async fn record_run(&self, result: &SyncResult) -> Result<(), PersistenceError> {
        let mut state = self.read_state().await?;
        state.apply(result, Utc::now());
        state.lock_held = false;
        self.write_state(&state).await
    }
}
