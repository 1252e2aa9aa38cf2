//! Error types for shop-sync
//!
//! This module provides the error hierarchy for both ingestion paths using
//! `thiserror`. Each component owns a focused error enum; the crate-level
//! [`Error`] wraps them for callers that do not care which layer failed.
//!
//! | Kind | Type | Handling |
//! |------|------|----------|
//! | Configuration | [`ConfigError`] | fatal at startup or first use |
//! | Verification | [`Error::Verification`] | webhook rejected with 401 |
//! | Transient provider | [`ProviderError::RateLimited`], [`ProviderError::Transient`] | retried with backoff |
//! | Undecodable page | [`ProviderError::Decode`] | not retried, aborts the sweep |
//! | Fatal provider | [`SyncError::FatalProvider`] | aborts the sweep |
//! | Item apply | [`ApplyError`] | captured into the run's `errors[]` |
//! | Persistence | [`PersistenceError`] | fatal for the triggering operation |

use std::time::Duration;

use thiserror::Error;

/// The main error type for shop-sync operations
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Webhook signature did not verify
    #[error("Webhook verification failed: {0}")]
    Verification(String),

    /// Provider API errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Reconciliation sweep errors
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// A single record could not be applied
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Audit log or sync state could not be persisted
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Datastore errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The webhook signing secret is not configured
    #[error("webhook signing secret is not configured")]
    MissingSecret,

    /// A required environment variable is not set
    #[error("{0} environment variable not set")]
    MissingVar(&'static str),

    /// An environment variable has an unusable value
    #[error("invalid value for {name}: {message}")]
    Invalid {
        /// Variable or setting name
        name: &'static str,
        /// What was wrong with it
        message: String,
    },
}

/// Errors returned by the provider API client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Credentials were rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The provider asked us to slow down
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Server-suggested wait, when one was sent
        retry_after: Option<Duration>,
    },

    /// The requested resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Timeouts, connection failures and 5xx responses
    #[error("transient failure: {0}")]
    Transient(String),

    /// A 2xx body that does not match the expected shape
    #[error("undecodable response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Whether the failed call may succeed if retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }

    /// Server-suggested wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Reconciliation sweep errors
#[derive(Error, Debug)]
pub enum SyncError {
    /// Another run holds the sync lock
    #[error("a sync run is already in progress")]
    AlreadyRunning,

    /// The sweep could not reach the provider reliably
    #[error("provider failure during {stage}: {source}")]
    FatalProvider {
        /// Which phase of the sweep failed
        stage: &'static str,
        /// The last provider error observed
        #[source]
        source: ProviderError,
    },

    /// The requested window is empty or inverted
    #[error("invalid sync window: {0}")]
    InvalidWindow(String),

    /// Shutdown was requested between page fetches
    #[error("sync run cancelled")]
    Cancelled,

    /// Sync state, run history or audit writes failed
    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    /// Run history could not be written
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

/// Failure applying one external record
#[derive(Error, Debug)]
pub enum ApplyError {
    /// The record failed local validation
    #[error("validation failed: {0}")]
    Validation(String),

    /// The provider sent a status we cannot map
    #[error("unknown {resource} status '{value}'")]
    UnknownStatus {
        /// Resource kind (booking, payment)
        resource: &'static str,
        /// Raw provider status
        value: String,
    },

    /// The datastore rejected the write
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    /// The audit entry for the change could not be written
    #[error("audit failure: {0}")]
    Audit(#[from] PersistenceError),
}

impl ApplyError {
    /// Audit failures abort the triggering operation instead of being collected
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Audit(_))
    }
}

/// Durable write failures for the audit log and sync state
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Another live process owns the file
    #[error("{} is in use by process {pid}", .path.display())]
    InUse {
        /// The claimed file
        path: std::path::PathBuf,
        /// Owning process
        pid: u32,
    },

    /// Any other backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// Datastore errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique constraint rejected an insert
    #[error("{resource} with key '{key}' already exists")]
    Conflict {
        /// Resource kind
        resource: &'static str,
        /// The conflicting key
        key: String,
    },

    /// An update targeted a record that does not exist
    #[error("{resource} '{id}' not found")]
    NotFound {
        /// Resource kind
        resource: &'static str,
        /// Local id
        id: String,
    },

    /// Any other backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type alias for shop-sync operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config(ConfigError::MissingVar("SHOP_SYNC_WEBHOOK_SECRET"));
        assert!(err.to_string().contains("SHOP_SYNC_WEBHOOK_SECRET"));
    }

    #[test]
    fn test_provider_error_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(ProviderError::Transient("timeout".into()).is_transient());
        assert!(!ProviderError::Unauthorized("bad token".into()).is_transient());
        assert!(!ProviderError::NotFound("/v2/bookings".into()).is_transient());
        assert!(!ProviderError::Decode("expected an object".into()).is_transient());

        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_fatal_provider_display() {
        let err = SyncError::FatalProvider {
            stage: "bookings",
            source: ProviderError::Transient("503".into()),
        };
        assert_eq!(
            err.to_string(),
            "provider failure during bookings: transient failure: 503"
        );
    }

    #[test]
    fn test_apply_error_fatality() {
        let audit = ApplyError::Audit(PersistenceError::Backend("disk full".into()));
        assert!(audit.is_fatal());
        assert!(!ApplyError::Validation("end before start".into()).is_fatal());
    }

    #[test]
    fn test_store_conflict_display() {
        let err = StoreError::Conflict {
            resource: "appointment",
            key: "bk-1".into(),
        };
        assert_eq!(err.to_string(), "appointment with key 'bk-1' already exists");
    }
}
