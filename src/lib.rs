//! Shop Sync - Webhook Ingestion & Reconciliation for a Scheduling/Payments Provider
//!
//! This crate keeps a shop's local appointments, payments and invoices
//! consistent with an external provider. Two paths feed the same appliers:
//!
//! - **Webhooks**: signed provider notifications, verified and deduplicated
//!   before being routed to an applier
//! - **Sweep**: a periodic, lock-guarded reconciliation that pulls every
//!   booking in a time window and repairs what webhooks missed
//!
//! # Architecture
//!
//! ```text
//! Provider ──webhook──▶ Signature ──▶ Dedupe ──▶ EventRouter ─┐
//!                                                              ▼
//!                                                      ┌──────────────┐
//!                                                      │   Appliers   │──▶ Datastore
//!                                                      │ booking/pay/ │──▶ AuditLog
//!                                                      │   invoice    │
//!                                                      └──────────────┘
//!                                                              ▲
//! Provider ◀──list bookings── SweepJob (lock, window, retry) ──┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shop_sync::apply::ApplyContext;
//! use shop_sync::audit::InMemoryAuditLog;
//! use shop_sync::config::SyncConfig;
//! use shop_sync::provider::HttpProviderClient;
//! use shop_sync::store::InMemoryStore;
//! use shop_sync::sweep::SweepJob;
//! use shop_sync::sync_state::InMemorySyncStateStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::from_env()?;
//!     let ctx = ApplyContext::new(
//!         Arc::new(InMemoryStore::new()),
//!         Arc::new(InMemoryAuditLog::new()),
//!     );
//!     let provider = Arc::new(HttpProviderClient::new(&config.provider)?);
//!     let job = SweepJob::new(
//!         provider,
//!         ctx,
//!         Arc::new(InMemorySyncStateStore::new()),
//!         config.sweep.clone(),
//!     );
//!
//!     let result = job.run(None).await?;
//!     println!("synced {} bookings", result.synced);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod apply;
pub mod audit;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod model;
pub mod provider;
pub mod server;
pub mod store;
pub mod sweep;
pub mod sync_state;
pub mod webhook;

// Re-exports for convenience
pub use apply::{ApplyContext, ApplyOutcome, ApplySource};
pub use config::SyncConfig;
pub use error::{Error, Result};
pub use sweep::{SweepJob, SyncResult};
pub use webhook::{EventRouter, SignatureVerifier, WebhookEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
