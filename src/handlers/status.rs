//! Operator endpoints: liveness, readiness, service status, sync status, metrics
//!
//! ```text
//! GET /health       ──▶ {"status":"healthy"}
//! GET /ready        ──▶ 200 when sync state is readable, 503 otherwise
//! GET /status       ──▶ uptime, webhook counters, memory, webhook latency
//! GET /sync/status  ──▶ last run bookkeeping + recent SyncRuns
//! GET /metrics      ──▶ Prometheus text
//! ```
//!
//! # Example Response (`/sync/status`)
//!
//! ```json
//! {
//!   "state": {
//!     "lastRunAt": "2026-03-01T12:00:04Z",
//!     "lastRunSuccess": true,
//!     "lastSuccessAt": "2026-03-01T12:00:04Z",
//!     "lockHeld": false
//!   },
//!   "recentRuns": [ { "id": "…", "success": true, "counts": { "synced": 42 } } ]
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, instrument, warn};

use crate::metrics::global_metrics;
use crate::model::SyncRun;
use crate::store::Datastore;
use crate::sync_state::{SyncStateSnapshot, SyncStateStore};

const DEFAULT_RECENT_RUNS: usize = 10;
const MAX_RECENT_RUNS: usize = 100;

// ============================================================================
// Response Types
// ============================================================================

/// Liveness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` while the process answers
    pub status: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

/// Service status with runtime counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Crate version
    pub version: String,
    /// Crate name
    pub name: String,
    /// Seconds since start
    pub uptime_seconds: u64,
    /// Webhook deliveries handled, any outcome
    pub webhooks_handled: u64,
    /// Errors recorded by handlers
    pub errors: u64,
    /// Process memory
    pub memory: MemoryMetrics,
    /// Webhook handling latency
    pub latency: WebhookLatency,
    /// `running` while the process answers
    pub status: String,
    /// RFC 3339 time the response was produced
    pub timestamp: String,
}

/// Memory usage from sysinfo
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMetrics {
    /// Resident set size in bytes
    pub rss_bytes: u64,
    /// Virtual memory in bytes
    pub virtual_bytes: u64,
}

/// Webhook handling latency in milliseconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookLatency {
    /// Deliveries measured
    pub deliveries: u64,
    /// Median
    pub p50_ms: f64,
    /// 99th percentile
    pub p99_ms: f64,
    /// Slowest delivery
    pub max_ms: f64,
}

/// Sync bookkeeping plus recent run history
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusResponse {
    /// Current sync state
    pub state: SyncStateSnapshot,
    /// Most recent runs, newest first
    pub recent_runs: Vec<SyncRun>,
}

/// `?limit=` for `/sync/status`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecentRunsQuery {
    /// Runs to return, capped at 100
    pub limit: Option<usize>,
}

// ============================================================================
// Service Stats
// ============================================================================

/// Counters shared by the webhook handler and `/status`
///
/// Latency lands in an HdrHistogram of microseconds, 1µs to 60s at three
/// significant figures; samples outside that range are dropped.
#[derive(Debug)]
pub struct ServiceStats {
    started: Instant,
    webhooks_handled: AtomicU64,
    errors: AtomicU64,
    latency: Mutex<Histogram<u64>>,
}

impl ServiceStats {
    /// Start counting now
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            webhooks_handled: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency: Mutex::new(
                Histogram::new_with_bounds(1, 60_000_000, 3)
                    .expect("static histogram bounds are valid"),
            ),
        }
    }

    /// Seconds since start
    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// One delivery handled in `elapsed`
    pub fn record_webhook(&self, elapsed: Duration) {
        self.webhooks_handled.fetch_add(1, Ordering::Relaxed);
        let _ = self.latency.lock().record(elapsed.as_micros() as u64);
    }

    /// Deliveries handled
    pub fn webhooks_handled(&self) -> u64 {
        self.webhooks_handled.load(Ordering::Relaxed)
    }

    /// Count an error and return the new total
    pub fn record_error(&self) -> u64 {
        self.errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Errors recorded
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Webhook latency percentiles
    pub fn webhook_latency(&self) -> WebhookLatency {
        let hist = self.latency.lock();
        let ms = |micros: u64| micros as f64 / 1000.0;
        WebhookLatency {
            deliveries: hist.len(),
            p50_ms: ms(hist.value_at_quantile(0.5)),
            p99_ms: ms(hist.value_at_quantile(0.99)),
            max_ms: ms(hist.max()),
        }
    }
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Handler State
// ============================================================================

/// Everything the operator endpoints read from
#[derive(Clone)]
pub struct StatusState {
    /// Service counters
    pub stats: Arc<ServiceStats>,
    /// Sweep bookkeeping
    pub sync_state: Arc<dyn SyncStateStore>,
    /// Run history
    pub store: Arc<dyn Datastore>,
}

fn collect_memory_metrics() -> MemoryMetrics {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    match system.process(pid) {
        Some(process) => MemoryMetrics {
            rss_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
        },
        None => {
            debug!("Could not find current process in sysinfo");
            MemoryMetrics::default()
        }
    }
}

// ============================================================================
// HTTP Handlers
// ============================================================================

/// `GET /health`
#[instrument(skip_all)]
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse::default()))
}

/// `GET /ready`: 503 when the sync state backend cannot be read
#[instrument(skip_all)]
pub async fn readiness_handler(State(state): State<StatusState>) -> impl IntoResponse {
    match state.sync_state.get().await {
        Ok(_) => (StatusCode::OK, Json(HealthResponse::default())),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable".to_string(),
                }),
            )
        }
    }
}

/// `GET /status`
#[instrument(skip_all)]
pub async fn status_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let response = StatusResponse {
        version: crate::VERSION.to_string(),
        name: crate::NAME.to_string(),
        uptime_seconds: state.stats.uptime_seconds(),
        webhooks_handled: state.stats.webhooks_handled(),
        errors: state.stats.error_count(),
        memory: collect_memory_metrics(),
        latency: state.stats.webhook_latency(),
        status: "running".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    (StatusCode::OK, Json(response))
}

/// `GET /sync/status?limit=N`
#[instrument(skip_all)]
pub async fn sync_status_handler(
    State(state): State<StatusState>,
    Query(query): Query<RecentRunsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECENT_RUNS)
        .min(MAX_RECENT_RUNS);

    let snapshot = match state.sync_state.get().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, "Failed to read sync state");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };
    let recent_runs = match state.store.recent_runs(limit).await {
        Ok(runs) => runs,
        Err(e) => {
            warn!(error = %e, "Failed to list sync runs");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    (
        StatusCode::OK,
        Json(SyncStatusResponse {
            state: snapshot,
            recent_runs,
        }),
    )
        .into_response()
}

/// `GET /metrics`
#[instrument(skip_all)]
pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        global_metrics().to_prometheus_format(),
    )
}

// ============================================================================
// Router Setup
// ============================================================================

/// Router with all operator endpoints
pub fn status_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(readiness_handler))
        .route("/status", get(status_handler))
        .route("/sync/status", get(sync_status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_default() {
        assert_eq!(HealthResponse::default().status, "healthy");
    }

    #[test]
    fn test_service_stats_counters() {
        let stats = ServiceStats::new();
        assert_eq!(stats.webhooks_handled(), 0);
        assert!(stats.uptime_seconds() < 1);

        for ms in [1, 2, 5, 10, 50] {
            stats.record_webhook(Duration::from_millis(ms));
        }
        assert_eq!(stats.webhooks_handled(), 5);

        let latency = stats.webhook_latency();
        assert_eq!(latency.deliveries, 5);
        assert!(latency.p50_ms > 0.0);
        assert!(latency.p99_ms >= latency.p50_ms);
        assert!((49.0..=51.0).contains(&latency.max_ms));

        assert_eq!(stats.record_error(), 1);
        assert_eq!(stats.error_count(), 1);
    }

    #[test]
    fn test_sync_status_serialization() {
        let response = SyncStatusResponse {
            state: SyncStateSnapshot::default(),
            recent_runs: Vec::new(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"recentRuns\":[]"));
        assert!(json.contains("\"lockHeld\":false"));
    }
}
