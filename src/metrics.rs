//! Process-wide counters for webhook ingestion and reconciliation
//!
//! - Atomic counters for webhooks, sweeps and errors
//! - Labeled breakdowns for applier outcomes per resource
//! - A bounded ring buffer of sweep durations for percentiles
//! - Prometheus text export served at `/metrics`
//!
//! # Example
//!
//! ```rust,no_run
//! use shop_sync::metrics::global_metrics;
//! use std::time::Duration;
//!
//! global_metrics().record_webhook("payment.updated");
//! global_metrics().record_sweep(true, Duration::from_millis(840));
//!
//! let output = global_metrics().to_prometheus_format();
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};
use std::time::{Duration, Instant};

use crate::apply::ApplyOutcome;

/// Sweep duration samples kept for percentiles
const MAX_DURATION_SAMPLES: usize = 500;

/// Sync metrics collector
#[derive(Debug)]
pub struct Metrics {
    /// Webhook deliveries that passed verification
    pub webhooks_received_total: AtomicU64,
    /// Deliveries rejected before processing
    pub webhooks_rejected_total: AtomicU64,
    /// Deliveries acknowledged as already-seen
    pub webhooks_duplicate_total: AtomicU64,
    /// Sweeps that ran to a terminal result
    pub sweeps_total: AtomicU64,
    /// Sweeps that ended unsuccessfully
    pub sweeps_failed_total: AtomicU64,
    /// Sweeps refused because another was running
    pub sweeps_skipped_total: AtomicU64,
    /// Errors of any kind
    pub errors_total: AtomicU64,

    sweep_durations: RwLock<RingBuffer<Duration>>,
    webhooks_by_type: RwLock<BTreeMap<String, u64>>,
    rejections_by_reason: RwLock<BTreeMap<String, u64>>,
    applies_by_outcome: RwLock<BTreeMap<(String, ApplyOutcome), u64>>,
    errors_by_type: RwLock<BTreeMap<String, u64>>,
    start_time: RwLock<Option<Instant>>,
}

/// Fixed-capacity sample buffer, oldest overwritten first
#[derive(Debug, Clone)]
struct RingBuffer<T> {
    data: Vec<T>,
    capacity: usize,
    write_pos: usize,
    total_samples: u64,
}

impl<T: Clone + Ord> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            write_pos: 0,
            total_samples: 0,
        }
    }

    fn push(&mut self, value: T) {
        if self.data.len() < self.capacity {
            self.data.push(value);
        } else {
            self.data[self.write_pos] = value;
        }
        self.write_pos = (self.write_pos + 1) % self.capacity;
        self.total_samples += 1;
    }

    /// Nearest-rank percentile, `p` in `0.0..=1.0`
    fn percentile(&self, p: f64) -> Option<T> {
        if self.data.is_empty() {
            return None;
        }
        let mut sorted = self.data.clone();
        sorted.sort();
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted.get(idx).cloned()
    }
}

fn bump(map: &RwLock<BTreeMap<String, u64>>, key: &str) {
    if let Ok(mut map) = map.write() {
        *map.entry(key.to_string()).or_insert(0) += 1;
    }
}

impl Metrics {
    /// Create an empty collector
    pub fn new() -> Self {
        Self {
            webhooks_received_total: AtomicU64::new(0),
            webhooks_rejected_total: AtomicU64::new(0),
            webhooks_duplicate_total: AtomicU64::new(0),
            sweeps_total: AtomicU64::new(0),
            sweeps_failed_total: AtomicU64::new(0),
            sweeps_skipped_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            sweep_durations: RwLock::new(RingBuffer::new(MAX_DURATION_SAMPLES)),
            webhooks_by_type: RwLock::new(BTreeMap::new()),
            rejections_by_reason: RwLock::new(BTreeMap::new()),
            applies_by_outcome: RwLock::new(BTreeMap::new()),
            errors_by_type: RwLock::new(BTreeMap::new()),
            start_time: RwLock::new(None),
        }
    }

    /// A verified webhook delivery of `event_type`
    pub fn record_webhook(&self, event_type: &str) {
        self.webhooks_received_total.fetch_add(1, Ordering::Relaxed);
        bump(&self.webhooks_by_type, event_type);
    }

    /// A delivery rejected before processing (`signature`, `not_configured`, `malformed`)
    pub fn record_webhook_rejected(&self, reason: &str) {
        self.webhooks_rejected_total.fetch_add(1, Ordering::Relaxed);
        bump(&self.rejections_by_reason, reason);
    }

    /// A redelivery of an already-processed event
    pub fn record_webhook_duplicate(&self) {
        self.webhooks_duplicate_total.fetch_add(1, Ordering::Relaxed);
    }

    /// One applier result
    pub fn record_apply(&self, resource: &str, outcome: ApplyOutcome) {
        if let Ok(mut map) = self.applies_by_outcome.write() {
            *map.entry((resource.to_string(), outcome)).or_insert(0) += 1;
        }
    }

    /// A finished sweep
    pub fn record_sweep(&self, success: bool, duration: Duration) {
        self.sweeps_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.sweeps_failed_total.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut durations) = self.sweep_durations.write() {
            durations.push(duration);
        }
    }

    /// A sweep refused by the lock
    pub fn record_sweep_skipped(&self) {
        self.sweeps_skipped_total.fetch_add(1, Ordering::Relaxed);
    }

    /// An error of `error_type`
    pub fn record_error(&self, error_type: &str) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        bump(&self.errors_by_type, error_type);
    }

    /// Count recorded for `resource` with `outcome`
    pub fn apply_count(&self, resource: &str, outcome: ApplyOutcome) -> u64 {
        self.applies_by_outcome
            .read()
            .ok()
            .and_then(|map| map.get(&(resource.to_string(), outcome)).copied())
            .unwrap_or(0)
    }

    /// Seconds since [`init`], if it was called
    pub fn uptime(&self) -> Option<Duration> {
        self.start_time
            .read()
            .ok()
            .and_then(|start| start.map(|s| s.elapsed()))
    }

    /// Render in Prometheus text exposition format
    pub fn to_prometheus_format(&self) -> String {
        let mut out = String::new();

        let counters = [
            (
                "shop_sync_webhooks_received_total",
                "Verified webhook deliveries",
                &self.webhooks_received_total,
            ),
            (
                "shop_sync_webhooks_rejected_total",
                "Webhook deliveries rejected before processing",
                &self.webhooks_rejected_total,
            ),
            (
                "shop_sync_webhooks_duplicate_total",
                "Webhook redeliveries acknowledged without processing",
                &self.webhooks_duplicate_total,
            ),
            ("shop_sync_sweeps_total", "Completed sweeps", &self.sweeps_total),
            (
                "shop_sync_sweeps_failed_total",
                "Unsuccessful sweeps",
                &self.sweeps_failed_total,
            ),
            (
                "shop_sync_sweeps_skipped_total",
                "Sweeps refused because one was already running",
                &self.sweeps_skipped_total,
            ),
            ("shop_sync_errors_total", "Errors", &self.errors_total),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", value.load(Ordering::Relaxed));
        }

        if let Ok(map) = self.webhooks_by_type.read() {
            for (event_type, count) in map.iter() {
                let _ = writeln!(
                    out,
                    "shop_sync_webhooks_by_type_total{{type=\"{event_type}\"}} {count}"
                );
            }
        }
        if let Ok(map) = self.rejections_by_reason.read() {
            for (reason, count) in map.iter() {
                let _ = writeln!(
                    out,
                    "shop_sync_webhooks_rejected_by_reason_total{{reason=\"{reason}\"}} {count}"
                );
            }
        }
        if let Ok(map) = self.applies_by_outcome.read() {
            if !map.is_empty() {
                let _ = writeln!(out, "# TYPE shop_sync_applies_total counter");
            }
            for ((resource, outcome), count) in map.iter() {
                let _ = writeln!(
                    out,
                    "shop_sync_applies_total{{resource=\"{resource}\",outcome=\"{outcome}\"}} {count}"
                );
            }
        }
        if let Ok(map) = self.errors_by_type.read() {
            for (kind, count) in map.iter() {
                let _ = writeln!(out, "shop_sync_errors_by_type_total{{type=\"{kind}\"}} {count}");
            }
        }

        if let Ok(durations) = self.sweep_durations.read() {
            for (label, p) in [("p50", 0.5), ("p95", 0.95), ("p99", 0.99)] {
                if let Some(d) = durations.percentile(p) {
                    let _ = writeln!(out, "shop_sync_sweep_duration_{label}_ms {}", d.as_millis());
                }
            }
            let _ = writeln!(out, "shop_sync_sweep_duration_samples {}", durations.total_samples);
        }

        if let Some(uptime) = self.uptime() {
            let _ = writeln!(out, "shop_sync_uptime_seconds {}", uptime.as_secs());
        }

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get or initialize the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Initialize global metrics and start the uptime clock
pub fn init() {
    if let Ok(mut start_time) = global_metrics().start_time.write() {
        start_time.get_or_insert_with(Instant::now);
    }
}
