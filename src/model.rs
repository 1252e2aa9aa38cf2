//! Local records kept in sync with the provider
//!
//! These are the rows the appliers create and update. External identifiers
//! are the upsert keys; local `id`s are assigned on first sighting and never
//! change afterwards.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Appointment
// =============================================================================

/// Local appointment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    /// Requested, awaiting acceptance
    Pending,
    /// Accepted by the shop
    Confirmed,
    /// Took place
    Completed,
    /// Declined or cancelled by either side
    Cancelled,
    /// Customer did not turn up
    NoShow,
}

impl AppointmentStatus {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::NoShow => "no_show",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A booked appointment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    /// Local id
    pub id: Uuid,
    /// Provider booking id; `None` for appointments created locally and not yet synced
    pub external_booking_id: Option<String>,
    /// Local status
    pub status: AppointmentStatus,
    /// Start of the first segment
    pub start_at: DateTime<Utc>,
    /// Start plus the summed segment durations
    pub end_at: DateTime<Utc>,
    /// Provider customer id
    pub customer_ref: Option<String>,
    /// Provider-side modification time of the last applied version
    #[serde(default)]
    pub provider_updated_at: Option<DateTime<Utc>>,
    /// Last local write
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Payment
// =============================================================================

/// Local payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Not settled yet
    Pending,
    /// Settled
    Completed,
    /// Failed or cancelled
    Failed,
    /// Money returned
    Refunded,
}

impl PaymentStatus {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Terminal success: the only state in which an unseen payment is created
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment taken through the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    /// Local id
    pub id: Uuid,
    /// Provider payment id, once known
    pub external_payment_id: Option<String>,
    /// Shop-side reference recorded at checkout
    pub reference_id: Option<String>,
    /// Major units, e.g. `75.00`
    pub amount: Decimal,
    /// ISO 4217 code
    pub currency: String,
    /// Local status
    pub status: PaymentStatus,
    /// Provider object as last applied
    pub raw_payload: serde_json::Value,
    /// Provider-side modification time of the last applied version
    #[serde(default)]
    pub provider_updated_at: Option<DateTime<Utc>>,
    /// Last local write
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Identifier used for audit entries: external id, then reference, then local id
    pub fn audit_id(&self) -> String {
        self.external_payment_id
            .clone()
            .or_else(|| self.reference_id.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

// =============================================================================
// Invoice
// =============================================================================

/// Local invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Awaiting payment
    Open,
    /// Settled through the provider
    Paid,
}

/// An invoice issued by the shop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    /// Local id
    pub id: Uuid,
    /// Exact key stored at creation time and matched against provider invoices
    pub correlation_key: String,
    /// Local status
    pub status: InvoiceStatus,
    /// Last local write
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Create an open invoice awaiting payment
    pub fn open(correlation_key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_key: correlation_key.into(),
            status: InvoiceStatus::Open,
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// Sync runs
// =============================================================================

/// Half-open time range `[start, end)` a sweep reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    /// Inclusive lower bound
    pub start: DateTime<Utc>,
    /// Exclusive upper bound
    pub end: DateTime<Utc>,
}

impl SyncWindow {
    /// Create a window
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window reaching `lookback` into the past from `anchor` and `lookahead` past `now`
    pub fn around(
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
        lookback: Duration,
        lookahead: Duration,
    ) -> Self {
        Self {
            start: anchor - lookback,
            end: now + lookahead,
        }
    }

    /// Whether `at` falls inside the window
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    /// A window must span a positive amount of time
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }
}

/// Per-run tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    /// Bookings that went through the applier without error
    pub synced: u64,
    /// New local appointments
    pub created: u64,
    /// Changed local appointments
    pub updated: u64,
    /// Applier no-ops plus bookings outside the window
    pub skipped: u64,
}

/// One record that failed to apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    /// Provider id of the failed record
    pub external_id: String,
    /// What went wrong
    pub message: String,
}

/// A terminal reconciliation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    /// Run id
    pub id: Uuid,
    /// Reconciled range start
    pub window_start: DateTime<Utc>,
    /// Reconciled range end, exclusive
    pub window_end: DateTime<Utc>,
    /// When the run took the lock
    pub started_at: DateTime<Utc>,
    /// Set once the run is sealed
    pub finished_at: Option<DateTime<Utc>>,
    /// `true` when `errors` is empty
    pub success: bool,
    /// Per-run tallies
    pub counts: SyncCounts,
    /// Records that failed to apply
    pub errors: Vec<ItemError>,
}

impl SyncRun {
    /// Start a run over `window`
    pub fn begin(window: SyncWindow, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            window_start: window.start,
            window_end: window.end,
            started_at,
            finished_at: None,
            success: false,
            counts: SyncCounts::default(),
            errors: Vec::new(),
        }
    }

    /// The window this run covers
    pub fn window(&self) -> SyncWindow {
        SyncWindow::new(self.window_start, self.window_end)
    }

    /// Seal the run; it succeeds only if no item failed
    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
        self.success = self.errors.is_empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_contains_is_half_open() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let window = SyncWindow::new(start, end);

        assert!(window.contains(start));
        assert!(window.contains(end - Duration::seconds(1)));
        assert!(!window.contains(end));
        assert!(!window.contains(start - Duration::seconds(1)));
        assert!(window.is_valid());
        assert!(!SyncWindow::new(end, start).is_valid());
    }

    #[test]
    fn test_run_success_tracks_errors() {
        let now = Utc::now();
        let mut run = SyncRun::begin(SyncWindow::new(now, now + Duration::days(1)), now);
        run.finish(now);
        assert!(run.success);

        let mut run = SyncRun::begin(SyncWindow::new(now, now + Duration::days(1)), now);
        run.errors.push(ItemError {
            external_id: "bk-5".into(),
            message: "boom".into(),
        });
        run.finish(now);
        assert!(!run.success);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&AppointmentStatus::NoShow).unwrap(),
            "\"no_show\""
        );
        assert_eq!(PaymentStatus::Completed.to_string(), "completed");
        assert!(PaymentStatus::Completed.is_terminal_success());
        assert!(!PaymentStatus::Refunded.is_terminal_success());
    }

    #[test]
    fn test_payment_audit_id_fallback() {
        let mut payment = Payment {
            id: Uuid::new_v4(),
            external_payment_id: None,
            reference_id: Some("tr-1".into()),
            amount: Decimal::new(7500, 2),
            currency: "USD".into(),
            status: PaymentStatus::Pending,
            raw_payload: serde_json::Value::Null,
            provider_updated_at: None,
            updated_at: Utc::now(),
        };
        assert_eq!(payment.audit_id(), "tr-1");
        payment.external_payment_id = Some("pay-9".into());
        assert_eq!(payment.audit_id(), "pay-9");
    }
}
