//! Provider wire types
//!
//! Only the fields reconciliation needs are modeled. Unknown fields are
//! ignored so provider schema growth does not break decoding.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::SyncWindow;

/// Amount in minor units (cents) plus ISO 4217 currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// Minor units
    pub amount: i64,
    /// Currency code, e.g. `USD`
    pub currency: String,
}

// =============================================================================
// Bookings
// =============================================================================

/// A booking as returned by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalBooking {
    /// Provider booking id
    pub id: String,
    /// Provider status vocabulary (`ACCEPTED`, `NO_SHOW`, ...)
    pub status: String,
    /// Start of the first segment
    pub start_at: DateTime<Utc>,
    /// Customer the booking belongs to
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Bookable services making up the appointment
    #[serde(default)]
    pub appointment_segments: Vec<AppointmentSegment>,
    /// Provider-side modification time
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version
    #[serde(default)]
    pub version: Option<i64>,
}

impl ExternalBooking {
    /// Total booked duration across all segments; `None` when it overflows
    pub fn duration(&self) -> Option<Duration> {
        let minutes = self
            .appointment_segments
            .iter()
            .try_fold(0i64, |total, s| total.checked_add(s.duration_minutes))?;
        Duration::try_minutes(minutes)
    }

    /// Start plus total segment duration; `None` when it leaves the representable range
    pub fn end_at(&self) -> Option<DateTime<Utc>> {
        self.start_at.checked_add_signed(self.duration()?)
    }
}

/// One service within a booking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentSegment {
    /// Length of the service in minutes
    #[serde(default)]
    pub duration_minutes: i64,
    /// Staff member performing the service
    #[serde(default)]
    pub team_member_id: Option<String>,
    /// Service being booked
    #[serde(default)]
    pub service_variation_id: Option<String>,
}

/// A bookable staff member profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    /// Team member id used to filter bookings
    pub team_member_id: String,
    /// Display name
    #[serde(default)]
    pub display_name: Option<String>,
    /// Whether customers can book this resource
    #[serde(default)]
    pub is_bookable: bool,
}

/// Parameters for one bookings listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingQuery {
    /// Time range to list
    pub window: SyncWindow,
    /// Restrict to bookings with this team member; `None` lists the whole location
    pub team_member_id: Option<String>,
}

impl BookingQuery {
    /// Location-wide query
    pub fn location(window: SyncWindow) -> Self {
        Self {
            window,
            team_member_id: None,
        }
    }

    /// Query scoped to one resource profile
    pub fn for_resource(window: SyncWindow, profile: &ResourceProfile) -> Self {
        Self {
            window,
            team_member_id: Some(profile.team_member_id.clone()),
        }
    }
}

/// One page of bookings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingPage {
    /// Bookings on this page
    pub items: Vec<ExternalBooking>,
    /// Listed entries that could not be decoded into a booking
    pub rejected: Vec<RejectedBooking>,
    /// Cursor for the next page, `None` on the last page
    pub next_page_token: Option<String>,
}

/// A listed booking the client could not decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedBooking {
    /// The entry's `id`, when it carried a string one
    pub id: Option<String>,
    /// Why decoding failed
    pub message: String,
}

impl RejectedBooking {
    /// Decode one raw listing entry, keeping the id of entries that fail
    pub fn decode(raw: serde_json::Value) -> Result<ExternalBooking, Self> {
        let id = raw.get("id").and_then(|v| v.as_str()).map(str::to_string);
        serde_json::from_value(raw).map_err(|e| Self {
            id,
            message: e.to_string(),
        })
    }
}

// =============================================================================
// Payments, invoices and checkouts
// =============================================================================

/// A payment object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalPayment {
    /// Provider payment id
    pub id: String,
    /// Shop-side reference (e.g. transaction number) set at checkout
    #[serde(default)]
    pub reference_id: Option<String>,
    /// Provider status (`COMPLETED`, `PENDING`, ...)
    pub status: String,
    /// Amount charged
    pub amount_money: Money,
    /// Provider-side modification time
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// An invoice object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalInvoice {
    /// Provider invoice id
    pub id: String,
    /// Human-facing invoice number
    #[serde(default)]
    pub invoice_number: Option<String>,
    /// Provider invoice status
    #[serde(default)]
    pub status: Option<String>,
}

impl ExternalInvoice {
    /// Key matched against locally stored correlation keys
    pub fn correlation_key(&self) -> &str {
        self.invoice_number.as_deref().unwrap_or(&self.id)
    }
}

/// A terminal checkout object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalCheckout {
    /// Provider checkout id
    pub id: String,
    /// Shop-side reference passed when the checkout was created
    #[serde(default)]
    pub reference_id: Option<String>,
    /// Checkout status (`PENDING`, `COMPLETED`, `CANCELED`, ...)
    pub status: String,
    /// Amount requested
    pub amount_money: Money,
    /// Payments produced by this checkout
    #[serde(default)]
    pub payment_ids: Vec<String>,
    /// Provider-side modification time
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}
