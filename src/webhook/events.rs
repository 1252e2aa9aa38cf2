//! Webhook event envelope and typed events
//!
//! ```json
//! {
//!   "type": "payment.updated",
//!   "event_id": "6a8f5f28-...",
//!   "created_at": "2026-03-01T12:00:00Z",
//!   "data": { "type": "payment", "id": "pay-1", "object": { "payment": { ... } } }
//! }
//! ```
//!
//! The object may be wrapped under its resource name (`{"payment": {...}}`)
//! or sent bare; both decode.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::{ExternalBooking, ExternalCheckout, ExternalInvoice, ExternalPayment};

/// Envelope or object could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid webhook payload: {0}")]
pub struct InvalidPayload(pub String);

/// Event types this service acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// `payment.created`
    PaymentCreated,
    /// `payment.updated`
    PaymentUpdated,
    /// `invoice.payment_made`
    InvoicePaymentMade,
    /// `checkout.created`
    CheckoutCreated,
    /// `checkout.updated`
    CheckoutUpdated,
    /// `booking.created`
    BookingCreated,
    /// `booking.updated`
    BookingUpdated,
    /// Anything else; logged and dropped
    Unknown,
}

impl FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "payment.created" => Self::PaymentCreated,
            "payment.updated" => Self::PaymentUpdated,
            "invoice.payment_made" => Self::InvoicePaymentMade,
            "checkout.created" => Self::CheckoutCreated,
            "checkout.updated" => Self::CheckoutUpdated,
            "booking.created" => Self::BookingCreated,
            "booking.updated" => Self::BookingUpdated,
            _ => Self::Unknown,
        })
    }
}

impl EventType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentCreated => "payment.created",
            Self::PaymentUpdated => "payment.updated",
            Self::InvoicePaymentMade => "invoice.payment_made",
            Self::CheckoutCreated => "checkout.created",
            Self::CheckoutUpdated => "checkout.updated",
            Self::BookingCreated => "booking.created",
            Self::BookingUpdated => "booking.updated",
            Self::Unknown => "unknown",
        }
    }

    /// Key under which the object is wrapped in `data.object`
    fn object_key(&self) -> Option<&'static str> {
        match self {
            Self::PaymentCreated | Self::PaymentUpdated => Some("payment"),
            Self::InvoicePaymentMade => Some("invoice"),
            Self::CheckoutCreated | Self::CheckoutUpdated => Some("checkout"),
            Self::BookingCreated | Self::BookingUpdated => Some("booking"),
            Self::Unknown => None,
        }
    }
}

/// Raw delivery envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event type string, e.g. `payment.updated`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Delivery-stable event id used for dedupe
    #[serde(default)]
    pub event_id: Option<String>,
    /// When the provider produced the event
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Merchant the event belongs to
    #[serde(default)]
    pub merchant_id: Option<String>,
    /// Payload
    #[serde(default)]
    pub data: EventData,
}

/// `data` member of the envelope
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventData {
    /// Resource kind
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    /// Resource id
    #[serde(default)]
    pub id: Option<String>,
    /// The resource itself
    #[serde(default)]
    pub object: serde_json::Value,
}

impl EventEnvelope {
    /// Decode the envelope from the raw body
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidPayload> {
        serde_json::from_slice(bytes).map_err(|e| InvalidPayload(e.to_string()))
    }

    /// Typed event type
    pub fn typed_event_type(&self) -> EventType {
        match EventType::from_str(&self.event_type) {
            Ok(t) => t,
            Err(never) => match never {},
        }
    }

    /// The resource JSON, unwrapped from its resource key when present
    pub fn object(&self) -> &serde_json::Value {
        let wrapped = self
            .typed_event_type()
            .object_key()
            .and_then(|key| self.data.object.get(key));
        wrapped.unwrap_or(&self.data.object)
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T, InvalidPayload> {
        serde_json::from_value(self.object().clone())
            .map_err(|e| InvalidPayload(format!("{}: {e}", self.event_type)))
    }
}

/// A decoded event
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    /// Payment created or updated
    Payment {
        /// Decoded payment object
        payment: ExternalPayment,
        /// The object as delivered, kept on the stored payment
        raw: serde_json::Value,
    },
    /// A payment was made against an invoice
    InvoicePaid(ExternalInvoice),
    /// Terminal checkout progressed
    Checkout {
        /// Decoded checkout object
        checkout: ExternalCheckout,
        /// The object as delivered
        raw: serde_json::Value,
    },
    /// Booking created or updated
    Booking(ExternalBooking),
    /// Not acted on
    Unknown {
        /// Type string from the envelope
        event_type: String,
    },
}

impl WebhookEvent {
    /// Decode the typed event from an envelope
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self, InvalidPayload> {
        Ok(match envelope.typed_event_type() {
            EventType::PaymentCreated | EventType::PaymentUpdated => Self::Payment {
                payment: envelope.decode()?,
                raw: envelope.object().clone(),
            },
            EventType::InvoicePaymentMade => Self::InvoicePaid(envelope.decode()?),
            EventType::CheckoutCreated | EventType::CheckoutUpdated => Self::Checkout {
                checkout: envelope.decode()?,
                raw: envelope.object().clone(),
            },
            EventType::BookingCreated | EventType::BookingUpdated => {
                Self::Booking(envelope.decode()?)
            }
            EventType::Unknown => Self::Unknown {
                event_type: envelope.event_type.clone(),
            },
        })
    }

    /// Parse a raw body straight to a typed event
    pub fn parse(raw_body: &[u8]) -> Result<Self, InvalidPayload> {
        Self::from_envelope(&EventEnvelope::from_bytes(raw_body)?)
    }

    /// Resource kind this event routes to
    pub fn resource(&self) -> &'static str {
        match self {
            Self::Payment { .. } | Self::Checkout { .. } => "payment",
            Self::InvoicePaid(_) => "invoice",
            Self::Booking(_) => "booking",
            Self::Unknown { .. } => "unknown",
        }
    }
}
