//! Provider webhook ingestion
//!
//! Verifies, parses, dedupes and routes provider push notifications to the
//! appliers. See [`handler`] for the request flow.

pub mod events;
pub mod handler;
pub mod idempotency;
pub mod router;
pub mod signature;

pub use events::{EventEnvelope, EventType, InvalidPayload, WebhookEvent};
pub use handler::{webhook_handler, webhook_router, WebhookState, WEBHOOK_PATH};
pub use idempotency::{DeliveryStatus, IdempotencyStore, InMemoryIdempotencyStore};
pub use router::{EventRouter, RouteOutcome};
pub use signature::{verify, SignatureVerifier};
