//! `POST /webhooks/provider`
//!
//! ```text
//! raw body ──▶ verify signature ──✗──▶ 401 (no parsing, no writes)
//!                  │
//!                  ▼
//!            parse envelope ──✗──▶ log, 200
//!                  │
//!                  ▼
//!            dedupe event_id ──seen──▶ 200
//!                  │
//!                  ▼
//!            route to applier ──✗──▶ log, forget event_id, 200
//!                  │
//!                  ▼
//!                 200 {"received": true}
//! ```
//!
//! Once the signature checks out the provider always gets a 200: processing
//! failures are logged and counted, and the sweep repairs whatever a failed
//! delivery missed.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::apply::ApplyContext;
use crate::config::WebhookConfig;
use crate::handlers::ServiceStats;
use crate::metrics::global_metrics;
use crate::webhook::events::{EventEnvelope, WebhookEvent};
use crate::webhook::idempotency::{DeliveryStatus, IdempotencyStore, InMemoryIdempotencyStore};
use crate::webhook::router::{EventRouter, RouteOutcome};
use crate::webhook::signature::SignatureVerifier;

/// Path the provider posts deliveries to
pub const WEBHOOK_PATH: &str = "/webhooks/provider";

/// Shared state for the webhook endpoint
#[derive(Clone)]
pub struct WebhookState {
    verifier: Option<SignatureVerifier>,
    signature_header: String,
    router: EventRouter,
    dedupe: Arc<dyn IdempotencyStore>,
    stats: Arc<ServiceStats>,
}

impl WebhookState {
    /// Build from config; a missing secret is tolerated here and answered with 500 per request
    pub fn new(config: &WebhookConfig, ctx: ApplyContext, stats: Arc<ServiceStats>) -> Self {
        let verifier = SignatureVerifier::from_config(config).ok();
        if verifier.is_none() {
            warn!("No webhook secret configured; deliveries will be refused with 500");
        }
        Self {
            verifier,
            signature_header: config.signature_header.to_ascii_lowercase(),
            router: EventRouter::new(ctx),
            dedupe: Arc::new(InMemoryIdempotencyStore::new(
                config.dedupe_ttl,
                config.dedupe_capacity,
            )),
            stats,
        }
    }

    /// Swap the dedupe store
    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.dedupe = store;
        self
    }
}

fn received() -> Response {
    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}

/// Handle one delivery
pub async fn webhook_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let response = handle(&state, &headers, &body).await;
    state.stats.record_webhook(started.elapsed());
    response
}

async fn handle(state: &WebhookState, headers: &HeaderMap, body: &[u8]) -> Response {
    let Some(verifier) = &state.verifier else {
        error!("Webhook received but no signing secret is configured");
        global_metrics().record_webhook_rejected("not_configured");
        state.stats.record_error();
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "webhook secret not configured" })),
        )
            .into_response();
    };

    let signature = headers
        .get(state.signature_header.as_str())
        .and_then(|v| v.to_str().ok());
    match verifier.verify(body, signature) {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                has_signature = signature.is_some(),
                body_len = body.len(),
                "Rejected webhook with invalid signature"
            );
            global_metrics().record_webhook_rejected("signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "invalid signature" })),
            )
                .into_response();
        }
        Err(e) => {
            error!(error = %e, "Webhook verifier misconfigured");
            global_metrics().record_webhook_rejected("not_configured");
            state.stats.record_error();
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "webhook secret not configured" })),
            )
                .into_response();
        }
    }

    let envelope = match EventEnvelope::from_bytes(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Verified webhook with undecodable envelope");
            global_metrics().record_webhook_rejected("malformed");
            return received();
        }
    };
    global_metrics().record_webhook(&envelope.event_type);

    let event_id = envelope.event_id.clone();
    if let Some(id) = &event_id {
        match state.dedupe.check_and_record(id).await {
            Ok(DeliveryStatus::New) => {}
            Ok(status) => {
                debug!(event_id = %id, ?status, "Duplicate delivery acknowledged");
                global_metrics().record_webhook_duplicate();
                return received();
            }
            Err(e) => warn!(event_id = %id, error = %e, "Dedupe check failed, processing anyway"),
        }
    }

    let event = match WebhookEvent::from_envelope(&envelope) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                event_type = %envelope.event_type,
                event_id = ?event_id,
                error = %e,
                "Dropping webhook with invalid payload"
            );
            global_metrics().record_error("invalid_payload");
            state.stats.record_error();
            // Redelivering the same bytes cannot succeed
            finish(state, event_id.as_deref(), None).await;
            return received();
        }
    };

    match state.router.route(&event).await {
        Ok(RouteOutcome::Applied { resource, outcome }) => {
            info!(
                event_type = %envelope.event_type,
                event_id = ?event_id,
                resource,
                outcome = %outcome,
                "Webhook applied"
            );
            finish(state, event_id.as_deref(), None).await;
        }
        Ok(RouteOutcome::Ignored { event_type }) => {
            debug!(event_type = %event_type, "Webhook ignored");
            finish(state, event_id.as_deref(), None).await;
        }
        Err(e) => {
            error!(
                event_type = %envelope.event_type,
                event_id = ?event_id,
                fatal = e.is_fatal(),
                error = %e,
                "Webhook processing failed"
            );
            global_metrics().record_error(if e.is_fatal() { "audit" } else { "apply" });
            state.stats.record_error();
            finish(state, event_id.as_deref(), Some(&e.to_string())).await;
        }
    }

    received()
}

/// Settle the dedupe entry: remember on success, forget on failure
async fn finish(state: &WebhookState, event_id: Option<&str>, failure: Option<&str>) {
    let Some(id) = event_id else {
        return;
    };
    let result = match failure {
        None => state.dedupe.mark_completed(id).await,
        Some(reason) => state.dedupe.mark_failed(id, reason).await,
    };
    if let Err(e) = result {
        warn!(event_id = %id, error = %e, "Failed to update dedupe window");
    }
}

/// Router exposing the webhook endpoint
pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(webhook_handler))
        .with_state(state)
}
