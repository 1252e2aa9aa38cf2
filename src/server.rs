//! HTTP server assembly
//!
//! Merges the webhook endpoint with the operator endpoints and wraps both in
//! request tracing.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::apply::ApplyContext;
use crate::config::WebhookConfig;
use crate::handlers::{status_router, ServiceStats, StatusState};
use crate::sync_state::SyncStateStore;
use crate::webhook::{webhook_router, WebhookState};

/// Build the full application router
pub fn build_router(
    webhook: &WebhookConfig,
    ctx: ApplyContext,
    sync_state: Arc<dyn SyncStateStore>,
    stats: Arc<ServiceStats>,
) -> Router {
    let status = StatusState {
        stats: stats.clone(),
        sync_state,
        store: ctx.store.clone(),
    };

    webhook_router(WebhookState::new(webhook, ctx, stats))
        .merge(status_router(status))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Serve `router` on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = ?listener.local_addr().ok(), "HTTP server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
