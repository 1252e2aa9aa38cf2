//! Dispatch of typed events to appliers
//!
//! | Event | Applier |
//! |-------|---------|
//! | `Payment` | payment |
//! | `Checkout` | payment (first produced payment id, checkout reference) |
//! | `InvoicePaid` | invoice |
//! | `Booking` | booking |
//! | `Unknown` | none, logged and dropped |

use tracing::{debug, instrument};

use crate::apply::{self, ApplyContext, ApplyOutcome, ApplySource, PaymentRecord};
use crate::error::ApplyError;
use crate::webhook::events::WebhookEvent;

/// What routing an event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// An applier ran
    Applied {
        /// Resource kind the applier owns
        resource: &'static str,
        /// Applier result
        outcome: ApplyOutcome,
    },
    /// The event type is not acted on
    Ignored {
        /// Raw event type
        event_type: String,
    },
}

/// Routes each known event to exactly one applier
#[derive(Debug, Clone)]
pub struct EventRouter {
    ctx: ApplyContext,
}

impl EventRouter {
    /// Route into the given stores
    pub fn new(ctx: ApplyContext) -> Self {
        Self { ctx }
    }

    /// Apply `event`
    #[instrument(skip_all, fields(resource = event.resource()))]
    pub async fn route(&self, event: &WebhookEvent) -> Result<RouteOutcome, ApplyError> {
        let resource = event.resource();
        let applied = match event {
            WebhookEvent::Payment { payment, raw } => {
                let record = PaymentRecord::from_payment(payment, raw.clone());
                apply::payment::apply(&self.ctx, &record).await?
            }
            WebhookEvent::Checkout { checkout, raw } => {
                let record = PaymentRecord::from_checkout(checkout, raw.clone());
                apply::payment::apply(&self.ctx, &record).await?
            }
            WebhookEvent::InvoicePaid(invoice) => apply::invoice::apply(&self.ctx, invoice).await?,
            WebhookEvent::Booking(booking) => {
                apply::booking::apply(&self.ctx, booking, ApplySource::Webhook).await?
            }
            WebhookEvent::Unknown { event_type } => {
                debug!(event_type = %event_type, "Ignoring unhandled event type");
                return Ok(RouteOutcome::Ignored {
                    event_type: event_type.clone(),
                });
            }
        };

        Ok(RouteOutcome::Applied {
            resource,
            outcome: applied.outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::model::{Payment, PaymentStatus};
    use crate::provider::{ExternalCheckout, Money};
    use crate::store::{InMemoryStore, PaymentRepository};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use uuid::Uuid;

    fn router() -> (EventRouter, Arc<InMemoryStore>, Arc<InMemoryAuditLog>) {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        (
            EventRouter::new(ApplyContext::new(store.clone(), audit.clone())),
            store,
            audit,
        )
    }

    #[tokio::test]
    async fn test_unknown_is_ignored() {
        let (router, _store, audit) = router();
        let outcome = router
            .route(&WebhookEvent::Unknown {
                event_type: "customer.created".into(),
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RouteOutcome::Ignored {
                event_type: "customer.created".into()
            }
        );
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn test_checkout_routes_to_payment_applier() {
        let (router, store, audit) = router();
        store
            .insert_payment(&Payment {
                id: Uuid::new_v4(),
                external_payment_id: None,
                reference_id: Some("tr-9".into()),
                amount: Decimal::new(2000, 2),
                currency: "USD".into(),
                status: PaymentStatus::Pending,
                raw_payload: serde_json::Value::Null,
                provider_updated_at: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let checkout = ExternalCheckout {
            id: "chk-1".into(),
            reference_id: Some("tr-9".into()),
            status: "COMPLETED".into(),
            amount_money: Money {
                amount: 2000,
                currency: "USD".into(),
            },
            payment_ids: vec!["pay-9".into()],
            updated_at: None,
        };
        let outcome = router
            .route(&WebhookEvent::Checkout {
                checkout,
                raw: serde_json::json!({"id": "chk-1"}),
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RouteOutcome::Applied {
                resource: "payment",
                outcome: ApplyOutcome::Updated
            }
        );
        let payment = store.find_payment_by_external_id("pay-9").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(audit.len(), 1);
    }
}
