//! Payment applier
//!
//! Upsert key is the provider payment id, falling back to the shop's
//! reference id for payments recorded locally before the provider assigned
//! one. Unknown payments are only created once they reach terminal success.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::apply::{Applied, ApplyContext, ApplyOutcome, SkipReason};
use crate::audit::AuditEntry;
use crate::error::{ApplyError, StoreError};
use crate::model::{Payment, PaymentStatus};
use crate::provider::{ExternalCheckout, ExternalPayment};

/// Audit action for a changed payment
pub const ACTION_PAYMENT_UPDATED: &str = "payment_webhook_received";
/// Audit action for a newly seen completed payment
pub const ACTION_PAYMENT_CREATED: &str = "payment_created";

/// Normalized applier input built from a payment or checkout object
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    /// Provider payment id; absent on checkouts that have not produced one
    pub external_payment_id: Option<String>,
    /// Shop-side reference, the fallback lookup key
    pub reference_id: Option<String>,
    /// Mapped local status
    pub status: PaymentStatus,
    /// Major units
    pub amount: Decimal,
    /// ISO 4217 code
    pub currency: String,
    /// Provider-side modification time
    pub provider_updated_at: Option<DateTime<Utc>>,
    /// Provider object, stored as the payment's raw payload
    pub raw: serde_json::Value,
}

impl PaymentRecord {
    /// From a `payment.*` object
    pub fn from_payment(payment: &ExternalPayment, raw: serde_json::Value) -> Self {
        Self {
            external_payment_id: Some(payment.id.clone()),
            reference_id: payment.reference_id.clone(),
            status: map_payment_status(&payment.status),
            amount: minor_to_major(payment.amount_money.amount, &payment.amount_money.currency),
            currency: payment.amount_money.currency.clone(),
            provider_updated_at: payment.updated_at,
            raw,
        }
    }

    /// From a `checkout.*` object; the first produced payment id becomes the key
    pub fn from_checkout(checkout: &ExternalCheckout, raw: serde_json::Value) -> Self {
        Self {
            external_payment_id: checkout.payment_ids.first().cloned(),
            reference_id: checkout.reference_id.clone(),
            status: map_payment_status(&checkout.status),
            amount: minor_to_major(
                checkout.amount_money.amount,
                &checkout.amount_money.currency,
            ),
            currency: checkout.amount_money.currency.clone(),
            provider_updated_at: checkout.updated_at,
            raw,
        }
    }
}

/// Translate provider payment/checkout vocabulary
pub fn map_payment_status(raw: &str) -> PaymentStatus {
    match raw.to_ascii_uppercase().as_str() {
        "COMPLETED" | "APPROVED" => PaymentStatus::Completed,
        "FAILED" | "CANCELED" | "CANCELLED" => PaymentStatus::Failed,
        "REFUNDED" => PaymentStatus::Refunded,
        _ => PaymentStatus::Pending,
    }
}

/// Convert minor units to a decimal amount in major units
pub fn minor_to_major(amount: i64, currency: &str) -> Decimal {
    let scale = match currency.to_ascii_uppercase().as_str() {
        "JPY" | "KRW" | "VND" | "CLP" | "ISK" => 0,
        "BHD" | "KWD" | "OMR" | "JOD" | "TND" => 3,
        _ => 2,
    };
    Decimal::new(amount, scale)
}

/// Decision for one incoming payment
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentPlan {
    /// Insert a new payment
    Create(Payment),
    /// Replace the stored payment
    Update {
        /// Status of the stored row
        previous_status: PaymentStatus,
        /// The row to write
        payment: Payment,
    },
    /// Leave storage untouched
    Skip(SkipReason),
}

/// Decide what to do with `incoming` given the stored payment, if any
pub fn plan(existing: Option<&Payment>, incoming: &PaymentRecord, now: DateTime<Utc>) -> PaymentPlan {
    let Some(current) = existing else {
        if !incoming.status.is_terminal_success() {
            return PaymentPlan::Skip(SkipReason::NotTerminal);
        }
        return PaymentPlan::Create(Payment {
            id: Uuid::new_v4(),
            external_payment_id: incoming.external_payment_id.clone(),
            reference_id: incoming.reference_id.clone(),
            amount: incoming.amount,
            currency: incoming.currency.clone(),
            status: incoming.status,
            raw_payload: incoming.raw.clone(),
            provider_updated_at: incoming.provider_updated_at,
            updated_at: now,
        });
    };

    if let (Some(seen), Some(stored)) = (incoming.provider_updated_at, current.provider_updated_at)
    {
        if seen < stored {
            return PaymentPlan::Skip(SkipReason::Stale);
        }
    }

    let same_timestamp = incoming.provider_updated_at.is_none()
        || incoming.provider_updated_at == current.provider_updated_at;
    let gains_external_id =
        current.external_payment_id.is_none() && incoming.external_payment_id.is_some();

    if current.status == incoming.status
        && current.amount == incoming.amount
        && same_timestamp
        && !gains_external_id
    {
        return PaymentPlan::Skip(SkipReason::Unchanged);
    }

    let mut payment = current.clone();
    payment.status = incoming.status;
    payment.amount = incoming.amount;
    payment.currency = incoming.currency.clone();
    payment.raw_payload = incoming.raw.clone();
    if incoming.provider_updated_at.is_some() {
        payment.provider_updated_at = incoming.provider_updated_at;
    }
    if payment.external_payment_id.is_none() {
        payment.external_payment_id = incoming.external_payment_id.clone();
    }
    if payment.reference_id.is_none() {
        payment.reference_id = incoming.reference_id.clone();
    }
    payment.updated_at = now;

    PaymentPlan::Update {
        previous_status: current.status,
        payment,
    }
}

async fn find_existing(
    ctx: &ApplyContext,
    incoming: &PaymentRecord,
) -> Result<Option<Payment>, StoreError> {
    if let Some(ext) = &incoming.external_payment_id {
        if let Some(found) = ctx.store.find_payment_by_external_id(ext).await? {
            return Ok(Some(found));
        }
    }
    if let Some(reference) = &incoming.reference_id {
        return ctx.store.find_payment_by_reference_id(reference).await;
    }
    Ok(None)
}

/// Apply one payment record
#[instrument(skip_all, fields(
    external_payment_id = ?incoming.external_payment_id,
    reference_id = ?incoming.reference_id,
    status = %incoming.status,
))]
pub async fn apply(ctx: &ApplyContext, incoming: &PaymentRecord) -> Result<Applied, ApplyError> {
    if incoming.external_payment_id.is_none() && incoming.reference_id.is_none() {
        return Err(ApplyError::Validation(
            "payment has neither a provider id nor a reference id".to_string(),
        ));
    }

    let existing = find_existing(ctx, incoming).await?;
    match plan(existing.as_ref(), incoming, Utc::now()) {
        PaymentPlan::Create(payment) => match ctx.store.insert_payment(&payment).await {
            Ok(()) => {
                let entry = created_entry(&payment);
                ctx.record("payment", ApplyOutcome::Created, Some(entry))
                    .await
            }
            Err(StoreError::Conflict { .. }) => {
                // Lost an insert race; the winner's row is now visible
                debug!("Payment insert conflicted, retrying as update");
                let existing = find_existing(ctx, incoming).await?;
                match plan(existing.as_ref(), incoming, Utc::now()) {
                    PaymentPlan::Update {
                        previous_status,
                        payment,
                    } => update(ctx, previous_status, payment).await,
                    PaymentPlan::Skip(reason) => skip(ctx, reason).await,
                    PaymentPlan::Create(_) => Err(ApplyError::Store(StoreError::Backend(
                        "payment conflicted on insert but cannot be found".to_string(),
                    ))),
                }
            }
            Err(e) => Err(e.into()),
        },
        PaymentPlan::Update {
            previous_status,
            payment,
        } => update(ctx, previous_status, payment).await,
        PaymentPlan::Skip(reason) => skip(ctx, reason).await,
    }
}

async fn update(
    ctx: &ApplyContext,
    previous_status: PaymentStatus,
    payment: Payment,
) -> Result<Applied, ApplyError> {
    ctx.store.update_payment(&payment).await?;
    let entry = AuditEntry::new(
        ACTION_PAYMENT_UPDATED,
        "payment",
        payment.audit_id(),
        json!({
            "referenceId": payment.reference_id,
            "previousStatus": previous_status,
            "status": payment.status,
            "amount": payment.amount.to_string(),
            "currency": payment.currency,
        }),
    );
    ctx.record("payment", ApplyOutcome::Updated, Some(entry))
        .await
}

async fn skip(ctx: &ApplyContext, reason: SkipReason) -> Result<Applied, ApplyError> {
    debug!(?reason, "Payment unchanged");
    ctx.record("payment", ApplyOutcome::Skipped, None).await
}

fn created_entry(payment: &Payment) -> AuditEntry {
    AuditEntry::new(
        ACTION_PAYMENT_CREATED,
        "payment",
        payment.audit_id(),
        json!({
            "referenceId": payment.reference_id,
            "status": payment.status,
            "amount": payment.amount.to_string(),
            "currency": payment.currency,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::store::{InMemoryStore, PaymentRepository};
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn record(status: &str, amount: i64) -> PaymentRecord {
        PaymentRecord {
            external_payment_id: Some("pay-1".into()),
            reference_id: Some("tr-1".into()),
            status: map_payment_status(status),
            amount: minor_to_major(amount, "USD"),
            currency: "USD".into(),
            provider_updated_at: Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()),
            raw: json!({"id": "pay-1"}),
        }
    }

    fn stored(status: PaymentStatus) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            external_payment_id: None,
            reference_id: Some("tr-1".into()),
            amount: Decimal::new(7500, 2),
            currency: "USD".into(),
            status,
            raw_payload: serde_json::Value::Null,
            provider_updated_at: None,
            updated_at: Utc::now(),
        }
    }

    fn context() -> (ApplyContext, Arc<InMemoryStore>, Arc<InMemoryAuditLog>) {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        (ApplyContext::new(store.clone(), audit.clone()), store, audit)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_payment_status("COMPLETED"), PaymentStatus::Completed);
        assert_eq!(map_payment_status("approved"), PaymentStatus::Completed);
        assert_eq!(map_payment_status("CANCELED"), PaymentStatus::Failed);
        assert_eq!(map_payment_status("REFUNDED"), PaymentStatus::Refunded);
        assert_eq!(map_payment_status("IN_PROGRESS"), PaymentStatus::Pending);
        assert_eq!(map_payment_status("SOMETHING_NEW"), PaymentStatus::Pending);
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(minor_to_major(7500, "USD").to_string(), "75.00");
        assert_eq!(minor_to_major(7500, "jpy").to_string(), "7500");
        assert_eq!(minor_to_major(1234, "KWD").to_string(), "1.234");
    }

    #[test]
    fn test_plan_unknown_non_terminal_is_skipped() {
        let plan = plan(None, &record("PENDING", 100), Utc::now());
        assert_eq!(plan, PaymentPlan::Skip(SkipReason::NotTerminal));
    }

    #[test]
    fn test_plan_unknown_completed_is_created() {
        let plan = plan(None, &record("COMPLETED", 100), Utc::now());
        assert!(matches!(plan, PaymentPlan::Create(p) if p.status == PaymentStatus::Completed));
    }

    #[test]
    fn test_plan_stale_update_is_skipped() {
        let mut current = stored(PaymentStatus::Completed);
        current.external_payment_id = Some("pay-1".into());
        current.provider_updated_at = Some(Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap());

        let plan = plan(Some(&current), &record("PENDING", 7500), Utc::now());
        assert_eq!(plan, PaymentPlan::Skip(SkipReason::Stale));
    }

    #[test]
    fn test_plan_identical_is_unchanged() {
        let incoming = record("COMPLETED", 7500);
        let mut current = stored(PaymentStatus::Completed);
        current.external_payment_id = incoming.external_payment_id.clone();
        current.provider_updated_at = incoming.provider_updated_at;

        let plan = plan(Some(&current), &incoming, Utc::now());
        assert_eq!(plan, PaymentPlan::Skip(SkipReason::Unchanged));
    }

    #[tokio::test]
    async fn test_reference_fallback_update_scenario() {
        let (ctx, store, audit) = context();
        let existing = stored(PaymentStatus::Pending);
        store.insert_payment(&existing).await.unwrap();

        let applied = apply(&ctx, &record("COMPLETED", 7500)).await.unwrap();
        assert_eq!(applied.outcome, ApplyOutcome::Updated);

        let payment = store
            .find_payment_by_reference_id("tr-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.id, existing.id);
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.amount.to_string(), "75.00");
        assert_eq!(payment.external_payment_id.as_deref(), Some("pay-1"));

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, ACTION_PAYMENT_UPDATED);
        assert_eq!(entries[0].resource_id, "pay-1");
        assert_eq!(entries[0].details["previousStatus"], "pending");
        assert_eq!(entries[0].details["status"], "completed");
    }

    #[tokio::test]
    async fn test_repeat_application_is_noop() {
        let (ctx, store, audit) = context();
        let incoming = record("COMPLETED", 7500);

        let first = apply(&ctx, &incoming).await.unwrap();
        let snapshot = store.list_payments().await.unwrap();
        let second = apply(&ctx, &incoming).await.unwrap();

        assert_eq!(first.outcome, ApplyOutcome::Created);
        assert_eq!(second.outcome, ApplyOutcome::Skipped);
        assert!(second.audit.is_none());
        assert_eq!(store.list_payments().await.unwrap(), snapshot);
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn test_later_status_change_is_audited() {
        let (ctx, store, audit) = context();
        apply(&ctx, &record("COMPLETED", 7500)).await.unwrap();

        let mut refund = record("REFUNDED", 7500);
        refund.provider_updated_at = refund.provider_updated_at.map(|t| t + Duration::hours(1));
        let applied = apply(&ctx, &refund).await.unwrap();

        assert_eq!(applied.outcome, ApplyOutcome::Updated);
        let payment = store.find_payment_by_external_id("pay-1").await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Refunded);
        assert_eq!(audit.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_identifiers_rejected() {
        let (ctx, _store, audit) = context();
        let mut incoming = record("COMPLETED", 100);
        incoming.external_payment_id = None;
        incoming.reference_id = None;

        let err = apply(&ctx, &incoming).await.unwrap_err();
        assert!(matches!(err, ApplyError::Validation(_)));
        assert!(audit.is_empty());
    }
}
