//! Invoice applier
//!
//! A provider invoice marks the local invoice with the same correlation key
//! as paid. Matching is exact: no local invoice with that key means nothing
//! happens.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, instrument};

use crate::apply::{Applied, ApplyContext, ApplyOutcome, SkipReason};
use crate::audit::AuditEntry;
use crate::error::ApplyError;
use crate::model::{Invoice, InvoiceStatus};
use crate::provider::ExternalInvoice;

/// Audit action for an invoice transitioning to paid
pub const ACTION_INVOICE_PAID: &str = "invoice_paid";

/// Decision for one paid provider invoice
#[derive(Debug, Clone, PartialEq)]
pub enum InvoicePlan {
    /// Store the invoice as paid
    MarkPaid(Invoice),
    /// Leave storage untouched
    Skip(SkipReason),
}

/// Decide what a payment on the provider invoice means for the local one
pub fn plan(existing: Option<&Invoice>, now: DateTime<Utc>) -> InvoicePlan {
    match existing {
        None => InvoicePlan::Skip(SkipReason::NoMatch),
        Some(invoice) if invoice.status == InvoiceStatus::Paid => {
            InvoicePlan::Skip(SkipReason::AlreadyPaid)
        }
        Some(invoice) => InvoicePlan::MarkPaid(Invoice {
            status: InvoiceStatus::Paid,
            updated_at: now,
            ..invoice.clone()
        }),
    }
}

/// Apply a payment made against a provider invoice
#[instrument(skip_all, fields(invoice_id = %incoming.id, key = %incoming.correlation_key()))]
pub async fn apply(ctx: &ApplyContext, incoming: &ExternalInvoice) -> Result<Applied, ApplyError> {
    let key = incoming.correlation_key();
    if key.is_empty() {
        return Err(ApplyError::Validation(
            "invoice has no id or invoice number".to_string(),
        ));
    }

    let existing = ctx.store.find_invoice_by_correlation_key(key).await?;
    match plan(existing.as_ref(), Utc::now()) {
        InvoicePlan::MarkPaid(invoice) => {
            ctx.store.update_invoice(&invoice).await?;
            let entry = AuditEntry::new(
                ACTION_INVOICE_PAID,
                "invoice",
                key,
                json!({
                    "providerInvoiceId": incoming.id,
                    "correlationKey": invoice.correlation_key,
                    "previousStatus": "open",
                    "status": "paid",
                }),
            );
            ctx.record("invoice", ApplyOutcome::Updated, Some(entry))
                .await
        }
        InvoicePlan::Skip(reason) => {
            debug!(?reason, "Invoice left unchanged");
            ctx.record("invoice", ApplyOutcome::Skipped, None).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::store::{InMemoryStore, InvoiceRepository};
    use std::sync::Arc;

    fn external(number: Option<&str>) -> ExternalInvoice {
        ExternalInvoice {
            id: "inv-prov-1".into(),
            invoice_number: number.map(String::from),
            status: Some("PAID".into()),
        }
    }

    fn context() -> (ApplyContext, Arc<InMemoryStore>, Arc<InMemoryAuditLog>) {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        (ApplyContext::new(store.clone(), audit.clone()), store, audit)
    }

    #[test]
    fn test_plan_outcomes() {
        let open = Invoice::open("INV-0042");
        assert!(matches!(
            plan(Some(&open), Utc::now()),
            InvoicePlan::MarkPaid(i) if i.status == InvoiceStatus::Paid && i.id == open.id
        ));

        let paid = Invoice {
            status: InvoiceStatus::Paid,
            ..open
        };
        assert_eq!(
            plan(Some(&paid), Utc::now()),
            InvoicePlan::Skip(SkipReason::AlreadyPaid)
        );
        assert_eq!(plan(None, Utc::now()), InvoicePlan::Skip(SkipReason::NoMatch));
    }

    #[tokio::test]
    async fn test_marks_matching_invoice_paid_once() {
        let (ctx, store, audit) = context();
        store.insert_invoice(&Invoice::open("INV-0042")).await.unwrap();

        let first = apply(&ctx, &external(Some("INV-0042"))).await.unwrap();
        let second = apply(&ctx, &external(Some("INV-0042"))).await.unwrap();

        assert_eq!(first.outcome, ApplyOutcome::Updated);
        assert_eq!(second.outcome, ApplyOutcome::Skipped);

        let invoice = store
            .find_invoice_by_correlation_key("INV-0042")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, ACTION_INVOICE_PAID);
        assert_eq!(entries[0].resource_id, "INV-0042");
    }

    #[tokio::test]
    async fn test_no_substring_matching() {
        let (ctx, store, audit) = context();
        store.insert_invoice(&Invoice::open("INV-00421")).await.unwrap();

        let applied = apply(&ctx, &external(Some("INV-0042"))).await.unwrap();

        assert_eq!(applied.outcome, ApplyOutcome::Skipped);
        let untouched = store
            .find_invoice_by_correlation_key("INV-00421")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.status, InvoiceStatus::Open);
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_to_provider_id() {
        let (ctx, store, _audit) = context();
        store.insert_invoice(&Invoice::open("inv-prov-1")).await.unwrap();

        let applied = apply(&ctx, &external(None)).await.unwrap();
        assert_eq!(applied.outcome, ApplyOutcome::Updated);
    }
}
