//! Appliers against a store that loses insert races

mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use uuid::Uuid;

use common::{at, booking, RacingStore};
use shop_sync::apply::booking::BookingPlan;
use shop_sync::apply::payment::ACTION_PAYMENT_UPDATED;
use shop_sync::apply::{self, ApplyContext, ApplyOutcome, ApplySource, PaymentRecord};
use shop_sync::audit::InMemoryAuditLog;
use shop_sync::model::{AppointmentStatus, Payment, PaymentStatus};
use shop_sync::provider::{ExternalPayment, Money};
use shop_sync::store::{AppointmentRepository, InMemoryStore, PaymentRepository};

fn racing() -> (ApplyContext, Arc<RacingStore>, Arc<InMemoryAuditLog>) {
    let store = Arc::new(RacingStore::new(Arc::new(InMemoryStore::new())));
    let audit = Arc::new(InMemoryAuditLog::new());
    (ApplyContext::new(store.clone(), audit.clone()), store, audit)
}

#[tokio::test]
async fn test_booking_insert_conflict_settles_on_the_winner() {
    let (ctx, store, audit) = racing();
    let incoming = booking("bk-1", "ACCEPTED", at(2, 9));
    let BookingPlan::Create(winner) = apply::booking::plan(None, &incoming, Utc::now()).unwrap()
    else {
        panic!("expected create");
    };
    *store.racing_appointment.lock() = Some(winner.clone());

    let applied = apply::booking::apply(&ctx, &incoming, ApplySource::Webhook)
        .await
        .unwrap();

    assert_eq!(applied.outcome, ApplyOutcome::Skipped);
    let rows = store.list_appointments().await.unwrap();
    assert_eq!(rows, vec![winner]);
    assert!(audit.is_empty());
}

#[tokio::test]
async fn test_booking_insert_conflict_updates_an_older_winner() {
    let (ctx, store, audit) = racing();
    let pending = booking("bk-1", "PENDING", at(2, 9));
    let BookingPlan::Create(winner) = apply::booking::plan(None, &pending, Utc::now()).unwrap()
    else {
        panic!("expected create");
    };
    *store.racing_appointment.lock() = Some(winner.clone());

    let incoming = booking("bk-1", "ACCEPTED", at(2, 9));
    let applied = apply::booking::apply(&ctx, &incoming, ApplySource::Sweep)
        .await
        .unwrap();

    assert_eq!(applied.outcome, ApplyOutcome::Updated);
    let rows = store.list_appointments().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, winner.id);
    assert_eq!(rows[0].status, AppointmentStatus::Confirmed);
    assert_eq!(audit.len(), 1);
}

#[tokio::test]
async fn test_payment_insert_conflict_retries_as_update() {
    let (ctx, store, audit) = racing();
    let winner = Payment {
        id: Uuid::new_v4(),
        external_payment_id: Some("pay-1".into()),
        reference_id: Some("tr-1".into()),
        amount: Decimal::ZERO,
        currency: "USD".into(),
        status: PaymentStatus::Pending,
        raw_payload: serde_json::Value::Null,
        provider_updated_at: None,
        updated_at: Utc::now(),
    };
    *store.racing_payment.lock() = Some(winner.clone());

    let payment = ExternalPayment {
        id: "pay-1".into(),
        reference_id: Some("tr-1".into()),
        status: "COMPLETED".into(),
        amount_money: Money {
            amount: 7500,
            currency: "USD".into(),
        },
        updated_at: Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()),
    };
    let record = PaymentRecord::from_payment(&payment, serde_json::json!({}));

    let applied = apply::payment::apply(&ctx, &record).await.unwrap();

    assert_eq!(applied.outcome, ApplyOutcome::Updated);
    let rows = store.list_payments().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, winner.id);
    assert_eq!(rows[0].status, PaymentStatus::Completed);
    assert_eq!(rows[0].amount, Decimal::new(7500, 2));
    assert_eq!(audit.entries()[0].action, ACTION_PAYMENT_UPDATED);
}
