//! Booking applier
//!
//! Upserts a local appointment keyed by the provider booking id. Used by
//! both the `booking.*` webhook and the reconciliation sweep, so replays of
//! an already-applied booking must be no-ops.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::apply::{Applied, ApplyContext, ApplyOutcome, ApplySource, SkipReason};
use crate::audit::AuditEntry;
use crate::error::{ApplyError, StoreError};
use crate::model::{Appointment, AppointmentStatus};
use crate::provider::ExternalBooking;

/// Audit action for a newly seen booking
pub const ACTION_APPOINTMENT_CREATED: &str = "appointment_created";
/// Audit action for a booking whose status moved
pub const ACTION_APPOINTMENT_STATUS_CHANGED: &str = "appointment_status_changed";

/// Translate provider booking vocabulary; unknown values are rejected
pub fn map_booking_status(raw: &str) -> Result<AppointmentStatus, ApplyError> {
    match raw.to_ascii_uppercase().as_str() {
        "PENDING" => Ok(AppointmentStatus::Pending),
        "ACCEPTED" => Ok(AppointmentStatus::Confirmed),
        "DECLINED" | "CANCELLED_BY_CUSTOMER" | "CANCELLED_BY_SELLER" => {
            Ok(AppointmentStatus::Cancelled)
        }
        "NO_SHOW" => Ok(AppointmentStatus::NoShow),
        "COMPLETED" => Ok(AppointmentStatus::Completed),
        _ => Err(ApplyError::UnknownStatus {
            resource: "booking",
            value: raw.to_string(),
        }),
    }
}

/// Decision for one incoming booking
#[derive(Debug, Clone, PartialEq)]
pub enum BookingPlan {
    /// Insert a new appointment
    Create(Appointment),
    /// Replace the stored appointment
    Update {
        /// Status before this update, when it changed
        previous_status: Option<AppointmentStatus>,
        /// The row to write
        appointment: Appointment,
    },
    /// Leave storage untouched
    Skip(SkipReason),
}

/// Decide what to do with `incoming` given the stored appointment, if any
pub fn plan(
    existing: Option<&Appointment>,
    incoming: &ExternalBooking,
    now: DateTime<Utc>,
) -> Result<BookingPlan, ApplyError> {
    if incoming.id.trim().is_empty() {
        return Err(ApplyError::Validation("booking has an empty id".to_string()));
    }
    let status = map_booking_status(&incoming.status)?;
    let end_at = incoming.end_at().ok_or_else(|| {
        ApplyError::Validation(format!(
            "booking {} has an out-of-range duration",
            incoming.id
        ))
    })?;
    if end_at < incoming.start_at {
        return Err(ApplyError::Validation(format!(
            "booking {} ends before it starts",
            incoming.id
        )));
    }

    let Some(current) = existing else {
        return Ok(BookingPlan::Create(Appointment {
            id: Uuid::new_v4(),
            external_booking_id: Some(incoming.id.clone()),
            status,
            start_at: incoming.start_at,
            end_at,
            customer_ref: incoming.customer_id.clone(),
            provider_updated_at: incoming.updated_at,
            updated_at: now,
        }));
    };

    if let (Some(seen), Some(stored)) = (incoming.updated_at, current.provider_updated_at) {
        if seen < stored {
            return Ok(BookingPlan::Skip(SkipReason::Stale));
        }
    }

    let customer_ref = incoming
        .customer_id
        .clone()
        .or_else(|| current.customer_ref.clone());
    let provider_updated_at = incoming.updated_at.or(current.provider_updated_at);

    if current.status == status
        && current.start_at == incoming.start_at
        && current.end_at == end_at
        && current.customer_ref == customer_ref
        && current.provider_updated_at == provider_updated_at
    {
        return Ok(BookingPlan::Skip(SkipReason::Unchanged));
    }

    let previous_status = (current.status != status).then_some(current.status);
    Ok(BookingPlan::Update {
        previous_status,
        appointment: Appointment {
            status,
            start_at: incoming.start_at,
            end_at,
            customer_ref,
            provider_updated_at,
            updated_at: now,
            ..current.clone()
        },
    })
}

/// Apply one booking
#[instrument(skip_all, fields(booking_id = %incoming.id, status = %incoming.status, source = source.as_str()))]
pub async fn apply(
    ctx: &ApplyContext,
    incoming: &ExternalBooking,
    source: ApplySource,
) -> Result<Applied, ApplyError> {
    let existing = ctx
        .store
        .find_appointment_by_external_id(&incoming.id)
        .await?;

    match plan(existing.as_ref(), incoming, Utc::now())? {
        BookingPlan::Create(appointment) => {
            match ctx.store.insert_appointment(&appointment).await {
                Ok(()) => {
                    let entry = AuditEntry::new(
                        ACTION_APPOINTMENT_CREATED,
                        "appointment",
                        incoming.id.as_str(),
                        json!({
                            "status": appointment.status,
                            "startAt": appointment.start_at,
                            "endAt": appointment.end_at,
                            "source": source,
                        }),
                    );
                    ctx.record("booking", ApplyOutcome::Created, Some(entry))
                        .await
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!("Appointment insert conflicted, retrying as update");
                    let existing = ctx
                        .store
                        .find_appointment_by_external_id(&incoming.id)
                        .await?;
                    match plan(existing.as_ref(), incoming, Utc::now())? {
                        BookingPlan::Update {
                            previous_status,
                            appointment,
                        } => update(ctx, incoming, source, previous_status, appointment).await,
                        BookingPlan::Skip(reason) => skip(ctx, reason).await,
                        BookingPlan::Create(_) => Err(ApplyError::Store(StoreError::Backend(
                            "appointment conflicted on insert but cannot be found".to_string(),
                        ))),
                    }
                }
                Err(e) => Err(e.into()),
            }
        }
        BookingPlan::Update {
            previous_status,
            appointment,
        } => update(ctx, incoming, source, previous_status, appointment).await,
        BookingPlan::Skip(reason) => skip(ctx, reason).await,
    }
}

async fn update(
    ctx: &ApplyContext,
    incoming: &ExternalBooking,
    source: ApplySource,
    previous_status: Option<AppointmentStatus>,
    appointment: Appointment,
) -> Result<Applied, ApplyError> {
    ctx.store.update_appointment(&appointment).await?;

    // Reschedules and customer edits are applied silently; only status moves are audited
    let entry = previous_status.map(|previous| {
        AuditEntry::new(
            ACTION_APPOINTMENT_STATUS_CHANGED,
            "appointment",
            incoming.id.as_str(),
            json!({
                "previousStatus": previous,
                "status": appointment.status,
                "source": source,
            }),
        )
    });
    ctx.record("booking", ApplyOutcome::Updated, entry).await
}

async fn skip(ctx: &ApplyContext, reason: SkipReason) -> Result<Applied, ApplyError> {
    debug!(?reason, "Appointment unchanged");
    ctx.record("booking", ApplyOutcome::Skipped, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::provider::AppointmentSegment;
    use crate::store::{AppointmentRepository, InMemoryStore};
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn booking(id: &str, status: &str, minutes: i64) -> ExternalBooking {
        ExternalBooking {
            id: id.into(),
            status: status.into(),
            start_at: Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
            customer_id: Some("cust-1".into()),
            appointment_segments: vec![AppointmentSegment {
                duration_minutes: minutes,
                team_member_id: Some("tm-1".into()),
                service_variation_id: None,
            }],
            updated_at: Some(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()),
            version: Some(1),
        }
    }

    fn context() -> (ApplyContext, Arc<InMemoryStore>, Arc<InMemoryAuditLog>) {
        let store = Arc::new(InMemoryStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        (ApplyContext::new(store.clone(), audit.clone()), store, audit)
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            map_booking_status("ACCEPTED").unwrap(),
            AppointmentStatus::Confirmed
        );
        assert_eq!(
            map_booking_status("CANCELLED_BY_SELLER").unwrap(),
            AppointmentStatus::Cancelled
        );
        assert_eq!(map_booking_status("no_show").unwrap(), AppointmentStatus::NoShow);
        assert!(matches!(
            map_booking_status("TELEPORTED"),
            Err(ApplyError::UnknownStatus { resource: "booking", .. })
        ));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let err = plan(None, &booking("bk-1", "ACCEPTED", -30), Utc::now()).unwrap_err();
        assert!(matches!(err, ApplyError::Validation(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_duration_rejected() {
        let (ctx, store, audit) = context();
        let huge = booking("bk-1", "ACCEPTED", i64::MAX);
        let err = apply(&ctx, &huge, ApplySource::Sweep).await.unwrap_err();
        assert!(matches!(err, ApplyError::Validation(_)));

        let mut split = booking("bk-2", "ACCEPTED", i64::MAX / 2 + 1);
        split.appointment_segments.push(split.appointment_segments[0].clone());
        let err = apply(&ctx, &split, ApplySource::Webhook).await.unwrap_err();
        assert!(matches!(err, ApplyError::Validation(_)));

        assert!(store.list_appointments().await.unwrap().is_empty());
        assert!(audit.is_empty());
    }

    #[test]
    fn test_stale_booking_skipped() {
        let incoming = booking("bk-1", "ACCEPTED", 60);
        let BookingPlan::Create(mut current) = plan(None, &incoming, Utc::now()).unwrap() else {
            panic!("expected create");
        };
        current.provider_updated_at = incoming.updated_at.map(|t| t + Duration::hours(1));

        assert_eq!(
            plan(Some(&current), &incoming, Utc::now()).unwrap(),
            BookingPlan::Skip(SkipReason::Stale)
        );
    }

    #[tokio::test]
    async fn test_create_then_replay_is_noop() {
        let (ctx, store, audit) = context();
        let incoming = booking("bk-1", "ACCEPTED", 60);

        let first = apply(&ctx, &incoming, ApplySource::Sweep).await.unwrap();
        let snapshot = store.list_appointments().await.unwrap();
        let second = apply(&ctx, &incoming, ApplySource::Webhook).await.unwrap();

        assert_eq!(first.outcome, ApplyOutcome::Created);
        assert_eq!(second.outcome, ApplyOutcome::Skipped);
        assert_eq!(store.list_appointments().await.unwrap(), snapshot);
        assert_eq!(snapshot[0].end_at - snapshot[0].start_at, Duration::minutes(60));
        assert_eq!(audit.len(), 1);
        assert_eq!(audit.entries()[0].action, ACTION_APPOINTMENT_CREATED);
    }

    #[tokio::test]
    async fn test_status_change_audited_reschedule_not() {
        let (ctx, store, audit) = context();
        apply(&ctx, &booking("bk-1", "ACCEPTED", 60), ApplySource::Sweep)
            .await
            .unwrap();

        let mut rescheduled = booking("bk-1", "ACCEPTED", 90);
        rescheduled.updated_at = rescheduled.updated_at.map(|t| t + Duration::minutes(5));
        let applied = apply(&ctx, &rescheduled, ApplySource::Sweep).await.unwrap();
        assert_eq!(applied.outcome, ApplyOutcome::Updated);
        assert!(applied.audit.is_none());

        let mut cancelled = booking("bk-1", "CANCELLED_BY_CUSTOMER", 90);
        cancelled.updated_at = rescheduled.updated_at.map(|t| t + Duration::minutes(5));
        let applied = apply(&ctx, &cancelled, ApplySource::Webhook).await.unwrap();
        assert_eq!(applied.outcome, ApplyOutcome::Updated);

        let entry = applied.audit.expect("status change is audited");
        assert_eq!(entry.action, ACTION_APPOINTMENT_STATUS_CHANGED);
        assert_eq!(entry.details["previousStatus"], "confirmed");
        assert_eq!(entry.details["status"], "cancelled");
        assert_eq!(audit.len(), 2);

        let stored = store
            .find_appointment_by_external_id("bk-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, AppointmentStatus::Cancelled);
    }
}
