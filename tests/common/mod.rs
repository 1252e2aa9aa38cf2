//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

use shop_sync::apply::ApplyContext;
use shop_sync::audit::{AuditEntry, AuditLog, InMemoryAuditLog};
use shop_sync::config::SyncConfig;
use shop_sync::error::{PersistenceError, ProviderError, StoreError};
use shop_sync::model::{Appointment, Invoice, Payment, SyncRun};
use shop_sync::provider::{
    AppointmentSegment, BookingPage, BookingQuery, ExternalBooking, ProviderClient,
    ResourceProfile,
};
use shop_sync::store::{
    AppointmentRepository, InMemoryStore, InvoiceRepository, PaymentRepository,
    SyncRunRepository,
};
use shop_sync::sweep::SweepJob;
use shop_sync::sync_state::InMemorySyncStateStore;

/// Secret the test config signs with
pub const SECRET: &str = "test-signing-secret";

/// Provider double serving bookings in fixed-size pages
///
/// Page tokens are page indexes. Failures are injected per call and a
/// cancellation can be triggered once a given page has been served.
#[derive(Default)]
pub struct FakeProvider {
    pub bookings: Mutex<Vec<ExternalBooking>>,
    pub page_size: usize,
    /// Remaining calls that fail with a transient error
    pub transient_failures: AtomicUsize,
    /// Every listing call is rejected as unauthorized
    pub unauthorized: AtomicBool,
    /// Resource profile listing fails without being retryable
    pub profiles_unavailable: AtomicBool,
    /// Flip the shutdown flag after serving this page index
    pub cancel_after_page: Mutex<Option<(usize, watch::Sender<bool>)>>,
    pub calls: AtomicUsize,
}

impl FakeProvider {
    pub fn with_bookings(bookings: Vec<ExternalBooking>) -> Self {
        Self {
            bookings: Mutex::new(bookings),
            page_size: 100,
            ..Default::default()
        }
    }

    pub fn paged(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn failing_transiently(self, times: usize) -> Self {
        self.transient_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn set_status(&self, id: &str, status: &str) {
        for booking in self.bookings.lock().iter_mut() {
            if booking.id == id {
                booking.status = status.to_string();
            }
        }
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    async fn list_bookings_in_window(
        &self,
        _query: &BookingQuery,
        page_token: Option<&str>,
    ) -> Result<BookingPage, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(ProviderError::Unauthorized("token revoked".into()));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::Transient("connection reset".into()));
        }

        let index: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let bookings = self.bookings.lock().clone();
        let size = self.page_size.max(1);
        let items: Vec<_> = bookings.iter().skip(index * size).take(size).cloned().collect();
        let next_page_token = ((index + 1) * size < bookings.len()).then(|| (index + 1).to_string());

        if let Some((page, tx)) = &*self.cancel_after_page.lock() {
            if *page == index {
                let _ = tx.send(true);
            }
        }

        Ok(BookingPage {
            items,
            next_page_token,
            ..Default::default()
        })
    }

    async fn list_resource_profiles(&self) -> Result<Vec<ResourceProfile>, ProviderError> {
        if self.profiles_unavailable.load(Ordering::SeqCst) {
            return Err(ProviderError::NotFound(
                "/v2/bookings/team-member-booking-profiles".into(),
            ));
        }
        Ok(Vec::new())
    }
}

/// Audit log that can be switched to refuse every append
pub struct FlakyAuditLog {
    pub inner: Arc<InMemoryAuditLog>,
    pub failing: AtomicBool,
}

impl FlakyAuditLog {
    pub fn new(inner: Arc<InMemoryAuditLog>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditLog for FlakyAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Backend("audit volume is read-only".into()));
        }
        self.inner.append(entry).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, PersistenceError> {
        self.inner.recent(limit).await
    }
}

/// Store that lets a competing writer win the next insert
///
/// The queued row is inserted first and the caller's insert is then
/// reported as a unique-key conflict, the way a concurrent writer would
/// make it fail.
pub struct RacingStore {
    pub inner: Arc<InMemoryStore>,
    pub racing_appointment: Mutex<Option<Appointment>>,
    pub racing_payment: Mutex<Option<Payment>>,
}

impl RacingStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            racing_appointment: Mutex::new(None),
            racing_payment: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AppointmentRepository for RacingStore {
    async fn find_appointment_by_external_id(
        &self,
        external_booking_id: &str,
    ) -> Result<Option<Appointment>, StoreError> {
        self.inner.find_appointment_by_external_id(external_booking_id).await
    }

    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError> {
        let winner = self.racing_appointment.lock().take();
        match winner {
            Some(winner) => {
                self.inner.insert_appointment(&winner).await?;
                Err(StoreError::Conflict {
                    resource: "appointment",
                    key: appointment.external_booking_id.clone().unwrap_or_default(),
                })
            }
            None => self.inner.insert_appointment(appointment).await,
        }
    }

    async fn update_appointment(&self, appointment: &Appointment) -> Result<(), StoreError> {
        self.inner.update_appointment(appointment).await
    }

    async fn list_appointments(&self) -> Result<Vec<Appointment>, StoreError> {
        self.inner.list_appointments().await
    }
}

#[async_trait]
impl PaymentRepository for RacingStore {
    async fn find_payment_by_external_id(
        &self,
        external_payment_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        self.inner.find_payment_by_external_id(external_payment_id).await
    }

    async fn find_payment_by_reference_id(
        &self,
        reference_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        self.inner.find_payment_by_reference_id(reference_id).await
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        let winner = self.racing_payment.lock().take();
        match winner {
            Some(winner) => {
                self.inner.insert_payment(&winner).await?;
                Err(StoreError::Conflict {
                    resource: "payment",
                    key: payment.audit_id(),
                })
            }
            None => self.inner.insert_payment(payment).await,
        }
    }

    async fn update_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        self.inner.update_payment(payment).await
    }

    async fn list_payments(&self) -> Result<Vec<Payment>, StoreError> {
        self.inner.list_payments().await
    }
}

#[async_trait]
impl InvoiceRepository for RacingStore {
    async fn find_invoice_by_correlation_key(
        &self,
        correlation_key: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        self.inner.find_invoice_by_correlation_key(correlation_key).await
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        self.inner.insert_invoice(invoice).await
    }

    async fn update_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        self.inner.update_invoice(invoice).await
    }

    async fn list_invoices(&self) -> Result<Vec<Invoice>, StoreError> {
        self.inner.list_invoices().await
    }
}

#[async_trait]
impl SyncRunRepository for RacingStore {
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.inner.insert_run(run).await
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        self.inner.recent_runs(limit).await
    }
}

/// Everything a sweep test inspects afterwards
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub audit: Arc<InMemoryAuditLog>,
    /// What the job writes audit entries through; wraps `audit`
    pub audit_log: Arc<FlakyAuditLog>,
    pub state: Arc<InMemorySyncStateStore>,
    pub provider: Arc<FakeProvider>,
}

impl Harness {
    pub fn new(provider: FakeProvider) -> Self {
        let audit = Arc::new(InMemoryAuditLog::new());
        Self {
            store: Arc::new(InMemoryStore::new()),
            audit_log: Arc::new(FlakyAuditLog::new(audit.clone())),
            audit,
            state: Arc::new(InMemorySyncStateStore::new()),
            provider: Arc::new(provider),
        }
    }

    pub fn ctx(&self) -> ApplyContext {
        ApplyContext::new(self.store.clone(), self.audit_log.clone())
    }

    pub fn job(&self) -> SweepJob {
        SweepJob::new(
            self.provider.clone(),
            self.ctx(),
            self.state.clone(),
            SyncConfig::test_config().sweep,
        )
    }
}

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
}

pub fn booking(id: &str, status: &str, start: DateTime<Utc>) -> ExternalBooking {
    ExternalBooking {
        id: id.to_string(),
        status: status.to_string(),
        start_at: start,
        customer_id: Some("cust-1".to_string()),
        appointment_segments: vec![AppointmentSegment {
            duration_minutes: 60,
            team_member_id: Some("tm-1".to_string()),
            service_variation_id: None,
        }],
        updated_at: None,
        version: None,
    }
}
