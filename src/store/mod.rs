//! Datastore repositories
//!
//! The appliers and the sweep talk to storage only through these traits.
//! Implementations must enforce uniqueness on `externalBookingId`,
//! `externalPaymentId` and `correlationKey`, and report a violated constraint
//! as [`StoreError::Conflict`] so the applier can retry as an update.

pub mod memory;
pub mod snapshot;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{Appointment, Invoice, Payment, SyncRun};

pub use memory::InMemoryStore;
pub use snapshot::{SnapshotOwner, SnapshotStore};

/// Appointment storage keyed by provider booking id
#[async_trait]
pub trait AppointmentRepository: Send + Sync {
    /// Look up by provider booking id
    async fn find_appointment_by_external_id(
        &self,
        external_booking_id: &str,
    ) -> Result<Option<Appointment>, StoreError>;

    /// Insert; `Conflict` if the external id is already taken
    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError>;

    /// Replace the row with the same local id
    async fn update_appointment(&self, appointment: &Appointment) -> Result<(), StoreError>;

    /// All appointments
    async fn list_appointments(&self) -> Result<Vec<Appointment>, StoreError>;
}

/// Payment storage keyed by provider payment id, with reference id fallback
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Look up by provider payment id
    async fn find_payment_by_external_id(
        &self,
        external_payment_id: &str,
    ) -> Result<Option<Payment>, StoreError>;

    /// Look up by the shop's reference id
    async fn find_payment_by_reference_id(
        &self,
        reference_id: &str,
    ) -> Result<Option<Payment>, StoreError>;

    /// Insert; `Conflict` if the external payment id is already taken
    async fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError>;

    /// Replace the row with the same local id
    async fn update_payment(&self, payment: &Payment) -> Result<(), StoreError>;

    /// All payments
    async fn list_payments(&self) -> Result<Vec<Payment>, StoreError>;
}

/// Invoice storage keyed by correlation key
#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    /// Exact match on the stored correlation key
    async fn find_invoice_by_correlation_key(
        &self,
        correlation_key: &str,
    ) -> Result<Option<Invoice>, StoreError>;

    /// Insert; `Conflict` if the correlation key is already taken
    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError>;

    /// Replace the row with the same local id
    async fn update_invoice(&self, invoice: &Invoice) -> Result<(), StoreError>;

    /// All invoices
    async fn list_invoices(&self) -> Result<Vec<Invoice>, StoreError>;
}

/// History of terminal sync runs
#[async_trait]
pub trait SyncRunRepository: Send + Sync {
    /// Persist a finished run
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError>;

    /// Most recent runs, newest first
    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError>;
}

/// Everything the appliers and the sweep need from storage
pub trait Datastore:
    AppointmentRepository + PaymentRepository + InvoiceRepository + SyncRunRepository
{
}

impl<T> Datastore for T where
    T: AppointmentRepository + PaymentRepository + InvoiceRepository + SyncRunRepository
{
}
