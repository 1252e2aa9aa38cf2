//! Write-through snapshot persistence for the in-memory store
//!
//! [`SnapshotStore`] rewrites the JSON snapshot after every committed write,
//! so a crash loses at most the write in flight. Writes are serialized so an
//! older snapshot never replaces a newer one.
//!
//! [`SnapshotOwner`] claims the snapshot for one process. Two processes
//! each holding their own copy would overwrite each other's records.

use std::future::Future;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use crate::error::{PersistenceError, StoreError};
use crate::model::{Appointment, Invoice, Payment, SyncRun};
use crate::store::{
    AppointmentRepository, InMemoryStore, InvoiceRepository, PaymentRepository,
    SyncRunRepository,
};

/// In-memory store that persists a snapshot after each write
#[derive(Debug)]
pub struct SnapshotStore {
    inner: InMemoryStore,
    path: PathBuf,
    writes: tokio::sync::Mutex<()>,
}

impl SnapshotStore {
    /// Load the snapshot at `path`, or start empty when there is none
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let inner = InMemoryStore::load(&path).await?;
        Ok(Self {
            inner,
            path,
            writes: tokio::sync::Mutex::new(()),
        })
    }

    /// Snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the snapshot now
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        let _writes = self.writes.lock().await;
        self.inner.save(&self.path).await
    }

    async fn commit(
        &self,
        write: impl Future<Output = Result<(), StoreError>>,
    ) -> Result<(), StoreError> {
        let _writes = self.writes.lock().await;
        write.await?;
        self.inner.save(&self.path).await.map_err(|e| {
            error!(path = %self.path.display(), error = %e, "Snapshot write failed");
            StoreError::Backend(format!("snapshot not persisted: {e}"))
        })
    }
}

#[async_trait]
impl AppointmentRepository for SnapshotStore {
    async fn find_appointment_by_external_id(
        &self,
        external_booking_id: &str,
    ) -> Result<Option<Appointment>, StoreError> {
        self.inner
            .find_appointment_by_external_id(external_booking_id)
            .await
    }

    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError> {
        self.commit(self.inner.insert_appointment(appointment)).await
    }

    async fn update_appointment(&self, appointment: &Appointment) -> Result<(), StoreError> {
        self.commit(self.inner.update_appointment(appointment)).await
    }

    async fn list_appointments(&self) -> Result<Vec<Appointment>, StoreError> {
        self.inner.list_appointments().await
    }
}

#[async_trait]
impl PaymentRepository for SnapshotStore {
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
        self.commit(self.inner.insert_payment(payment)).await
    }

    async fn update_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        self.commit(self.inner.update_payment(payment)).await
    }

    async fn list_payments(&self) -> Result<Vec<Payment>, StoreError> {
        self.inner.list_payments().await
    }
}

#[async_trait]
impl InvoiceRepository for SnapshotStore {
    async fn find_invoice_by_correlation_key(
        &self,
        correlation_key: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        self.inner
            .find_invoice_by_correlation_key(correlation_key)
            .await
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        self.commit(self.inner.insert_invoice(invoice)).await
    }

    async fn update_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        self.commit(self.inner.update_invoice(invoice)).await
    }

    async fn list_invoices(&self) -> Result<Vec<Invoice>, StoreError> {
        self.inner.list_invoices().await
    }
}

#[async_trait]
impl SyncRunRepository for SnapshotStore {
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.commit(self.inner.insert_run(run)).await
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        self.inner.recent_runs(limit).await
    }
}

// =============================================================================
// Ownership
// =============================================================================

/// Exclusive claim on a snapshot, released on drop
///
/// The claim is a `<snapshot>.owner` file holding the owner's pid. A claim
/// left behind by a process that no longer exists is taken over.
#[derive(Debug)]
pub struct SnapshotOwner {
    path: PathBuf,
}

impl SnapshotOwner {
    /// Claim `snapshot`; `InUse` while another live process holds it
    pub async fn acquire(snapshot: &Path) -> Result<Self, PersistenceError> {
        let path = snapshot.with_extension("json.owner");

        for _ in 0..2 {
            match Self::create(&path).await {
                Ok(()) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let owner = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text.trim().parse::<u32>().ok(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match owner {
                Some(pid) if process_alive(pid) => {
                    return Err(PersistenceError::InUse { path, pid });
                }
                _ => {
                    warn!(path = %path.display(), pid = ?owner, "Taking over abandoned snapshot claim");
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        Err(PersistenceError::Backend(format!(
            "could not claim {}",
            path.display()
        )))
    }

    async fn create(path: &Path) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.write_all(std::process::id().to_string().as_bytes())
            .await?;
        file.sync_all().await
    }
}

impl Drop for SnapshotOwner {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release snapshot claim");
        }
    }
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
