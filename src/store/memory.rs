//! In-memory datastore
//!
//! Implements every repository over hash maps guarded by a single
//! [`parking_lot::RwLock`], with secondary indexes that enforce the same
//! unique constraints a relational backend would. The whole state can be
//! written to and restored from a JSON snapshot so the CLI keeps its records
//! between invocations.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PersistenceError, StoreError};
use crate::model::{Appointment, Invoice, Payment, SyncRun};
use crate::store::{AppointmentRepository, InvoiceRepository, PaymentRepository, SyncRunRepository};

#[derive(Debug, Default)]
struct Tables {
    appointments: HashMap<Uuid, Appointment>,
    appointments_by_external: HashMap<String, Uuid>,
    payments: HashMap<Uuid, Payment>,
    payments_by_external: HashMap<String, Uuid>,
    payments_by_reference: HashMap<String, Uuid>,
    invoices: HashMap<Uuid, Invoice>,
    invoices_by_key: HashMap<String, Uuid>,
    runs: Vec<SyncRun>,
}

/// Serialized form of the store
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    appointments: Vec<Appointment>,
    payments: Vec<Payment>,
    invoices: Vec<Invoice>,
    runs: Vec<SyncRun>,
}

/// Thread-safe in-memory implementation of all repositories
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a store from a snapshot file; a missing file yields an empty store
    pub async fn load(path: &Path) -> Result<Self, PersistenceError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;

        let store = Self::new();
        {
            let mut tables = store.tables.write();
            for appointment in snapshot.appointments {
                if let Some(ext) = &appointment.external_booking_id {
                    tables
                        .appointments_by_external
                        .insert(ext.clone(), appointment.id);
                }
                tables.appointments.insert(appointment.id, appointment);
            }
            for payment in snapshot.payments {
                index_payment(&mut tables, &payment);
                tables.payments.insert(payment.id, payment);
            }
            for invoice in snapshot.invoices {
                tables
                    .invoices_by_key
                    .insert(invoice.correlation_key.clone(), invoice.id);
                tables.invoices.insert(invoice.id, invoice);
            }
            tables.runs = snapshot.runs;
        }

        debug!(path = %path.display(), "Restored datastore snapshot");
        Ok(store)
    }

    /// Write the current state to `path` atomically (temp file + rename)
    pub async fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        let snapshot = {
            let tables = self.tables.read();
            Snapshot {
                appointments: tables.appointments.values().cloned().collect(),
                payments: tables.payments.values().cloned().collect(),
                invoices: tables.invoices.values().cloned().collect(),
                runs: tables.runs.clone(),
            }
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let tmp = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn index_payment(tables: &mut Tables, payment: &Payment) {
    if let Some(ext) = &payment.external_payment_id {
        tables.payments_by_external.insert(ext.clone(), payment.id);
    }
    if let Some(reference) = &payment.reference_id {
        tables
            .payments_by_reference
            .entry(reference.clone())
            .or_insert(payment.id);
    }
}

#[async_trait]
impl AppointmentRepository for InMemoryStore {
    async fn find_appointment_by_external_id(
        &self,
        external_booking_id: &str,
    ) -> Result<Option<Appointment>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .appointments_by_external
            .get(external_booking_id)
            .and_then(|id| tables.appointments.get(id))
            .cloned())
    }

    async fn insert_appointment(&self, appointment: &Appointment) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if let Some(ext) = &appointment.external_booking_id {
            if tables.appointments_by_external.contains_key(ext) {
                return Err(StoreError::Conflict {
                    resource: "appointment",
                    key: ext.clone(),
                });
            }
            tables
                .appointments_by_external
                .insert(ext.clone(), appointment.id);
        }
        tables
            .appointments
            .insert(appointment.id, appointment.clone());
        Ok(())
    }

    async fn update_appointment(&self, appointment: &Appointment) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let previous = tables
            .appointments
            .get(&appointment.id)
            .ok_or_else(|| StoreError::NotFound {
                resource: "appointment",
                id: appointment.id.to_string(),
            })?
            .external_booking_id
            .clone();

        if previous != appointment.external_booking_id {
            if let Some(ext) = &appointment.external_booking_id {
                match tables.appointments_by_external.get(ext) {
                    Some(owner) if *owner != appointment.id => {
                        return Err(StoreError::Conflict {
                            resource: "appointment",
                            key: ext.clone(),
                        })
                    }
                    _ => {}
                }
                tables
                    .appointments_by_external
                    .insert(ext.clone(), appointment.id);
            }
            if let Some(old) = previous {
                tables.appointments_by_external.remove(&old);
            }
        }

        tables
            .appointments
            .insert(appointment.id, appointment.clone());
        Ok(())
    }

    async fn list_appointments(&self) -> Result<Vec<Appointment>, StoreError> {
        let mut appointments: Vec<_> = self.tables.read().appointments.values().cloned().collect();
        appointments.sort_by_key(|a| a.start_at);
        Ok(appointments)
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn find_payment_by_external_id(
        &self,
        external_payment_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .payments_by_external
            .get(external_payment_id)
            .and_then(|id| tables.payments.get(id))
            .cloned())
    }

    async fn find_payment_by_reference_id(
        &self,
        reference_id: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .payments_by_reference
            .get(reference_id)
            .and_then(|id| tables.payments.get(id))
            .cloned())
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if let Some(ext) = &payment.external_payment_id {
            if tables.payments_by_external.contains_key(ext) {
                return Err(StoreError::Conflict {
                    resource: "payment",
                    key: ext.clone(),
                });
            }
        }
        index_payment(&mut tables, payment);
        tables.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn update_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let previous = tables
            .payments
            .get(&payment.id)
            .ok_or_else(|| StoreError::NotFound {
                resource: "payment",
                id: payment.id.to_string(),
            })?
            .external_payment_id
            .clone();

        if previous != payment.external_payment_id {
            if let Some(ext) = &payment.external_payment_id {
                match tables.payments_by_external.get(ext) {
                    Some(owner) if *owner != payment.id => {
                        return Err(StoreError::Conflict {
                            resource: "payment",
                            key: ext.clone(),
                        })
                    }
                    _ => {}
                }
            }
            if let Some(old) = previous {
                tables.payments_by_external.remove(&old);
            }
        }

        index_payment(&mut tables, payment);
        tables.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn list_payments(&self) -> Result<Vec<Payment>, StoreError> {
        Ok(self.tables.read().payments.values().cloned().collect())
    }
}

#[async_trait]
impl InvoiceRepository for InMemoryStore {
    async fn find_invoice_by_correlation_key(
        &self,
        correlation_key: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .invoices_by_key
            .get(correlation_key)
            .and_then(|id| tables.invoices.get(id))
            .cloned())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.invoices_by_key.contains_key(&invoice.correlation_key) {
            return Err(StoreError::Conflict {
                resource: "invoice",
                key: invoice.correlation_key.clone(),
            });
        }
        tables
            .invoices_by_key
            .insert(invoice.correlation_key.clone(), invoice.id);
        tables.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn update_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let previous_key = tables
            .invoices
            .get(&invoice.id)
            .ok_or_else(|| StoreError::NotFound {
                resource: "invoice",
                id: invoice.id.to_string(),
            })?
            .correlation_key
            .clone();

        if previous_key != invoice.correlation_key {
            return Err(StoreError::Backend(
                "invoice correlation keys are immutable".to_string(),
            ));
        }
        tables.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn list_invoices(&self) -> Result<Vec<Invoice>, StoreError> {
        Ok(self.tables.read().invoices.values().cloned().collect())
    }
}

#[async_trait]
impl SyncRunRepository for InMemoryStore {
    async fn insert_run(&self, run: &SyncRun) -> Result<(), StoreError> {
        self.tables.write().runs.push(run.clone());
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRun>, StoreError> {
        let tables = self.tables.read();
        Ok(tables.runs.iter().rev().take(limit).cloned().collect())
    }
}
