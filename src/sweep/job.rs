//! The sweep run itself

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::apply::{self, ApplyContext, ApplyOutcome, ApplySource};
use crate::config::SweepConfig;
use crate::error::{ApplyError, ProviderError, SyncError};
use crate::metrics::global_metrics;
use crate::model::{ItemError, SyncRun, SyncWindow};
use crate::provider::{BookingQuery, ExternalBooking, ProviderClient};
use crate::sweep::SyncResult;
use crate::sync_state::SyncStateStore;

/// `external_id` recorded for an undecodable booking without a usable id
pub const UNKNOWN_BOOKING_ID: &str = "<unknown>";

/// One configured reconciliation job
pub struct SweepJob {
    provider: Arc<dyn ProviderClient>,
    ctx: ApplyContext,
    state: Arc<dyn SyncStateStore>,
    config: SweepConfig,
    shutdown: Option<watch::Receiver<bool>>,
}

impl SweepJob {
    /// Wire a job to its provider, stores and settings
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        ctx: ApplyContext,
        state: Arc<dyn SyncStateStore>,
        config: SweepConfig,
    ) -> Self {
        Self {
            provider,
            ctx,
            state,
            config,
            shutdown: None,
        }
    }

    /// Stop between page fetches once `shutdown` turns `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Run one sweep over `window`, or the default window when `None`
    ///
    /// Item failures are collected in the result. Lock contention, provider
    /// failures that outlast the retry budget, cancellation and persistence
    /// failures are returned as errors; in those cases no run is recorded.
    pub async fn run(&self, window: Option<SyncWindow>) -> Result<SyncResult, SyncError> {
        if !self.state.try_set_lock().await? {
            info!("Sweep already running, skipping");
            global_metrics().record_sweep_skipped();
            return Err(SyncError::AlreadyRunning);
        }

        let result = self.run_locked(window).await;

        if let Err(e) = self.state.release_lock().await {
            error!(error = %e, "Failed to release sync lock");
        }

        if let Err(e) = &result {
            let kind = match e {
                SyncError::FatalProvider { .. } => "sweep_provider",
                SyncError::Cancelled => "sweep_cancelled",
                _ => "sweep_persistence",
            };
            error!(error = %e, "Sweep aborted");
            global_metrics().record_error(kind);
        }
        result
    }

    #[instrument(skip(self), fields(run_id = tracing::field::Empty))]
    async fn run_locked(&self, window: Option<SyncWindow>) -> Result<SyncResult, SyncError> {
        let started = Instant::now();
        let started_at = Utc::now();

        let window = match window {
            Some(window) => window,
            None => self.default_window().await?,
        };
        if !window.is_valid() {
            return Err(SyncError::InvalidWindow(format!(
                "start {} is not before end {}",
                window.start, window.end
            )));
        }

        let mut run = SyncRun::begin(window, started_at);
        tracing::Span::current().record("run_id", tracing::field::display(run.id));
        info!(start = %window.start, end = %window.end, "Sweep started");

        self.check_cancelled()?;
        let queries = self.queries(window).await?;

        for query in &queries {
            let mut token: Option<String> = None;
            loop {
                self.check_cancelled()?;

                let page = self
                    .config
                    .retry
                    .run("list_bookings", || {
                        self.bounded(self.provider.list_bookings_in_window(query, token.as_deref()))
                    })
                    .await
                    .map_err(|source| SyncError::FatalProvider {
                        stage: "bookings",
                        source,
                    })?;

                debug!(
                    team_member = ?query.team_member_id,
                    items = page.items.len(),
                    rejected = page.rejected.len(),
                    "Applying bookings page"
                );
                for rejected in &page.rejected {
                    warn!(booking_id = ?rejected.id, error = %rejected.message, "Booking could not be decoded");
                    run.errors.push(ItemError {
                        external_id: rejected
                            .id
                            .clone()
                            .unwrap_or_else(|| UNKNOWN_BOOKING_ID.to_string()),
                        message: rejected.message.clone(),
                    });
                }
                for booking in &page.items {
                    self.apply_one(&window, booking, &mut run).await?;
                }

                match page.next_page_token {
                    Some(next) if token.as_deref() == Some(next.as_str()) => {
                        return Err(SyncError::FatalProvider {
                            stage: "bookings",
                            source: ProviderError::Transient(format!(
                                "pagination cursor '{next}' did not advance"
                            )),
                        });
                    }
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
        }

        run.finish(Utc::now());
        self.ctx.store.insert_run(&run).await?;

        let result = SyncResult::from_run(&run, started.elapsed());
        self.state.record_run(&result).await?;
        global_metrics().record_sweep(result.success, started.elapsed());

        info!(
            success = result.success,
            synced = result.synced,
            created = result.created,
            updated = result.updated,
            skipped = result.skipped,
            errors = result.errors.len(),
            duration_ms = result.duration_ms,
            "Sweep finished"
        );
        Ok(result)
    }

    async fn default_window(&self) -> Result<SyncWindow, SyncError> {
        let snapshot = self.state.get().await?;
        let now = Utc::now();
        let anchor = snapshot.last_success_at.unwrap_or(now);
        Ok(SyncWindow::around(
            anchor,
            now,
            self.config.lookback,
            self.config.lookahead,
        ))
    }

    /// One query per bookable resource, or a single location-wide query when there are none
    async fn queries(&self, window: SyncWindow) -> Result<Vec<BookingQuery>, SyncError> {
        let profiles = self
            .config
            .retry
            .run("list_resource_profiles", || {
                self.bounded(self.provider.list_resource_profiles())
            })
            .await
            .map_err(|source| SyncError::FatalProvider {
                stage: "resource_profiles",
                source,
            })?;

        let queries: Vec<BookingQuery> = profiles
            .iter()
            .filter(|p| p.is_bookable)
            .map(|p| BookingQuery::for_resource(window, p))
            .collect();

        debug!(
            profiles = profiles.len(),
            bookable = queries.len(),
            "Resolved resource profiles"
        );
        if queries.is_empty() {
            Ok(vec![BookingQuery::location(window)])
        } else {
            Ok(queries)
        }
    }

    async fn apply_one(
        &self,
        window: &SyncWindow,
        booking: &ExternalBooking,
        run: &mut SyncRun,
    ) -> Result<(), SyncError> {
        if !window.contains(booking.start_at) {
            debug!(booking_id = %booking.id, start_at = %booking.start_at, "Booking outside window");
            run.counts.skipped += 1;
            return Ok(());
        }

        match apply::booking::apply(&self.ctx, booking, ApplySource::Sweep).await {
            Ok(applied) => {
                run.counts.synced += 1;
                match applied.outcome {
                    ApplyOutcome::Created => run.counts.created += 1,
                    ApplyOutcome::Updated => run.counts.updated += 1,
                    ApplyOutcome::Skipped => run.counts.skipped += 1,
                }
                Ok(())
            }
            Err(ApplyError::Audit(e)) => Err(SyncError::Persistence(e)),
            Err(e) => {
                warn!(booking_id = %booking.id, error = %e, "Booking failed to apply");
                run.errors.push(ItemError {
                    external_id: booking.id.clone(),
                    message: e.to_string(),
                });
                Ok(())
            }
        }
    }

    /// Bound a provider call by the per-attempt timeout; hitting it is transient
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        match tokio::time::timeout(self.config.page_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transient(format!(
                "provider call timed out after {}ms",
                self.config.page_timeout.as_millis()
            ))),
        }
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        match &self.shutdown {
            Some(rx) if *rx.borrow() => {
                info!("Sweep cancelled");
                Err(SyncError::Cancelled)
            }
            _ => Ok(()),
        }
    }

    /// Sweep every `interval` until `shutdown` turns `true`
    pub async fn run_periodic(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), "Periodic sweep scheduled");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run(None).await {
                        Ok(result) if !result.success => {
                            warn!(errors = result.errors.len(), "Periodic sweep finished with item errors");
                        }
                        Ok(_) | Err(SyncError::AlreadyRunning) => {}
                        Err(e) => warn!(error = %e, "Periodic sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Periodic sweep stopping");
                        return;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SweepJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepJob")
            .field("config", &self.config)
            .field("cancellable", &self.shutdown.is_some())
            .finish_non_exhaustive()
    }
}
