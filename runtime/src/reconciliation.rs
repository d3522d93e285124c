//! Background reconciliation sweep.
//!
//! Finds reservations stuck mid-transition and drives them to a terminal or
//! flagged state:
//!
//! - stale ALLOCATED rows (allocated, never activated) are revoked, or moved to
//!   FAILED when configured to flag them,
//! - stale REVOKING rows resume `revoke`, which skips a release already done,
//! - rows that cannot be resolved move to FAILED and are dead-lettered.
//!
//! REVOKED rows past the retention window are purged at the end of each sweep.

use crate::config::{ReconciliationConfig, StaleAllocatedPolicy};
use crate::lifecycle::AddressLifecycleService;
use crate::metrics::ReconciliationMetrics;
use crate::{DeadLetterQueue, HealthCheck};
use netprov_core::adapters::ReservationStore;
use netprov_core::environment::Clock;
use netprov_core::error::{LifecycleError, StoreError};
use netprov_core::family::Protocol;
use netprov_core::lifecycle::LifecycleState;
use netprov_core::reservation::{AddressReservation, ReservationKey};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::watch;

/// Dead-letter queue name for rows the sweep could not resolve.
pub const RECONCILIATION_QUEUE: &str = "reconciliation";

const STALE_STATES: &[LifecycleState] = &[LifecycleState::Allocated, LifecycleState::Revoking];

/// A row the sweep gave up on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnresolvedReservation {
    /// Row key
    pub key: ReservationKey,
    /// State the row was found in
    pub state: LifecycleState,
}

/// Counts from one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Stale rows found
    pub examined: usize,
    /// Rows driven to REVOKED
    pub resolved: usize,
    /// Stale ALLOCATED rows moved to FAILED by policy
    pub flagged: usize,
    /// Rows that could not be resolved
    pub failed: usize,
    /// Rows that changed state under the sweep and were left alone
    pub skipped: usize,
    /// REVOKED rows purged
    pub purged: u64,
}

enum Resolution {
    Resolved,
    Flagged,
    Skipped,
}

/// Periodic sweep over one tenant's reservations.
#[derive(Clone)]
pub struct Reconciler {
    tenant_id: String,
    services: HashMap<Protocol, Arc<dyn AddressLifecycleService>>,
    store: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
    config: ReconciliationConfig,
    dead_letters: DeadLetterQueue<UnresolvedReservation>,
    last_report: Arc<Mutex<Option<SweepReport>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("tenant_id", &self.tenant_id)
            .field("protocols", &self.services.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Sweep for `tenant_id` with no lifecycle services yet.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        store: Arc<dyn ReservationStore>,
        clock: Arc<dyn Clock>,
        config: ReconciliationConfig,
    ) -> Self {
        let dead_letters = DeadLetterQueue::new(RECONCILIATION_QUEUE, config.dead_letter_capacity);
        Self {
            tenant_id: tenant_id.into(),
            services: HashMap::new(),
            store,
            clock,
            config,
            dead_letters,
            last_report: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolve rows of `service`'s protocol through `service`.
    #[must_use]
    pub fn with_service(mut self, service: Arc<dyn AddressLifecycleService>) -> Self {
        self.services.insert(service.protocol(), service);
        self
    }

    /// Rows the sweep gave up on.
    #[must_use]
    pub const fn dead_letters(&self) -> &DeadLetterQueue<UnresolvedReservation> {
        &self.dead_letters
    }

    /// Report of the most recent sweep.
    #[must_use]
    pub fn last_report(&self) -> Option<SweepReport> {
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one sweep.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if stale rows cannot be listed. Per-row failures
    /// are counted in the report, not returned.
    #[tracing::instrument(skip(self), fields(tenant_id = %self.tenant_id))]
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let started = Instant::now();
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let stale = self
            .store
            .find_stale(&self.tenant_id, STALE_STATES, now - self.config.stale_after())
            .await?;

        for row in stale {
            report.examined += 1;
            match self.resolve(&row).await {
                Ok(Resolution::Resolved) => report.resolved += 1,
                Ok(Resolution::Flagged) => report.flagged += 1,
                Ok(Resolution::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    self.give_up(&row, &e).await;
                }
            }
        }

        match self
            .store
            .purge_revoked(&self.tenant_id, now - self.config.retention())
            .await
        {
            Ok(purged) => report.purged = purged,
            Err(e) => tracing::warn!(error = %e, "Purge of revoked reservations failed"),
        }

        ReconciliationMetrics::record_sweep(
            report.resolved,
            report.flagged,
            report.failed,
            report.purged,
            started.elapsed(),
        );
        tracing::info!(
            examined = report.examined,
            resolved = report.resolved,
            flagged = report.flagged,
            failed = report.failed,
            skipped = report.skipped,
            purged = report.purged,
            "Reconciliation sweep finished"
        );

        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report);
        Ok(report)
    }

    async fn resolve(&self, row: &AddressReservation) -> Result<Resolution, LifecycleError> {
        let Some(service) = self.services.get(&row.protocol) else {
            tracing::warn!(protocol = %row.protocol, "No lifecycle service for protocol");
            return Ok(Resolution::Skipped);
        };
        let subscriber_id = row.subscriber_id.as_str();

        let outcome = match (row.lifecycle_state, self.config.stale_allocated) {
            (LifecycleState::Allocated, StaleAllocatedPolicy::Flag) => service
                .mark_failed(subscriber_id, "allocated but never activated")
                .await
                .map(|_| Resolution::Flagged),
            (LifecycleState::Allocated | LifecycleState::Revoking, _) => service
                .revoke(subscriber_id, None, true)
                .await
                .map(|_| Resolution::Resolved),
            _ => Ok(Resolution::Skipped),
        };

        match outcome {
            // The row moved on between listing and acting on it.
            Err(LifecycleError::InvalidTransition(_) | LifecycleError::NotFound { .. }) => {
                tracing::debug!(subscriber_id, "Row changed under the sweep");
                Ok(Resolution::Skipped)
            }
            other => other,
        }
    }

    async fn give_up(&self, row: &AddressReservation, error: &LifecycleError) {
        let subscriber_id = row.subscriber_id.as_str();
        tracing::error!(subscriber_id, protocol = %row.protocol, error = %error, "Could not resolve stale reservation");

        if let Some(service) = self.services.get(&row.protocol) {
            let reason = format!("reconciliation failed: {error}");
            if let Err(e) = service.mark_failed(subscriber_id, &reason).await {
                tracing::warn!(subscriber_id, error = %e, "Could not flag reservation as failed");
            }
        }

        self.dead_letters.push(
            UnresolvedReservation {
                key: row.key(),
                state: row.lifecycle_state,
            },
            error.to_string(),
            1,
        );
    }

    /// Sweep every `interval` until `shutdown` flips to `true` or its sender drops.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            tracing::info!("Reconciliation disabled");
            return;
        }

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.config.interval_secs, "Reconciliation started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!(error = %e, "Reconciliation sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Reconciliation stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Health of the sweep and its dead-letter queue.
    #[must_use]
    pub fn health_checks(&self) -> Vec<HealthCheck> {
        let sweep = match self.last_report() {
            None => HealthCheck::healthy("reconciliation").with_metadata("last_sweep", "none"),
            Some(report) if report.failed > 0 => HealthCheck::degraded(
                "reconciliation",
                format!("{} stale reservation(s) unresolved", report.failed),
            ),
            Some(report) => HealthCheck::healthy("reconciliation")
                .with_metadata("resolved", report.resolved.to_string())
                .with_metadata("purged", report.purged.to_string()),
        };
        vec![sweep, self.dead_letters.health_check()]
    }
}
