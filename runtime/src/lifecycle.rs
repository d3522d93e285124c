//! Address lifecycle service.
//!
//! [`AddressLifecycleService`] is the one interface step handlers and the
//! reconciliation sweep use; [`AddressLifecycleManager<F>`] implements it for
//! any [`AddressFamily`].
//!
//! Every operation follows the same shape:
//!
//! 1. load the row and check the move against the transition table,
//! 2. commit the new state with a compare-and-swap on `version`
//!    (one retry of the whole operation on conflict),
//! 3. only then talk to the session controller, and record what it said in
//!    `metadata` with a best-effort follow-up save.
//!
//! The state commit is authoritative. Session failures are reported in the
//! [`LifecycleResult`] and never undo an ownership transition.

use crate::config::LifecycleConfig;
use crate::metrics::LifecycleMetrics;
use crate::session::SessionGate;
use futures::future::BoxFuture;
use netprov_core::adapters::{ExternalAllocator, ReservationStore};
use netprov_core::environment::Clock;
use netprov_core::error::{AllocationError, LifecycleError, StoreError};
use netprov_core::family::{AddressFamily, Ipv4, Ipv6, Protocol};
use netprov_core::lifecycle::{InvalidTransitionError, LifecycleState, validate_transition};
use netprov_core::reservation::{
    AddressReservation, LifecycleResult, ReservationKey, SessionContext, SessionOutcome, meta,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::Instrument;

/// Input of [`AddressLifecycleService::allocate`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AllocateRequest {
    /// Subscriber receiving the address
    pub subscriber_id: String,
    /// Pool to draw from; ignored for the address itself when `requested_address` is set
    pub pool_id: Option<String>,
    /// Static address; the allocator is not consulted
    pub requested_address: Option<String>,
    /// Extra metadata stored on the reservation
    pub metadata: Map<String, Value>,
}

impl AllocateRequest {
    /// Request for `subscriber_id` with nothing else set.
    #[must_use]
    pub fn new(subscriber_id: impl Into<String>) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            ..Self::default()
        }
    }

    /// Draw from `pool_id`.
    #[must_use]
    pub fn with_pool(mut self, pool_id: impl Into<String>) -> Self {
        self.pool_id = Some(pool_id.into());
        self
    }

    /// Assign `address` statically.
    #[must_use]
    pub fn with_requested_address(mut self, address: impl Into<String>) -> Self {
        self.requested_address = Some(address.into());
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Operations on one subscriber's address of one family.
///
/// Every mutating operation returns the uniform [`LifecycleResult`] on
/// success; transition, allocation, concurrency and store failures are errors.
pub trait AddressLifecycleService: Send + Sync {
    /// Family this service manages.
    fn protocol(&self) -> Protocol;

    /// PENDING -> ALLOCATED, reserving from the pool or assigning statically.
    fn allocate<'a>(
        &'a self,
        request: &'a AllocateRequest,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>>;

    /// ALLOCATED -> ACTIVE, optionally announcing the address to the session.
    fn activate<'a>(
        &'a self,
        subscriber_id: &'a str,
        session: Option<&'a SessionContext>,
        send_session_update: bool,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>>;

    /// ACTIVE -> SUSPENDED; a no-op success when already SUSPENDED.
    fn suspend<'a>(
        &'a self,
        subscriber_id: &'a str,
        session: Option<&'a SessionContext>,
        reason: Option<&'a str>,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>>;

    /// SUSPENDED -> ACTIVE.
    fn reactivate<'a>(
        &'a self,
        subscriber_id: &'a str,
        session: Option<&'a SessionContext>,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>>;

    /// {ALLOCATED, ACTIVE, SUSPENDED} -> REVOKING -> REVOKED.
    ///
    /// Idempotent on REVOKED; resumes on REVOKING.
    fn revoke<'a>(
        &'a self,
        subscriber_id: &'a str,
        session: Option<&'a SessionContext>,
        release_to_pool: bool,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>>;

    /// Current reservation, if any.
    fn get_state<'a>(
        &'a self,
        subscriber_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<AddressReservation>, LifecycleError>>;

    /// FAILED -> PENDING (operator recovery).
    fn recover<'a>(
        &'a self,
        subscriber_id: &'a str,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>>;

    /// Any non-terminal state -> FAILED, recording `reason`.
    fn mark_failed<'a>(
        &'a self,
        subscriber_id: &'a str,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>>;
}

/// One operation's allowed move.
struct Move {
    target: LifecycleState,
    sources: &'static [LifecycleState],
    /// Return the row untouched when it is already in `target`
    idempotent: bool,
}

const ACTIVATE: Move = Move {
    target: LifecycleState::Active,
    sources: &[LifecycleState::Allocated],
    idempotent: false,
};

const SUSPEND: Move = Move {
    target: LifecycleState::Suspended,
    sources: &[LifecycleState::Active],
    idempotent: true,
};

const REACTIVATE: Move = Move {
    target: LifecycleState::Active,
    sources: &[LifecycleState::Suspended],
    idempotent: false,
};

const BEGIN_REVOKE: Move = Move {
    target: LifecycleState::Revoking,
    sources: &[
        LifecycleState::Allocated,
        LifecycleState::Active,
        LifecycleState::Suspended,
    ],
    idempotent: true,
};

const FINISH_REVOKE: Move = Move {
    target: LifecycleState::Revoked,
    sources: &[LifecycleState::Revoking],
    idempotent: false,
};

const RECOVER: Move = Move {
    target: LifecycleState::Pending,
    sources: &[LifecycleState::Failed],
    idempotent: false,
};

const MARK_FAILED: Move = Move {
    target: LifecycleState::Failed,
    sources: &[
        LifecycleState::Pending,
        LifecycleState::Allocated,
        LifecycleState::Active,
        LifecycleState::Suspended,
        LifecycleState::Revoking,
    ],
    idempotent: true,
};

struct Committed {
    reservation: AddressReservation,
    changed: bool,
}

/// [`AddressLifecycleService`] for one address family.
pub struct AddressLifecycleManager<F: AddressFamily> {
    tenant_id: String,
    store: Arc<dyn ReservationStore>,
    allocator: Arc<dyn ExternalAllocator>,
    session: SessionGate,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
    family: PhantomData<fn() -> F>,
}

/// IPv4 host-address lifecycle.
pub type Ipv4LifecycleService = AddressLifecycleManager<Ipv4>;

/// IPv6 address / delegated-prefix lifecycle.
pub type Ipv6LifecycleService = AddressLifecycleManager<Ipv6>;

impl<F: AddressFamily> std::fmt::Debug for AddressLifecycleManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressLifecycleManager")
            .field("tenant_id", &self.tenant_id)
            .field("protocol", &F::PROTOCOL)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<F: AddressFamily> AddressLifecycleManager<F> {
    /// Manager writing reservations of `tenant_id`.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        store: Arc<dyn ReservationStore>,
        allocator: Arc<dyn ExternalAllocator>,
        session: SessionGate,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            store,
            allocator,
            session,
            clock,
            config,
            family: PhantomData,
        }
    }

    fn key(&self, subscriber_id: &str) -> ReservationKey {
        ReservationKey::new(&self.tenant_id, subscriber_id, F::PROTOCOL)
    }

    fn not_found(subscriber_id: &str) -> LifecycleError {
        LifecycleError::NotFound {
            subscriber_id: subscriber_id.to_string(),
            protocol: F::PROTOCOL,
        }
    }

    fn concurrent(subscriber_id: &str) -> LifecycleError {
        LifecycleError::ConcurrentModification {
            subscriber_id: subscriber_id.to_string(),
            protocol: F::PROTOCOL,
        }
    }

    async fn load(&self, key: &ReservationKey) -> Result<Option<AddressReservation>, StoreError> {
        let timeout = self.config.store_timeout();
        tokio::time::timeout(timeout, self.store.load(key))
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout)))
    }

    async fn save(
        &self,
        reservation: &AddressReservation,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let timeout = self.config.store_timeout();
        tokio::time::timeout(timeout, self.store.save(reservation, expected_version))
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout)))
    }

    async fn reserve(&self, pool_id: &str) -> Result<String, AllocationError> {
        let timeout = self.config.allocator_timeout();
        tokio::time::timeout(timeout, self.allocator.reserve(pool_id, None))
            .await
            .unwrap_or(Err(AllocationError::Timeout(timeout)))
    }

    async fn release(&self, address: &str) -> Result<(), AllocationError> {
        let timeout = self.config.allocator_timeout();
        tokio::time::timeout(timeout, self.allocator.release(address))
            .await
            .unwrap_or(Err(AllocationError::Timeout(timeout)))
    }

    async fn release_quietly(&self, address: &str) {
        if let Err(e) = self.release(address).await {
            tracing::warn!(address, error = %e, "Failed to return unused address to pool");
        }
    }

    /// Run `attempt` once more if it lost an optimistic-concurrency race.
    async fn retry_on_conflict<T, Fut>(
        &self,
        subscriber_id: &str,
        mut attempt: impl FnMut() -> Fut,
    ) -> Result<T, LifecycleError>
    where
        Fut: Future<Output = Result<T, LifecycleError>>,
    {
        let mut conflicted = false;
        loop {
            match attempt().await {
                Err(LifecycleError::Store(StoreError::VersionConflict { .. })) => {
                    LifecycleMetrics::record_conflict(F::PROTOCOL);
                    if conflicted {
                        return Err(Self::concurrent(subscriber_id));
                    }
                    tracing::debug!("Version conflict, retrying operation once");
                    conflicted = true;
                }
                other => return other,
            }
        }
    }

    /// Load, check and commit one move. Conflicts surface as `Store(VersionConflict)`.
    async fn commit_once(
        &self,
        subscriber_id: &str,
        step: &Move,
        prepare: &(impl Fn(&mut AddressReservation) + Sync),
    ) -> Result<Committed, LifecycleError> {
        let mut reservation = self
            .load(&self.key(subscriber_id))
            .await?
            .ok_or_else(|| Self::not_found(subscriber_id))?;
        let from = reservation.lifecycle_state;

        if step.idempotent && from == step.target {
            return Ok(Committed {
                reservation,
                changed: false,
            });
        }
        if !step.sources.contains(&from) {
            return Err(InvalidTransitionError {
                from,
                to: step.target,
            }
            .into());
        }

        let expected = reservation.version;
        reservation.transition_to(step.target, self.clock.now())?;
        prepare(&mut reservation);
        reservation.version = self.save(&reservation, Some(expected)).await?;

        LifecycleMetrics::record_transition(F::PROTOCOL, from, step.target);
        tracing::info!(
            from = %from,
            to = %step.target,
            version = reservation.version,
            "Lifecycle transition committed"
        );
        Ok(Committed {
            reservation,
            changed: true,
        })
    }

    async fn commit(
        &self,
        subscriber_id: &str,
        step: &Move,
        prepare: impl Fn(&mut AddressReservation) + Sync,
    ) -> Result<Committed, LifecycleError> {
        self.retry_on_conflict(subscriber_id, || self.commit_once(subscriber_id, step, &prepare))
            .await
    }

    /// Write adapter echo data; failures are logged, never returned.
    async fn persist_metadata(&self, reservation: &mut AddressReservation, updates: Vec<(&str, Value)>) {
        for (key, value) in updates {
            reservation.metadata.insert(key.to_string(), value);
        }
        let expected = reservation.version;
        match self.save(reservation, Some(expected)).await {
            Ok(version) => reservation.version = version,
            Err(e) => {
                tracing::warn!(error = %e, "Best-effort metadata update not persisted");
            }
        }
    }

    fn coa_attributes(address: Option<&str>, ctx: &SessionContext) -> BTreeMap<String, String> {
        let mut attributes = address.map(F::session_attributes).unwrap_or_default();
        attributes.extend(ctx.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        attributes
    }

    async fn allocate_once(&self, request: &AllocateRequest) -> Result<LifecycleResult, LifecycleError> {
        let key = self.key(&request.subscriber_id);
        let now = self.clock.now();

        let (mut reservation, expected) = match self.load(&key).await? {
            Some(row) if row.lifecycle_state == LifecycleState::Revoked => {
                (AddressReservation::pending(&key, now), Some(row.version))
            }
            Some(row) => {
                let version = row.version;
                (row, Some(version))
            }
            None => (AddressReservation::pending(&key, now), None),
        };
        let from = reservation.lifecycle_state;
        validate_transition(from, LifecycleState::Allocated)?;

        // A recovered row still carries the pool address from before it failed.
        if let Some(previous) = held_pool_address(&reservation) {
            self.release(&previous).await?;
            tracing::info!(address = %previous, "Returned address held before recovery");
        }

        let requested = request
            .requested_address
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        // `reserved` holds the allocator's own spelling so it can be handed back verbatim.
        let (address, reserved) = if let Some(raw) = requested {
            (F::canonicalize(raw)?, None)
        } else {
            let pool_id = request
                .pool_id
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .ok_or(AllocationError::MissingPool)?;
            let raw = self.reserve(pool_id).await?;
            match F::canonicalize(&raw) {
                Ok(address) => (address, Some(raw)),
                Err(e) => {
                    self.release_quietly(&raw).await;
                    return Err(e.into());
                }
            }
        };

        let mut metadata = request.metadata.clone();
        let assignment = if reserved.is_some() {
            meta::ASSIGNMENT_POOL
        } else {
            meta::ASSIGNMENT_STATIC
        };
        metadata.insert(meta::ASSIGNMENT.to_string(), Value::from(assignment));
        metadata.extend(F::allocation_metadata(&address));

        reservation.pool_id.clone_from(&request.pool_id);
        reservation.address = Some(address);
        reservation.metadata = metadata;
        reservation.activated_at = None;
        reservation.suspended_at = None;
        reservation.revoked_at = None;
        reservation.transition_to(LifecycleState::Allocated, now)?;

        match self.save(&reservation, expected).await {
            Ok(version) => reservation.version = version,
            Err(e) => {
                if let Some(raw) = &reserved {
                    self.release_quietly(raw).await;
                }
                return Err(e.into());
            }
        }

        LifecycleMetrics::record_transition(F::PROTOCOL, from, LifecycleState::Allocated);
        tracing::info!(
            address = reservation.address.as_deref().unwrap_or(""),
            assignment,
            version = reservation.version,
            "Address allocated"
        );
        Ok(LifecycleResult::completed(reservation, SessionOutcome::NotRequested))
    }

    /// Record the session outcome and build the result.
    async fn finish(
        &self,
        mut reservation: AddressReservation,
        outcome: SessionOutcome,
        persist: bool,
        to_error: fn(String) -> LifecycleError,
    ) -> LifecycleResult {
        if persist && outcome != SessionOutcome::NotRequested {
            self.persist_metadata(&mut reservation, session_metadata(&outcome))
                .await;
        }
        let failure = session_failure(&outcome);
        let result = LifecycleResult::completed(reservation, outcome);
        match failure {
            Some(message) => {
                let error = to_error(message);
                LifecycleMetrics::record_error(F::PROTOCOL, "session", error.kind());
                result.with_session_error(&error)
            }
            None => result,
        }
    }

    async fn activate_inner(
        &self,
        subscriber_id: &str,
        session: Option<&SessionContext>,
        send_session_update: bool,
    ) -> Result<LifecycleResult, LifecycleError> {
        let reservation = self.commit(subscriber_id, &ACTIVATE, |_| {}).await?.reservation;

        let outcome = match (send_session_update, session) {
            (false, _) => SessionOutcome::NotRequested,
            (true, None) => SessionOutcome::Skipped {
                reason: "no session context".to_string(),
            },
            (true, Some(ctx)) => {
                let attributes = Self::coa_attributes(reservation.address.as_deref(), ctx);
                self.session.coa(&ctx.session_ref, &attributes).await
            }
        };

        Ok(self
            .finish(reservation, outcome, true, LifecycleError::Activation)
            .await)
    }

    async fn suspend_inner(
        &self,
        subscriber_id: &str,
        session: Option<&SessionContext>,
        reason: Option<&str>,
    ) -> Result<LifecycleResult, LifecycleError> {
        let committed = self
            .commit(subscriber_id, &SUSPEND, |r| {
                if let Some(reason) = reason {
                    r.metadata
                        .insert(meta::SUSPEND_REASON.to_string(), Value::from(reason));
                }
            })
            .await?;

        if !committed.changed {
            tracing::debug!("Already suspended");
            return Ok(LifecycleResult::completed(
                committed.reservation,
                SessionOutcome::NotRequested,
            ));
        }

        let outcome = match session {
            Some(ctx) => self.session.coa(&ctx.session_ref, &ctx.attributes).await,
            None => SessionOutcome::NotRequested,
        };

        Ok(self
            .finish(committed.reservation, outcome, true, LifecycleError::Suspension)
            .await)
    }

    async fn reactivate_inner(
        &self,
        subscriber_id: &str,
        session: Option<&SessionContext>,
    ) -> Result<LifecycleResult, LifecycleError> {
        let reservation = self
            .commit(subscriber_id, &REACTIVATE, |r| {
                r.metadata.remove(meta::SUSPEND_REASON);
            })
            .await?
            .reservation;

        let outcome = match session {
            Some(ctx) => {
                let attributes = Self::coa_attributes(reservation.address.as_deref(), ctx);
                self.session.coa(&ctx.session_ref, &attributes).await
            }
            None => SessionOutcome::NotRequested,
        };

        Ok(self
            .finish(reservation, outcome, true, LifecycleError::Suspension)
            .await)
    }

    async fn revoke_inner(
        &self,
        subscriber_id: &str,
        session: Option<&SessionContext>,
        release_to_pool: bool,
    ) -> Result<LifecycleResult, LifecycleError> {
        let current = self
            .load(&self.key(subscriber_id))
            .await?
            .ok_or_else(|| Self::not_found(subscriber_id))?;

        if current.lifecycle_state == LifecycleState::Revoked {
            tracing::debug!("Already revoked");
            return Ok(LifecycleResult::completed(current, SessionOutcome::NotRequested));
        }

        let mut reservation = self
            .commit(subscriber_id, &BEGIN_REVOKE, |r| {
                if !r.metadata.contains_key(meta::RELEASE_TO_POOL) {
                    r.metadata
                        .insert(meta::RELEASE_TO_POOL.to_string(), Value::Bool(release_to_pool));
                }
            })
            .await?
            .reservation;

        let outcome = match session {
            Some(ctx) => self.session.disconnect(&ctx.session_ref).await,
            None => SessionOutcome::NotRequested,
        };
        if outcome != SessionOutcome::NotRequested {
            self.persist_metadata(&mut reservation, session_metadata(&outcome))
                .await;
        }

        let release = reservation
            .metadata
            .get(meta::RELEASE_TO_POOL)
            .and_then(Value::as_bool)
            .unwrap_or(release_to_pool);
        let already_released = reservation.metadata_str(meta::POOL_RELEASE) == Some("released");

        let pool_release = match reservation.address.clone() {
            Some(address) if release && !reservation.is_static() && !already_released => {
                if let Err(e) = self.release(&address).await {
                    self.persist_metadata(
                        &mut reservation,
                        vec![(meta::POOL_RELEASE, Value::from("failed"))],
                    )
                    .await;
                    tracing::warn!(address = %address, error = %e, "Release failed, reservation left REVOKING");
                    return Err(LifecycleError::Revocation(format!(
                        "release of {address} failed: {e}"
                    )));
                }
                self.persist_metadata(
                    &mut reservation,
                    vec![(meta::POOL_RELEASE, Value::from("released"))],
                )
                .await;
                "released"
            }
            _ if already_released => "released",
            _ => "skipped",
        };

        let reservation = self
            .commit(subscriber_id, &FINISH_REVOKE, |r| {
                r.metadata
                    .insert(meta::POOL_RELEASE.to_string(), Value::from(pool_release));
            })
            .await?
            .reservation;

        Ok(self
            .finish(reservation, outcome, false, LifecycleError::Revocation)
            .await)
    }

    fn span(operation: &'static str, subscriber_id: &str) -> tracing::Span {
        tracing::info_span!(
            "lifecycle",
            operation,
            subscriber_id,
            protocol = F::PROTOCOL.as_str()
        )
    }

    fn observe<T>(operation: &'static str, result: Result<T, LifecycleError>) -> Result<T, LifecycleError> {
        if let Err(e) = &result {
            LifecycleMetrics::record_error(F::PROTOCOL, operation, e.kind());
            tracing::warn!(error = %e, "Lifecycle operation failed");
        }
        result
    }
}

impl<F: AddressFamily> AddressLifecycleService for AddressLifecycleManager<F> {
    fn protocol(&self) -> Protocol {
        F::PROTOCOL
    }

    fn allocate<'a>(
        &'a self,
        request: &'a AllocateRequest,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>> {
        let span = Self::span("allocate", &request.subscriber_id);
        Box::pin(
            async move {
                let result = self
                    .retry_on_conflict(&request.subscriber_id, || self.allocate_once(request))
                    .await;
                Self::observe("allocate", result)
            }
            .instrument(span),
        )
    }

    fn activate<'a>(
        &'a self,
        subscriber_id: &'a str,
        session: Option<&'a SessionContext>,
        send_session_update: bool,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>> {
        Box::pin(
            async move {
                let result = self
                    .activate_inner(subscriber_id, session, send_session_update)
                    .await;
                Self::observe("activate", result)
            }
            .instrument(Self::span("activate", subscriber_id)),
        )
    }

    fn suspend<'a>(
        &'a self,
        subscriber_id: &'a str,
        session: Option<&'a SessionContext>,
        reason: Option<&'a str>,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>> {
        Box::pin(
            async move {
                let result = self.suspend_inner(subscriber_id, session, reason).await;
                Self::observe("suspend", result)
            }
            .instrument(Self::span("suspend", subscriber_id)),
        )
    }

    fn reactivate<'a>(
        &'a self,
        subscriber_id: &'a str,
        session: Option<&'a SessionContext>,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>> {
        Box::pin(
            async move {
                let result = self.reactivate_inner(subscriber_id, session).await;
                Self::observe("reactivate", result)
            }
            .instrument(Self::span("reactivate", subscriber_id)),
        )
    }

    fn revoke<'a>(
        &'a self,
        subscriber_id: &'a str,
        session: Option<&'a SessionContext>,
        release_to_pool: bool,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>> {
        Box::pin(
            async move {
                let result = self
                    .revoke_inner(subscriber_id, session, release_to_pool)
                    .await;
                Self::observe("revoke", result)
            }
            .instrument(Self::span("revoke", subscriber_id)),
        )
    }

    fn get_state<'a>(
        &'a self,
        subscriber_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<AddressReservation>, LifecycleError>> {
        Box::pin(async move {
            let result = self
                .load(&self.key(subscriber_id))
                .await
                .map_err(LifecycleError::from);
            Self::observe("get_state", result)
        })
    }

    fn recover<'a>(
        &'a self,
        subscriber_id: &'a str,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>> {
        Box::pin(
            async move {
                let result = self
                    .commit(subscriber_id, &RECOVER, |r| {
                        r.metadata.remove(meta::FAILURE_REASON);
                    })
                    .await
                    .map(|c| LifecycleResult::completed(c.reservation, SessionOutcome::NotRequested));
                Self::observe("recover", result)
            }
            .instrument(Self::span("recover", subscriber_id)),
        )
    }

    fn mark_failed<'a>(
        &'a self,
        subscriber_id: &'a str,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<LifecycleResult, LifecycleError>> {
        Box::pin(
            async move {
                let result = self
                    .commit(subscriber_id, &MARK_FAILED, |r| {
                        r.metadata
                            .insert(meta::FAILURE_REASON.to_string(), Value::from(reason));
                    })
                    .await
                    .map(|c| LifecycleResult::completed(c.reservation, SessionOutcome::NotRequested));
                Self::observe("mark_failed", result)
            }
            .instrument(Self::span("mark_failed", subscriber_id)),
        )
    }
}

/// Pool-assigned address a row still holds, if it was never handed back.
fn held_pool_address(reservation: &AddressReservation) -> Option<String> {
    let released = reservation.metadata_str(meta::POOL_RELEASE) == Some("released");
    reservation
        .address
        .clone()
        .filter(|_| !reservation.is_static() && !released)
}

/// Metadata entries describing a session outcome.
fn session_metadata(outcome: &SessionOutcome) -> Vec<(&'static str, Value)> {
    let mut updates = vec![(meta::SESSION_UPDATE, Value::from(outcome.status_str()))];
    match outcome {
        SessionOutcome::Acked { code: Some(code) } | SessionOutcome::Nacked { code: Some(code) } => {
            updates.push((meta::SESSION_ACK_CODE, Value::from(code.as_str())));
        }
        SessionOutcome::Failed { reason } | SessionOutcome::Skipped { reason } => {
            updates.push((meta::SESSION_ERROR, Value::from(reason.as_str())));
        }
        _ => {}
    }
    updates
}

/// Error text for a failed session sub-operation.
fn session_failure(outcome: &SessionOutcome) -> Option<String> {
    match outcome {
        SessionOutcome::Nacked { code: Some(code) } => {
            Some(format!("session controller refused the request (code {code})"))
        }
        SessionOutcome::Nacked { code: None } => {
            Some("session controller refused the request".to_string())
        }
        SessionOutcome::Failed { reason } => Some(format!("session update failed: {reason}")),
        _ => None,
    }
}
