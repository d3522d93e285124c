//! Both lifecycle services, the step catalog and the sweep wired to mocks.

use crate::mocks::{InMemoryProfileStore, MockAllocator, MockSessionController};
use crate::store::InMemoryReservationStore;
use crate::{ManualClock, manual_clock};
use netprov_core::environment::Clock;
use netprov_core::family::Protocol;
use netprov_core::reservation::{AddressReservation, ReservationKey};
use netprov_core::workflow::WorkflowError;
use netprov_runtime::config::ProvisioningConfig;
use netprov_runtime::steps::{self, StepDeps};
use netprov_runtime::{
    Ipv4LifecycleService, Ipv6LifecycleService, Reconciler, SessionGate, WorkflowCatalog,
    WorkflowEngine,
};
use std::sync::Arc;

/// Test fixture: mocks plus the services built on them.
///
/// ## Example
///
/// ```ignore
/// let harness = LifecycleHarness::builder()
///     .ipv4_allocator(MockAllocator::exhausted())
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct LifecycleHarness {
    /// Reservation table
    pub store: InMemoryReservationStore,
    /// Allocator behind the IPv4 service
    pub ipv4_allocator: MockAllocator,
    /// Allocator behind the IPv6 service
    pub ipv6_allocator: MockAllocator,
    /// Session controller shared by both services
    pub session: MockSessionController,
    /// Profile store used by the built-in steps
    pub profiles: InMemoryProfileStore,
    /// Clock shared by every component
    pub clock: ManualClock,
    /// Configuration the services were built from
    pub config: ProvisioningConfig,
    /// IPv4 lifecycle service
    pub ipv4: Arc<Ipv4LifecycleService>,
    /// IPv6 lifecycle service
    pub ipv6: Arc<Ipv6LifecycleService>,
}

impl Default for LifecycleHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleHarness {
    /// Harness with 16 addresses per family and an acking session controller.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Customise the mocks before building.
    #[must_use]
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Reservation key in the harness tenant.
    #[must_use]
    pub fn key(&self, subscriber_id: &str, protocol: Protocol) -> ReservationKey {
        ReservationKey::new(&self.config.tenant_id, subscriber_id, protocol)
    }

    /// Stored row, read directly from the store.
    #[must_use]
    pub fn reservation(&self, subscriber_id: &str, protocol: Protocol) -> Option<AddressReservation> {
        self.store.get(&self.key(subscriber_id, protocol))
    }

    /// Dependencies for the built-in steps.
    #[must_use]
    pub fn step_deps(&self) -> StepDeps {
        StepDeps {
            profiles: Arc::new(self.profiles.clone()),
            ipv4: self.ipv4.clone(),
            ipv6: self.ipv6.clone(),
        }
    }

    /// Catalog with the built-in workflows.
    ///
    /// # Errors
    ///
    /// Returns a [`WorkflowError`] if a built-in plan does not resolve.
    pub fn catalog(&self) -> Result<WorkflowCatalog, WorkflowError> {
        let registry = steps::provisioning_registry(&self.step_deps(), &self.config)?;
        let engine = WorkflowEngine::from_config(&self.config.engine, self.shared_clock());
        WorkflowCatalog::from_plans(&registry, engine, steps::builtin_workflows())
    }

    /// Reconciliation sweep over both services.
    #[must_use]
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            &self.config.tenant_id,
            Arc::new(self.store.clone()),
            self.shared_clock(),
            self.config.reconciliation.clone(),
        )
        .with_service(self.ipv4.clone())
        .with_service(self.ipv6.clone())
    }

    fn shared_clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }
}

/// Builder for [`LifecycleHarness`].
#[derive(Debug)]
pub struct HarnessBuilder {
    ipv4_allocator: MockAllocator,
    ipv6_allocator: MockAllocator,
    session: MockSessionController,
    config: ProvisioningConfig,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        let mut config = ProvisioningConfig {
            tenant_id: "tenant-test".to_string(),
            ..ProvisioningConfig::default()
        };
        config.engine.max_retries = 1;
        config.engine.initial_backoff_ms = 1;
        config.engine.max_backoff_ms = 5;
        config.engine.step_timeout_secs = 2;
        config.session.timeout_secs = 1;
        config.lifecycle.store_timeout_secs = 2;
        config.lifecycle.allocator_timeout_secs = 2;

        Self {
            ipv4_allocator: MockAllocator::ipv4(16),
            ipv6_allocator: MockAllocator::ipv6(16),
            session: MockSessionController::new(),
            config,
        }
    }
}

impl HarnessBuilder {
    /// Replace the IPv4 allocator.
    #[must_use]
    pub fn ipv4_allocator(mut self, allocator: MockAllocator) -> Self {
        self.ipv4_allocator = allocator;
        self
    }

    /// Replace the IPv6 allocator.
    #[must_use]
    pub fn ipv6_allocator(mut self, allocator: MockAllocator) -> Self {
        self.ipv6_allocator = allocator;
        self
    }

    /// Replace the session controller.
    #[must_use]
    pub fn session(mut self, session: MockSessionController) -> Self {
        self.session = session;
        self
    }

    /// Adjust the configuration.
    #[must_use]
    pub fn configure(mut self, f: impl FnOnce(&mut ProvisioningConfig)) -> Self {
        f(&mut self.config);
        self
    }

    /// Wire everything together.
    #[must_use]
    pub fn build(self) -> LifecycleHarness {
        let store = InMemoryReservationStore::new();
        let clock = manual_clock();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let gate = SessionGate::new(Arc::new(self.session.clone()), &self.config.session);

        let ipv4 = Arc::new(Ipv4LifecycleService::new(
            &self.config.tenant_id,
            Arc::new(store.clone()),
            Arc::new(self.ipv4_allocator.clone()),
            gate.clone(),
            shared_clock.clone(),
            self.config.lifecycle.clone(),
        ));
        let ipv6 = Arc::new(Ipv6LifecycleService::new(
            &self.config.tenant_id,
            Arc::new(store.clone()),
            Arc::new(self.ipv6_allocator.clone()),
            gate,
            shared_clock,
            self.config.lifecycle.clone(),
        ));

        LifecycleHarness {
            store,
            ipv4_allocator: self.ipv4_allocator,
            ipv6_allocator: self.ipv6_allocator,
            session: self.session,
            profiles: InMemoryProfileStore::new(),
            clock,
            config: self.config,
            ipv4,
            ipv6,
        }
    }
}
