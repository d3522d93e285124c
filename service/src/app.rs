//! Component wiring.

use anyhow::Context;
use netprov_core::adapters::{ProfileStore, ReservationStore};
use netprov_core::environment::{Clock, SystemClock};
use netprov_postgres::{PostgresProfileStore, PostgresReservationStore};
use netprov_runtime::allocator::{LocalPoolAllocator, NoopSessionController};
use netprov_runtime::config::ProvisioningConfig;
use netprov_runtime::steps::{self, StepDeps};
use netprov_runtime::{
    HealthCheck, HealthReport, Ipv4LifecycleService, Ipv6LifecycleService, Reconciler,
    SessionGate, WorkflowCatalog, WorkflowEngine,
};
use std::sync::Arc;

const MAX_DB_CONNECTIONS: u32 = 10;

/// Everything the service runs.
pub struct App {
    /// Built-in workflows
    pub catalog: WorkflowCatalog,
    /// Background sweep
    pub reconciler: Reconciler,
    session: SessionGate,
    clock: Arc<dyn Clock>,
}

impl App {
    /// Connect to Postgres, migrate, and wire the components.
    ///
    /// # Errors
    ///
    /// Fails without a database URL, when the database is unreachable, or
    /// when the pools or workflows are misconfigured.
    pub async fn connect(config: &ProvisioningConfig) -> anyhow::Result<Self> {
        let database_url = config
            .database_url
            .as_deref()
            .context("database_url (or NETPROV_DATABASE_URL) must be set")?;

        let pool = netprov_postgres::connect(database_url, MAX_DB_CONNECTIONS)
            .await
            .context("connecting to Postgres")?;
        netprov_postgres::migrate(&pool).await.context("running migrations")?;

        Self::assemble(
            config,
            Arc::new(PostgresReservationStore::new(pool.clone())),
            Arc::new(PostgresProfileStore::new(pool)),
        )
    }

    /// Wire the components over the given stores.
    ///
    /// # Errors
    ///
    /// Fails when a pool or a built-in workflow is misconfigured.
    pub fn assemble(
        config: &ProvisioningConfig,
        store: Arc<dyn ReservationStore>,
        profiles: Arc<dyn ProfileStore>,
    ) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        // TODO: seed the allocator with live reservations so a restart does not
        // hand out addresses that are still held.
        let allocator = Arc::new(LocalPoolAllocator::new(&config.pools).context("invalid pool")?);
        let gate = SessionGate::new(Arc::new(NoopSessionController), &config.session);

        let ipv4 = Arc::new(Ipv4LifecycleService::new(
            &config.tenant_id,
            store.clone(),
            allocator.clone(),
            gate.clone(),
            clock.clone(),
            config.lifecycle.clone(),
        ));
        let ipv6 = Arc::new(Ipv6LifecycleService::new(
            &config.tenant_id,
            store.clone(),
            allocator,
            gate.clone(),
            clock.clone(),
            config.lifecycle.clone(),
        ));

        let deps = StepDeps {
            profiles,
            ipv4: ipv4.clone(),
            ipv6: ipv6.clone(),
        };
        let registry =
            steps::provisioning_registry(&deps, config).context("registering built-in steps")?;
        let engine = WorkflowEngine::from_config(&config.engine, clock.clone());
        let catalog = WorkflowCatalog::from_plans(&registry, engine, steps::builtin_workflows())
            .context("building built-in workflows")?;

        let reconciler = Reconciler::new(
            &config.tenant_id,
            store,
            clock.clone(),
            config.reconciliation.clone(),
        )
        .with_service(ipv4)
        .with_service(ipv6);

        Ok(Self {
            catalog,
            reconciler,
            session: gate,
            clock,
        })
    }

    /// Combined health of the sweep, both dead-letter queues and the
    /// session breaker.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let mut checks: Vec<HealthCheck> = self.reconciler.health_checks();
        checks.push(self.catalog.engine().dead_letters().health_check());
        checks.push(self.session.health_check());
        HealthReport::new(checks, self.clock.now())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use netprov_core::workflow::WorkflowContext;
    use netprov_runtime::HealthStatus;
    use netprov_runtime::config::PoolConfig;
    use netprov_runtime::engine::{COMPENSATION_QUEUE, FailedCompensation};
    use netprov_testing::InMemoryReservationStore;
    use netprov_testing::mocks::InMemoryProfileStore;
    use uuid::Uuid;

    fn config() -> ProvisioningConfig {
        let mut config = ProvisioningConfig::default();
        config.pools = vec![
            PoolConfig {
                id: "v4".into(),
                cidr: "100.64.0.0/24".into(),
                delegated_prefix_length: None,
            },
            PoolConfig {
                id: "v6-pd".into(),
                cidr: "2001:db8::/48".into(),
                delegated_prefix_length: Some(56),
            },
        ];
        config
    }

    fn assemble(config: &ProvisioningConfig) -> anyhow::Result<App> {
        App::assemble(
            config,
            Arc::new(InMemoryReservationStore::new()),
            Arc::new(InMemoryProfileStore::new()),
        )
    }

    #[test]
    fn test_assemble_registers_builtin_workflows() {
        let app = assemble(&config()).unwrap();
        assert_eq!(
            app.catalog.names(),
            [
                steps::DECOMMISSION_SUBSCRIBER,
                steps::PROVISION_SUBSCRIBER,
                steps::RESUME_SUBSCRIBER,
                steps::SUSPEND_SUBSCRIBER,
            ]
        );
        assert_eq!(app.health().status, HealthStatus::Healthy);
    }

    #[test]
    fn test_health_reports_compensation_dead_letters() {
        let mut config = config();
        config.engine.dead_letter_capacity = 2;
        let app = assemble(&config).unwrap();

        app.catalog.engine().dead_letters().push(
            FailedCompensation {
                execution_id: Uuid::new_v4(),
                workflow_name: steps::PROVISION_SUBSCRIBER.to_string(),
                step_name: "allocate_ipv4".to_string(),
                context: WorkflowContext::new(),
            },
            "release failed".to_string(),
            3,
        );

        let report = app.health();
        assert_eq!(report.status, HealthStatus::Degraded);
        let check = report
            .checks
            .iter()
            .find(|c| c.component == format!("dlq.{COMPENSATION_QUEUE}"))
            .unwrap();
        assert_eq!(check.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_assemble_rejects_bad_pool() {
        let mut config = config();
        config.pools[0].cidr = "not-a-network".into();
        assert!(assemble(&config).is_err());
    }

    #[tokio::test]
    async fn test_connect_requires_database_url() {
        let err = App::connect(&config()).await.err().unwrap();
        assert!(err.to_string().contains("database_url"));
    }
}
