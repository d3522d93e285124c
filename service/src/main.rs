//! Subscriber network provisioning service.
//!
//! Loads [`ProvisioningConfig`] from `NETPROV_CONFIG` plus environment
//! overrides, connects to Postgres, registers the built-in workflows and runs
//! the reconciliation sweep until Ctrl+C.
//!
//! Run with: `NETPROV_DATABASE_URL=postgres://... cargo run --bin netprov`
//! Metrics: set `NETPROV_METRICS_ADDR=0.0.0.0:9090`, then `/metrics`.

mod app;

use anyhow::Context;
use app::App;
use netprov_runtime::config::ProvisioningConfig;
use netprov_runtime::metrics::MetricsServer;
use tokio::sync::watch;
use tracing::{info, warn};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ProvisioningConfig::from_env().context("loading configuration")?;
    info!(
        tenant_id = %config.tenant_id,
        pools = config.pools.len(),
        circuit_policy = ?config.circuit.policy,
        "Starting netprov"
    );

    let mut metrics = config
        .metrics_socket_addr()?
        .map(MetricsServer::new);
    if let Some(server) = metrics.as_mut() {
        server.serve().context("starting metrics exporter")?;
    }

    let app = App::connect(&config).await?;
    info!(workflows = ?app.catalog.names(), "Workflows registered");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = tokio::spawn(app.reconciler.clone().run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown_tx.send_replace(true);
    if let Err(e) = sweep.await {
        warn!(error = %e, "Reconciliation task ended abnormally");
    }

    let health = app.health();
    for check in &health.checks {
        info!(
            component = %check.component,
            status = %check.status,
            message = check.message.as_deref().unwrap_or(""),
            "Final health"
        );
    }
    info!(status = %health.status, "netprov stopped");
    Ok(())
}
