//! Prometheus metrics for observability and monitoring.
//!
//! Recorders are grouped per component:
//! - Workflow runs, step attempts and compensations
//! - Lifecycle transitions, errors and optimistic-concurrency conflicts
//! - Session-control requests and the breaker in front of them
//! - Reconciliation sweeps
//! - Dead-letter queues and retries
//!
//! # Example
//!
//! ```rust,no_run
//! use netprov_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::State;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use netprov_core::{LifecycleState, Protocol};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    fn builder(&self) -> Result<PrometheusBuilder, MetricsError> {
        PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), LATENCY_BUCKETS)
            .map_err(|e| MetricsError::Build(e.to_string()))
    }

    /// Install the recorder without an HTTP listener; metrics are read via [`render`](Self::render).
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. A recorder
    /// that is already installed (e.g. by another test) is tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        match self.builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Install the recorder and serve `/metrics` on the configured address.
    ///
    /// Must be called from within a Tokio runtime; the listener runs as a spawned task.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = self
            .builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        self.handle = Some(handle);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Workflows
    describe_counter!("netprov_workflow_runs_total", "Workflow executions by terminal status");
    describe_histogram!("netprov_workflow_duration_seconds", "Wall time of workflow executions");
    describe_counter!("netprov_workflow_step_attempts_total", "Step handler invocations");
    describe_counter!("netprov_workflow_step_failures_total", "Steps that failed after all retries");
    describe_histogram!("netprov_workflow_step_duration_seconds", "Wall time of a step including retries");
    describe_counter!("netprov_workflow_compensations_total", "Compensation outcomes");

    // Lifecycle
    describe_counter!("netprov_lifecycle_transitions_total", "Committed lifecycle transitions");
    describe_counter!("netprov_lifecycle_errors_total", "Failed lifecycle operations by error kind");
    describe_counter!("netprov_lifecycle_conflicts_total", "Optimistic concurrency conflicts");

    // Session control
    describe_counter!("netprov_session_requests_total", "Session-control requests by outcome");
    describe_gauge!(
        "netprov_circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!("netprov_circuit_breaker_rejections_total", "Calls rejected while open");

    // Reconciliation
    describe_counter!("netprov_reconciliation_sweeps_total", "Reconciliation sweeps run");
    describe_counter!("netprov_reconciliation_rows_total", "Stale rows handled by outcome");
    describe_counter!("netprov_reconciliation_purged_total", "REVOKED rows purged by retention");
    describe_histogram!("netprov_reconciliation_duration_seconds", "Wall time of a sweep");

    // DLQ / retry
    describe_gauge!("netprov_dlq_size", "Entries waiting in a dead-letter queue");
    describe_counter!("netprov_dlq_pushed_total", "Entries pushed onto a dead-letter queue");
    describe_counter!("netprov_dlq_dropped_total", "Entries dropped because a queue was full");
    describe_counter!("netprov_retry_attempts_total", "Attempts made under a retry policy");
    describe_counter!("netprov_retry_exhausted_total", "Operations that exhausted their retries");
}

/// Workflow metrics recorder.
pub struct WorkflowMetrics;

impl WorkflowMetrics {
    /// Record a finished workflow run.
    pub fn record_run(workflow: &str, status: &'static str, duration: Duration) {
        counter!("netprov_workflow_runs_total", "workflow" => workflow.to_string(), "status" => status)
            .increment(1);
        histogram!("netprov_workflow_duration_seconds", "workflow" => workflow.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a step after its last attempt.
    pub fn record_step(step: &str, attempts: u32, succeeded: bool, required: bool, duration: Duration) {
        counter!("netprov_workflow_step_attempts_total", "step" => step.to_string())
            .increment(u64::from(attempts));
        histogram!("netprov_workflow_step_duration_seconds", "step" => step.to_string())
            .record(duration.as_secs_f64());
        if !succeeded {
            let required = if required { "true" } else { "false" };
            counter!("netprov_workflow_step_failures_total", "step" => step.to_string(), "required" => required)
                .increment(1);
        }
    }

    /// Record a compensation outcome.
    pub fn record_compensation(step: &str, succeeded: bool) {
        let outcome = if succeeded { "compensated" } else { "failed" };
        counter!("netprov_workflow_compensations_total", "step" => step.to_string(), "outcome" => outcome)
            .increment(1);
    }
}

/// Lifecycle metrics recorder.
pub struct LifecycleMetrics;

impl LifecycleMetrics {
    /// Record a committed transition.
    pub fn record_transition(protocol: Protocol, from: LifecycleState, to: LifecycleState) {
        counter!(
            "netprov_lifecycle_transitions_total",
            "protocol" => protocol.as_str(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
    }

    /// Record a failed operation.
    pub fn record_error(protocol: Protocol, operation: &'static str, kind: &'static str) {
        counter!(
            "netprov_lifecycle_errors_total",
            "protocol" => protocol.as_str(),
            "operation" => operation,
            "kind" => kind
        )
        .increment(1);
    }

    /// Record a lost compare-and-swap.
    pub fn record_conflict(protocol: Protocol) {
        counter!("netprov_lifecycle_conflicts_total", "protocol" => protocol.as_str()).increment(1);
    }
}

/// Session-control metrics recorder.
pub struct SessionMetrics;

impl SessionMetrics {
    /// Record a CoA or disconnect outcome.
    pub fn record_request(operation: &'static str, outcome: &'static str) {
        counter!("netprov_session_requests_total", "operation" => operation, "outcome" => outcome)
            .increment(1);
    }
}

/// Circuit breaker metrics recorder.
pub struct BreakerMetrics;

impl BreakerMetrics {
    /// Record breaker state.
    pub fn record_state(breaker: &'static str, state: State) {
        gauge!("netprov_circuit_breaker_state", "breaker" => breaker).set(state.gauge_value());
    }

    /// Record a rejected call.
    pub fn record_rejection(breaker: &'static str) {
        counter!("netprov_circuit_breaker_rejections_total", "breaker" => breaker).increment(1);
    }
}

/// Reconciliation metrics recorder.
pub struct ReconciliationMetrics;

impl ReconciliationMetrics {
    /// Record a finished sweep.
    pub fn record_sweep(resolved: usize, flagged: usize, failed: usize, purged: u64, duration: Duration) {
        counter!("netprov_reconciliation_sweeps_total").increment(1);
        counter!("netprov_reconciliation_rows_total", "outcome" => "resolved").increment(resolved as u64);
        counter!("netprov_reconciliation_rows_total", "outcome" => "flagged").increment(flagged as u64);
        counter!("netprov_reconciliation_rows_total", "outcome" => "failed").increment(failed as u64);
        counter!("netprov_reconciliation_purged_total").increment(purged);
        histogram!("netprov_reconciliation_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Dead-letter queue metrics recorder.
pub struct DlqMetrics;

impl DlqMetrics {
    /// Record the current queue depth.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_size(queue: &'static str, size: usize) {
        gauge!("netprov_dlq_size", "queue" => queue).set(size as f64);
    }

    /// Record a push.
    pub fn record_push(queue: &'static str) {
        counter!("netprov_dlq_pushed_total", "queue" => queue).increment(1);
    }

    /// Record an entry dropped at capacity.
    pub fn record_drop(queue: &'static str) {
        counter!("netprov_dlq_dropped_total", "queue" => queue).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record an attempt.
    pub fn record_attempt() {
        counter!("netprov_retry_attempts_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("netprov_retry_exhausted_total").increment(1);
    }
}
