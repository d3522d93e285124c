//! # Netprov Runtime
//!
//! Execution side of subscriber network provisioning.
//!
//! ## Core Components
//!
//! - **`WorkflowEngine`**: runs ordered steps with retry, timeout and
//!   reverse-order compensation
//! - **`StepRegistry`** / **`WorkflowCatalog`**: explicit, startup-built maps of
//!   step handlers and named workflows
//! - **`AddressLifecycleManager<F>`**: the address state machine for one
//!   protocol family, over a reservation store, an allocator and a session gate
//! - **`Reconciler`**: background sweep for reservations stuck mid-transition
//!
//! ## Example
//!
//! ```ignore
//! use netprov_runtime::{catalog::WorkflowCatalog, steps};
//!
//! let registry = steps::provisioning_registry(&deps, &config)?;
//! let catalog = WorkflowCatalog::from_plans(&registry, engine, steps::builtin_workflows())?;
//!
//! let execution = catalog.execute_workflow("provision_subscriber", input).await?;
//! assert!(execution.status.is_terminal());
//! ```

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Local pool allocator and no-op session controller
pub mod allocator;

/// Named workflow definitions and `execute_workflow`
pub mod catalog;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Configuration loading and validation
pub mod config;

/// Saga execution engine
pub mod engine;

/// Address lifecycle service and its generic implementation
pub mod lifecycle;

/// Prometheus metrics for observability
pub mod metrics;

/// Background reconciliation sweep
pub mod reconciliation;

/// Step registry
pub mod registry;

/// Retry logic with exponential backoff
pub mod retry;

/// Session-control gate (timeout + circuit breaker)
pub mod session;

/// Built-in provisioning steps and workflows
pub mod steps;

pub use catalog::WorkflowCatalog;
pub use engine::WorkflowEngine;
pub use lifecycle::{
    AddressLifecycleManager, AddressLifecycleService, AllocateRequest, Ipv4LifecycleService,
    Ipv6LifecycleService,
};
pub use reconciliation::{Reconciler, SweepReport};
pub use registry::StepRegistry;
pub use retry::RetryPolicy;
pub use session::SessionGate;

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is operational but experiencing issues (e.g., high DLQ size)
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is degraded
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health check result for a component
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    pub message: Option<String>,

    /// Optional metadata (e.g., queue depth, last sweep counts)
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Create a degraded check result
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push((key.into(), value.into()));
        self
    }
}

/// Aggregated health report
///
/// Combines multiple health checks into an overall system status.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall system status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// Timestamp when report was generated
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Create a new health report from checks
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>, timestamp: DateTime<Utc>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp,
        }
    }

    /// Check if overall system is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Check if overall system is degraded
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.status.is_degraded()
    }

    /// Check if overall system is unhealthy
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.status.is_unhealthy()
    }
}

/// Dead letter queue entry
#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    /// The failed operation payload
    pub payload: T,

    /// Number of attempts made before giving up
    pub attempts: u32,

    /// The error message from the last failure
    pub error_message: String,

    /// When the entry was queued
    pub failed_at: DateTime<Utc>,
}

/// Dead Letter Queue for operations that exhausted their retries.
///
/// Holds compensations the engine could not complete and rows the
/// reconciliation sweep could not resolve, for operator inspection.
///
/// - Bounded, oldest entries dropped when full
/// - Thread-safe; clones share the same queue
/// - Depth exported as `netprov_dlq_size{queue=<name>}`
#[derive(Debug)]
pub struct DeadLetterQueue<T> {
    name: &'static str,
    queue: Arc<Mutex<VecDeque<DeadLetter<T>>>>,
    max_size: usize,
}

impl<T> DeadLetterQueue<T> {
    /// Create an empty queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(name: &'static str, max_size: usize) -> Self {
        Self {
            name,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size: max_size.max(1),
        }
    }

    /// Queue name used in metrics and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Push a failed operation onto the queue
    ///
    /// If the queue is full, the oldest entry is dropped.
    pub fn push(&self, payload: T, error_message: String, attempts: u32) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() >= self.max_size {
            queue.pop_front();
            crate::metrics::DlqMetrics::record_drop(self.name);
            tracing::warn!(
                queue = self.name,
                max_size = self.max_size,
                "DLQ at capacity, dropping oldest entry"
            );
        }

        queue.push_back(DeadLetter {
            payload,
            attempts,
            error_message,
            failed_at: Utc::now(),
        });

        crate::metrics::DlqMetrics::record_size(self.name, queue.len());
        crate::metrics::DlqMetrics::record_push(self.name);

        tracing::warn!(
            queue = self.name,
            attempts,
            queue_size = queue.len(),
            "Operation added to dead letter queue"
        );
    }

    /// Get the current queue size
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain all entries from the queue
    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();

        crate::metrics::DlqMetrics::record_size(self.name, 0);
        tracing::info!(queue = self.name, count = entries.len(), "Drained dead letter queue");

        entries
    }

    /// Peek at the oldest entry without removing it
    #[must_use]
    pub fn peek(&self) -> Option<DeadLetter<T>>
    where
        T: Clone,
    {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .front()
            .cloned()
    }

    /// Get the maximum queue size
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Health of the queue: degraded once it is at least half full.
    #[must_use]
    pub fn health_check(&self) -> HealthCheck {
        let len = self.len();
        let check = if len * 2 >= self.max_size {
            HealthCheck::degraded(
                format!("dlq.{}", self.name),
                format!("{len} of {} entries used", self.max_size),
            )
        } else {
            HealthCheck::healthy(format!("dlq.{}", self.name))
        };
        check.with_metadata("size", len.to_string())
    }
}

impl<T> Clone for DeadLetterQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            queue: Arc::clone(&self.queue),
            max_size: self.max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_worst() {
        assert_eq!(
            HealthStatus::Healthy.worst(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Unhealthy.worst(HealthStatus::Degraded),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_health_report_takes_worst_check() {
        let report = HealthReport::new(
            vec![
                HealthCheck::healthy("store"),
                HealthCheck::degraded("dlq.compensation", "filling up"),
            ],
            Utc::now(),
        );
        assert!(report.is_degraded());
    }

    #[test]
    fn test_dlq_drops_oldest_at_capacity() {
        let dlq = DeadLetterQueue::new("test", 2);
        dlq.push("a", "err".to_string(), 1);
        dlq.push("b", "err".to_string(), 1);
        dlq.push("c", "err".to_string(), 3);

        assert_eq!(dlq.len(), 2);
        assert_eq!(dlq.peek().map(|d| d.payload), Some("b"));

        let drained = dlq.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].attempts, 3);
        assert!(dlq.is_empty());
    }

    #[test]
    fn test_dlq_clones_share_queue() {
        let dlq = DeadLetterQueue::new("test", 10);
        let other = dlq.clone();
        other.push(1_u32, "boom".to_string(), 2);
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn test_dlq_health_degrades_when_half_full() {
        let dlq = DeadLetterQueue::new("test", 4);
        assert!(dlq.health_check().status.is_healthy());
        dlq.push((), "x".to_string(), 1);
        dlq.push((), "x".to_string(), 1);
        assert!(dlq.health_check().status.is_degraded());
    }
}
