//! Circuit breaker for calls to external systems.
//!
//! Session-control calls go through a breaker so a dead AAA server costs one
//! timeout per probe instead of one per lifecycle operation.
//!
//! # Phases
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected without reaching the backend until
//!   `open_for` has elapsed since the last failure.
//! - **HalfOpen**: probes pass through; `success_threshold` successes close
//!   the breaker, a single failure re-opens it.
//!
//! # Example
//!
//! ```rust
//! use netprov_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(5)
//!     .open_for(Duration::from_secs(30))
//!     .success_threshold(2)
//!     .build();
//!
//! let breaker = CircuitBreaker::new("aaa", config);
//! let answer = breaker.call(|| async { Ok::<_, String>("ack") }).await;
//! assert_eq!(answer, Ok("ack"));
//! # }
//! ```

use crate::HealthCheck;
use crate::metrics::BreakerMetrics;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: usize,
    /// How long an open breaker rejects calls before probing
    pub open_for: Duration,
    /// Successful probes needed to close a half-open breaker
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CircuitBreakerConfig {
    /// Start a builder with every threshold at its default.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            open_for: None,
            success_threshold: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    open_for: Option<Duration>,
    success_threshold: Option<usize>,
}

impl CircuitBreakerConfigBuilder {
    /// Open after this many consecutive failures (minimum 1, default 5).
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Stay open this long before probing (default 30 s).
    #[must_use]
    pub const fn open_for(mut self, duration: Duration) -> Self {
        self.open_for = Some(duration);
        self
    }

    /// Close after this many successful probes (minimum 1, default 2).
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Finish the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(5).max(1),
            open_for: self.open_for.unwrap_or(Duration::from_secs(30)),
            success_threshold: self.success_threshold.unwrap_or(2).max(1),
        }
    }
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Calls pass through
    Closed,
    /// Calls are rejected
    Open,
    /// Probing whether the backend recovered
    HalfOpen,
}

impl State {
    /// Gauge value: 0 = closed, 1 = half-open, 2 = open.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }

    /// Lowercase label for logs and health metadata.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Result of a guarded call.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CircuitBreakerError<E> {
    /// The breaker rejected the call without running it
    #[error("circuit breaker is open")]
    Open,
    /// The call ran and failed
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { failures: usize },
    Open { since: Instant },
    HalfOpen { successes: usize },
}

impl Phase {
    const fn state(self) -> State {
        match self {
            Self::Closed { .. } => State::Closed,
            Self::Open { .. } => State::Open,
            Self::HalfOpen { .. } => State::HalfOpen,
        }
    }
}

/// Consecutive-failure circuit breaker.
///
/// Cloning shares the underlying phase.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    phase: Arc<Mutex<Phase>>,
}

impl CircuitBreaker {
    /// Create a closed breaker. `name` labels its metrics and health check.
    #[must_use]
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        BreakerMetrics::record_state(name, State::Closed);
        Self {
            name,
            config,
            phase: Arc::new(Mutex::new(Phase::Closed { failures: 0 })),
        }
    }

    /// Name used in metrics and logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Current state. An open breaker whose wait has elapsed still reports
    /// `Open` until the next call probes it.
    #[must_use]
    pub fn state(&self) -> State {
        self.phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    /// Run `operation` unless the breaker is open.
    ///
    /// # Errors
    ///
    /// [`CircuitBreakerError::Open`] when the call was rejected,
    /// [`CircuitBreakerError::Inner`] when it ran and failed.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            BreakerMetrics::record_rejection(self.name);
            tracing::debug!(breaker = self.name, "Circuit open, call rejected");
            return Err(CircuitBreakerError::Open);
        }

        let result = operation().await;
        self.record(result.is_ok());
        result.map_err(CircuitBreakerError::Inner)
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        self.transition(Phase::Closed { failures: 0 });
        tracing::info!(breaker = self.name, "Circuit breaker reset");
    }

    /// Degraded while the breaker is not closed.
    #[must_use]
    pub fn health_check(&self) -> HealthCheck {
        match self.state() {
            State::Closed => HealthCheck::healthy(self.name),
            state => HealthCheck::degraded(self.name, format!("circuit breaker {}", state.as_str()))
                .with_metadata("state", state.as_str()),
        }
    }

    fn admit(&self) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        let current = *phase;
        match current {
            Phase::Closed { .. } | Phase::HalfOpen { .. } => true,
            Phase::Open { since } if since.elapsed() >= self.config.open_for => {
                *phase = Phase::HalfOpen { successes: 0 };
                drop(phase);
                BreakerMetrics::record_state(self.name, State::HalfOpen);
                tracing::info!(breaker = self.name, "Circuit half-open, probing");
                true
            }
            Phase::Open { .. } => false,
        }
    }

    fn record(&self, succeeded: bool) {
        let current = *self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        let next = match (current, succeeded) {
            (Phase::Closed { .. }, true) => Phase::Closed { failures: 0 },
            (Phase::Closed { failures }, false) if failures + 1 >= self.config.failure_threshold => {
                tracing::warn!(
                    breaker = self.name,
                    failures = failures + 1,
                    "Circuit opened"
                );
                Phase::Open { since: Instant::now() }
            }
            (Phase::Closed { failures }, false) => Phase::Closed { failures: failures + 1 },
            (Phase::HalfOpen { successes }, true) if successes + 1 >= self.config.success_threshold => {
                tracing::info!(breaker = self.name, "Circuit closed after recovery");
                Phase::Closed { failures: 0 }
            }
            (Phase::HalfOpen { successes }, true) => Phase::HalfOpen { successes: successes + 1 },
            (Phase::HalfOpen { .. }, false) => {
                tracing::warn!(breaker = self.name, "Probe failed, circuit re-opened");
                Phase::Open { since: Instant::now() }
            }
            // A call admitted before another task opened the breaker.
            (Phase::Open { since }, _) => Phase::Open { since },
        };
        self.transition(next);
    }

    fn transition(&self, next: Phase) {
        let previous = {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *phase, next).state()
        };
        if previous != next.state() {
            BreakerMetrics::record_state(self.name, next.state());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: usize, open_ms: u64, successes: usize) -> CircuitBreaker {
        CircuitBreaker::new(
            "aaa",
            CircuitBreakerConfig::builder()
                .failure_threshold(failures)
                .open_for(Duration::from_millis(open_ms))
                .success_threshold(successes)
                .build(),
        )
    }

    async fn fail(breaker: &CircuitBreaker, times: usize) {
        for _ in 0..times {
            let _ = breaker.call(|| async { Err::<(), _>("timeout") }).await;
        }
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_failures() {
        let breaker = breaker(2, 60_000, 1);
        fail(&breaker, 1).await;
        assert_eq!(breaker.state(), State::Closed);
        fail(&breaker, 1).await;
        assert_eq!(breaker.state(), State::Open);

        let mut ran = false;
        let result = breaker
            .call(|| {
                ran = true;
                async { Ok::<_, String>(()) }
            })
            .await;
        assert_eq!(result, Err(CircuitBreakerError::Open));
        assert!(!ran);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = breaker(2, 60_000, 1);
        fail(&breaker, 1).await;
        let _ = breaker.call(|| async { Ok::<_, String>(()) }).await;
        fail(&breaker, 1).await;
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_half_open_needs_success_threshold() {
        let breaker = breaker(1, 20, 2);
        fail(&breaker, 1).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let _ = breaker.call(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(breaker.state(), State::HalfOpen);
        let _ = breaker.call(|| async { Ok::<_, String>(()) }).await;
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let breaker = breaker(1, 20, 2);
        fail(&breaker, 1).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        fail(&breaker, 1).await;
        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test]
    async fn test_reset_and_health() {
        let breaker = breaker(1, 60_000, 1);
        assert_eq!(breaker.health_check().status, crate::HealthStatus::Healthy);

        fail(&breaker, 1).await;
        let check = breaker.health_check();
        assert_eq!(check.status, crate::HealthStatus::Degraded);
        assert!(check.metadata.iter().any(|(k, v)| k == "state" && v == "open"));

        breaker.reset();
        assert_eq!(breaker.state(), State::Closed);
    }

    #[test]
    fn test_builder_clamps_thresholds() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(0)
            .success_threshold(0)
            .build();
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.success_threshold, 1);
        assert_eq!(config.open_for, Duration::from_secs(30));
    }
}
