//! Session-control gate.
//!
//! Wraps a [`SessionController`] with a per-call timeout and a circuit
//! breaker and folds every answer into a [`SessionOutcome`]. The gate never
//! returns an error: session control is advisory to the lifecycle service.

use crate::HealthCheck;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::SessionConfig;
use crate::metrics::SessionMetrics;
use futures::future::BoxFuture;
use netprov_core::adapters::{AckResult, SessionController};
use netprov_core::error::SessionError;
use netprov_core::reservation::SessionOutcome;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const BREAKER_NAME: &str = "session_controller";

/// Timeout + circuit breaker in front of the session controller.
#[derive(Clone)]
pub struct SessionGate {
    controller: Arc<dyn SessionController>,
    timeout: Duration,
    breaker: CircuitBreaker,
}

impl std::fmt::Debug for SessionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGate")
            .field("timeout", &self.timeout)
            .field("breaker", &self.breaker.name())
            .finish_non_exhaustive()
    }
}

impl SessionGate {
    /// Gate configured from [`SessionConfig`].
    #[must_use]
    pub fn new(controller: Arc<dyn SessionController>, config: &SessionConfig) -> Self {
        Self {
            controller,
            timeout: config.timeout(),
            breaker: CircuitBreaker::new(BREAKER_NAME, config.breaker()),
        }
    }

    /// The breaker, for operator resets.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Degraded while session calls are being skipped.
    #[must_use]
    pub fn health_check(&self) -> HealthCheck {
        self.breaker.health_check()
    }

    /// Send a change-of-authorisation.
    pub async fn coa(&self, session_ref: &str, attributes: &BTreeMap<String, String>) -> SessionOutcome {
        self.guarded("coa", session_ref, self.controller.send_coa(session_ref, attributes))
            .await
    }

    /// Send a disconnect.
    pub async fn disconnect(&self, session_ref: &str) -> SessionOutcome {
        self.guarded("disconnect", session_ref, self.controller.send_disconnect(session_ref))
            .await
    }

    async fn guarded(
        &self,
        operation: &'static str,
        session_ref: &str,
        call: BoxFuture<'_, Result<AckResult, SessionError>>,
    ) -> SessionOutcome {
        let timeout = self.timeout;
        let result = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(timeout, call).await {
                    Ok(answer) => answer,
                    Err(_) => Err(SessionError::Timeout(timeout)),
                }
            })
            .await;

        let outcome = match result {
            Ok(AckResult::Ack { code }) => SessionOutcome::Acked { code },
            Ok(AckResult::Nack { code, reason }) => {
                tracing::warn!(
                    operation,
                    session_ref,
                    code = code.as_deref().unwrap_or(""),
                    reason = reason.as_deref().unwrap_or(""),
                    "Session controller refused request"
                );
                SessionOutcome::Nacked { code }
            }
            Err(CircuitBreakerError::Inner(err)) => {
                tracing::warn!(operation, session_ref, error = %err, "Session request failed");
                SessionOutcome::Failed {
                    reason: err.to_string(),
                }
            }
            Err(CircuitBreakerError::Open) => SessionOutcome::Skipped {
                reason: SessionError::CircuitOpen.to_string(),
            },
        };

        SessionMetrics::record_request(operation, outcome.status_str());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netprov_testing::mocks::{MockSessionController, SessionScript};

    fn config(failure_threshold: usize) -> SessionConfig {
        SessionConfig {
            timeout_secs: 1,
            failure_threshold,
            open_secs: 60,
            success_threshold: 1,
        }
    }

    #[tokio::test]
    async fn test_ack_and_nack_map_to_outcomes() {
        let controller = Arc::new(MockSessionController::new());
        let gate = SessionGate::new(controller.clone(), &config(3));

        assert_eq!(
            gate.disconnect("s1").await,
            SessionOutcome::Acked { code: None }
        );

        controller.script(SessionScript::Nack("rejected".into()));
        let outcome = gate.coa("s1", &BTreeMap::new()).await;
        assert!(matches!(outcome, SessionOutcome::Nacked { .. }));
        assert_eq!(outcome.status_str(), "failed");
    }

    #[tokio::test]
    async fn test_open_breaker_skips_calls() {
        let controller = Arc::new(MockSessionController::new());
        controller.script(SessionScript::Error("connection refused".into()));
        let gate = SessionGate::new(controller.clone(), &config(2));

        for _ in 0..2 {
            assert!(matches!(gate.disconnect("s1").await, SessionOutcome::Failed { .. }));
        }

        let outcome = gate.disconnect("s1").await;
        assert!(matches!(outcome, SessionOutcome::Skipped { .. }));
        assert_eq!(outcome.status_str(), "skipped");
        assert_eq!(controller.disconnect_count(), 2);
        assert_eq!(gate.health_check().status, crate::HealthStatus::Degraded);

        gate.breaker().reset();
        assert_eq!(gate.health_check().status, crate::HealthStatus::Healthy);
    }
}
