//! Saga execution engine.
//!
//! Runs a [`WorkflowDefinition`]'s steps in order against one shared context.
//! Each handler attempt runs under the step timeout and failed attempts are
//! retried with jittered exponential backoff. When a required step gives up,
//! that step and every earlier step that succeeded are compensated in reverse
//! order. Optional steps that give up only leave a warning.
//!
//! Cancellation is observed between steps only; a handler that has started
//! runs to completion or timeout.

use crate::DeadLetterQueue;
use crate::config::EngineConfig;
use crate::metrics::WorkflowMetrics;
use crate::retry::{RetryPolicy, retry_counted};
use netprov_core::environment::Clock;
use netprov_core::workflow::{
    StepDefinition, StepError, StepStatus, WorkflowContext, WorkflowDefinition, WorkflowExecution,
    WorkflowStatus, WorkflowStepError,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

/// Dead-letter queue name for compensations that exhausted their retries.
pub const COMPENSATION_QUEUE: &str = "compensation";

/// A compensation the engine could not complete.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FailedCompensation {
    /// Execution the step belonged to
    pub execution_id: Uuid,
    /// Workflow name
    pub workflow_name: String,
    /// Step whose compensation failed
    pub step_name: String,
    /// Context the compensation was given
    pub context: WorkflowContext,
}

enum Stop {
    RequiredStepFailed(usize),
    Cancelled,
}

/// Executes workflow definitions.
#[derive(Clone)]
pub struct WorkflowEngine {
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    dead_letters: DeadLetterQueue<FailedCompensation>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("retry", &self.retry)
            .field("dead_letters", &self.dead_letters.len())
            .finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// Engine using `retry` for backoff timing. Per-step retry counts come
    /// from each [`StepDefinition`].
    #[must_use]
    pub fn new(retry: RetryPolicy, clock: Arc<dyn Clock>, dead_letter_capacity: usize) -> Self {
        Self {
            retry,
            clock,
            dead_letters: DeadLetterQueue::new(COMPENSATION_QUEUE, dead_letter_capacity),
        }
    }

    /// Engine configured from [`EngineConfig`].
    #[must_use]
    pub fn from_config(config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.retry_policy(), clock, config.dead_letter_capacity)
    }

    /// Compensations that could not be completed.
    #[must_use]
    pub const fn dead_letters(&self) -> &DeadLetterQueue<FailedCompensation> {
        &self.dead_letters
    }

    /// Run `definition` to a terminal status.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
    ) -> WorkflowExecution {
        let (_never, cancel) = watch::channel(false);
        self.execute_cancellable(definition, context, &cancel).await
    }

    /// Run `definition`, stopping before the next step once `cancel` reads `true`.
    ///
    /// A cancelled run compensates every succeeded step and ends
    /// [`WorkflowStatus::Compensated`], or [`WorkflowStatus::Failed`] if any
    /// compensation could not be completed.
    #[tracing::instrument(skip_all, fields(workflow = %definition.name, execution_id))]
    pub async fn execute_cancellable(
        &self,
        definition: &WorkflowDefinition,
        context: WorkflowContext,
        cancel: &watch::Receiver<bool>,
    ) -> WorkflowExecution {
        let started = Instant::now();
        let mut execution = WorkflowExecution::new(definition, context);
        tracing::Span::current().record("execution_id", tracing::field::display(execution.id));

        execution.status = WorkflowStatus::Running;
        execution.started_at = Some(self.clock.now());
        tracing::info!(steps = definition.steps.len(), "Workflow started");

        let mut stop = None;
        for (index, step) in definition.steps.iter().enumerate() {
            if *cancel.borrow() {
                tracing::info!(next_step = %step.step_name, "Workflow cancelled");
                stop = Some(Stop::Cancelled);
                break;
            }

            if !self.run_step(step, index, &mut execution).await {
                stop = Some(Stop::RequiredStepFailed(index));
                break;
            }
        }

        execution.status = match stop {
            None => WorkflowStatus::Completed,
            Some(Stop::RequiredStepFailed(index)) => {
                execution.status = WorkflowStatus::Compensating;
                self.compensate(definition, &mut execution, Some(index)).await;
                WorkflowStatus::Failed
            }
            Some(Stop::Cancelled) => {
                execution.status = WorkflowStatus::Compensating;
                if self.compensate(definition, &mut execution, None).await {
                    WorkflowStatus::Compensated
                } else {
                    execution.error = Some("cancelled; compensation incomplete".to_string());
                    WorkflowStatus::Failed
                }
            }
        };
        execution.completed_at = Some(self.clock.now());

        let elapsed = started.elapsed();
        WorkflowMetrics::record_run(&definition.name, execution.status.as_str(), elapsed);
        tracing::info!(
            status = execution.status.as_str(),
            warnings = execution.warnings.len(),
            duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Workflow finished"
        );
        execution
    }

    /// Run one step with retries. Returns `false` if the workflow must stop.
    async fn run_step(
        &self,
        step: &StepDefinition,
        index: usize,
        execution: &mut WorkflowExecution,
    ) -> bool {
        let span = tracing::info_span!("workflow_step", step = %step.step_name, required = step.required);
        let policy = self.retry.with_max_retries(step.max_retries);
        let started = Instant::now();

        if let Some(record) = execution.steps.get_mut(index) {
            record.status = StepStatus::Running;
            record.started_at = Some(self.clock.now());
        }

        let snapshot = execution.context.clone();
        let retried = retry_counted(&policy, |attempt| {
            let handler = step.handler.clone();
            let timeout = step.timeout;
            let context = snapshot.clone();
            async move {
                tracing::debug!(attempt, "Invoking step handler");
                tokio::time::timeout(timeout, handler(context))
                    .await
                    .unwrap_or(Err(StepError::Timeout(timeout)))
            }
        })
        .instrument(span.clone())
        .await;

        let succeeded = retried.result.is_ok();
        WorkflowMetrics::record_step(
            &step.step_name,
            retried.attempts,
            succeeded,
            step.required,
            started.elapsed(),
        );

        let finished_at = self.clock.now();
        let Some(record) = execution.steps.get_mut(index) else {
            return false;
        };
        record.attempt_count = retried.attempts;
        record.finished_at = Some(finished_at);

        match retried.result {
            Ok(output) => {
                for (key, value) in &output {
                    execution.context.insert(key.clone(), value.clone());
                }
                record.status = StepStatus::Succeeded;
                record.output_data = output;
                true
            }
            Err(source) => {
                let error = WorkflowStepError {
                    step_name: step.step_name.clone(),
                    attempts: retried.attempts,
                    source,
                };
                record.status = StepStatus::Failed;
                record.error = Some(error.source.to_string());

                if step.required {
                    span.in_scope(|| tracing::error!(error = %error, "Required step failed"));
                    execution.error = Some(error.to_string());
                    false
                } else {
                    span.in_scope(|| tracing::warn!(error = %error, "Optional step failed, continuing"));
                    execution.warnings.push(error.to_string());
                    true
                }
            }
        }
    }

    /// Compensate in reverse order. `failed` is the required step that
    /// stopped the run, if any. Returns `true` if nothing was left undone.
    async fn compensate(
        &self,
        definition: &WorkflowDefinition,
        execution: &mut WorkflowExecution,
        failed: Option<usize>,
    ) -> bool {
        let snapshot = execution.context.clone();
        let mut complete = true;

        for (index, step) in definition.steps.iter().enumerate().rev() {
            let Some(status) = execution.steps.get(index).map(|s| s.status) else {
                continue;
            };
            if status != StepStatus::Succeeded && failed != Some(index) {
                continue;
            }
            let Some(compensation) = step.compensation_handler.clone() else {
                continue;
            };

            let span = tracing::info_span!("compensation", step = %step.step_name);
            let policy = self.retry.with_max_retries(step.max_retries);
            let timeout = step.timeout;
            let retried = retry_counted(&policy, |attempt| {
                let compensation = compensation.clone();
                let context = snapshot.clone();
                async move {
                    tracing::debug!(attempt, "Invoking compensation");
                    tokio::time::timeout(timeout, compensation(context))
                        .await
                        .unwrap_or(Err(StepError::Timeout(timeout)))
                }
            })
            .instrument(span.clone())
            .await;

            let succeeded = retried.result.is_ok();
            WorkflowMetrics::record_compensation(&step.step_name, succeeded);

            let Some(record) = execution.steps.get_mut(index) else {
                continue;
            };
            record.compensation_attempts = retried.attempts;

            if let Err(e) = retried.result {
                complete = false;
                record.compensation_error = Some(e.to_string());
                span.in_scope(|| {
                    tracing::error!(
                        attempts = retried.attempts,
                        error = %e,
                        "Compensation failed, sending to dead-letter queue"
                    );
                });
                self.dead_letters.push(
                    FailedCompensation {
                        execution_id: execution.id,
                        workflow_name: definition.name.clone(),
                        step_name: step.step_name.clone(),
                        context: snapshot.clone(),
                    },
                    e.to_string(),
                    retried.attempts,
                );
            } else {
                record.status = StepStatus::Compensated;
            }
        }

        complete
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use netprov_core::environment::SystemClock;
    use netprov_core::workflow::{compensation_handler, step_handler};
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn engine() -> WorkflowEngine {
        let retry = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .build();
        WorkflowEngine::new(retry, Arc::new(SystemClock), 16)
    }

    fn step(name: &str, max_retries: u32, handler: netprov_core::workflow::StepHandlerFn) -> StepDefinition {
        StepDefinition {
            step_name: name.to_string(),
            handler,
            compensation_handler: None,
            max_retries,
            timeout: Duration::from_millis(200),
            required: true,
        }
    }

    #[tokio::test]
    async fn test_flaky_step_succeeds_within_retry_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = step(
            "flaky",
            2,
            step_handler(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StepError::Failed("not yet".into()))
                    } else {
                        let mut out = WorkflowContext::new();
                        out.insert("done".into(), Value::Bool(true));
                        Ok(out)
                    }
                }
            }),
        );
        let definition = WorkflowDefinition {
            name: "w".into(),
            steps: vec![flaky],
        };

        let execution = engine().execute(&definition, WorkflowContext::new()).await;

        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(execution.steps[0].attempt_count, 3);
        assert_eq!(execution.context.get("done"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let mut slow = step(
            "slow",
            0,
            step_handler(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(WorkflowContext::new())
            }),
        );
        slow.timeout = Duration::from_millis(10);
        let definition = WorkflowDefinition {
            name: "w".into(),
            steps: vec![slow],
        };

        let execution = engine().execute(&definition, WorkflowContext::new()).await;

        assert_eq!(execution.status, WorkflowStatus::Failed);
        assert_eq!(execution.steps[0].status, StepStatus::Failed);
        assert!(execution.steps[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_failed_compensation_is_dead_lettered() {
        let mut first = step("first", 0, step_handler(|_| async { Ok(WorkflowContext::new()) }));
        first.compensation_handler = Some(compensation_handler(|_| async {
            Err(StepError::Failed("backend down".into()))
        }));
        let second = step(
            "second",
            0,
            step_handler(|_| async { Err(StepError::Failed("boom".into())) }),
        );
        let definition = WorkflowDefinition {
            name: "w".into(),
            steps: vec![first, second],
        };
        let engine = engine();

        let execution = engine.execute(&definition, WorkflowContext::new()).await;

        assert_eq!(execution.status, WorkflowStatus::Failed);
        assert_eq!(execution.steps[0].status, StepStatus::Succeeded);
        assert_eq!(execution.steps[0].compensation_attempts, 1);
        assert!(execution.steps[0].compensation_error.is_some());

        let letters = engine.dead_letters().drain();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload.step_name, "first");
        assert_eq!(letters[0].payload.execution_id, execution.id);
    }

    #[tokio::test]
    async fn test_cancellation_between_steps_compensates() {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let undone = Arc::new(AtomicU32::new(0));

        let cancel = tx.clone();
        let mut first = step(
            "first",
            0,
            step_handler(move |_| {
                cancel.send_replace(true);
                async { Ok(WorkflowContext::new()) }
            }),
        );
        let counter = undone.clone();
        first.compensation_handler = Some(compensation_handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }));
        let second = step("second", 0, step_handler(|_| async { Ok(WorkflowContext::new()) }));
        let definition = WorkflowDefinition {
            name: "w".into(),
            steps: vec![first, second],
        };

        let execution = engine()
            .execute_cancellable(&definition, WorkflowContext::new(), &rx)
            .await;

        assert_eq!(execution.status, WorkflowStatus::Compensated);
        assert_eq!(execution.steps[0].status, StepStatus::Compensated);
        assert_eq!(execution.steps[1].status, StepStatus::Pending);
        assert_eq!(undone.load(Ordering::SeqCst), 1);
    }
}
