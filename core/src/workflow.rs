//! Workflow (saga) data model.
//!
//! A workflow is an ordered list of [`StepDefinition`]s, each pairing a
//! handler with an optional compensation. Executions are recorded as a
//! [`WorkflowExecution`] whose `context` is shared by every step and only
//! ever grows.

use crate::error::LifecycleError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Shared, additively mutated key/value context of one execution.
pub type WorkflowContext = Map<String, Value>;

/// Handler: receives a snapshot of the context, returns keys to merge into it.
pub type StepHandlerFn =
    Arc<dyn Fn(WorkflowContext) -> BoxFuture<'static, Result<WorkflowContext, StepError>> + Send + Sync>;

/// Compensation: receives the context as it stood when compensation started.
///
/// Must be idempotent; the reconciliation sweep may undo the same work again.
pub type CompensationFn =
    Arc<dyn Fn(WorkflowContext) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

/// Wrap an async closure as a [`StepHandlerFn`].
pub fn step_handler<F, Fut>(f: F) -> StepHandlerFn
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WorkflowContext, StepError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Wrap an async closure as a [`CompensationFn`].
pub fn compensation_handler<F, Fut>(f: F) -> CompensationFn
where
    F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StepError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Failure of a single handler or compensation invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Handler reported a failure.
    #[error("{0}")]
    Failed(String),

    /// Handler exceeded its timeout; treated like any other failure.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A context key the step needs is absent or has the wrong type.
    #[error("missing or invalid input `{key}`: {reason}")]
    InvalidInput {
        /// Offending context key
        key: String,
        /// What was wrong with it
        reason: String,
    },

    /// Admission was refused (e.g. access-location mismatch under enforcement).
    #[error("rejected: {0}")]
    Rejected(String),

    /// Lifecycle service error.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// A handler failure annotated with the step and how many attempts were made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("step `{step_name}` failed after {attempts} attempt(s): {source}")]
pub struct WorkflowStepError {
    /// Step that failed
    pub step_name: String,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Last error seen
    #[source]
    pub source: StepError,
}

/// Registry / catalog errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// A plan names a step nobody registered.
    #[error("unknown step `{0}`")]
    UnknownStep(String),

    /// No workflow with that name.
    #[error("unknown workflow `{0}`")]
    UnknownWorkflow(String),

    /// The same step appears twice in one workflow.
    #[error("workflow `{workflow}` lists step `{step}` more than once")]
    DuplicateStep {
        /// Workflow being built
        workflow: String,
        /// Repeated step
        step: String,
    },

    /// A step name registered twice.
    #[error("step `{0}` is already registered")]
    AlreadyRegistered(String),

    /// A workflow with no steps.
    #[error("workflow `{0}` has no steps")]
    EmptyWorkflow(String),
}

/// Executable step: handler, compensation and execution limits.
#[derive(Clone)]
pub struct StepDefinition {
    /// Registry name of the step
    pub step_name: String,
    /// Forward action
    pub handler: StepHandlerFn,
    /// Undo action, if the step has side effects worth undoing
    pub compensation_handler: Option<CompensationFn>,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Whether failure stops the workflow and triggers compensation
    pub required: bool,
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("step_name", &self.step_name)
            .field("has_compensation", &self.compensation_handler.is_some())
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("required", &self.required)
            .finish()
    }
}

/// Executable workflow.
#[derive(Clone, Debug)]
pub struct WorkflowDefinition {
    /// Workflow name used by `execute_workflow`
    pub name: String,
    /// Steps in execution order
    pub steps: Vec<StepDefinition>,
}

/// Declarative step reference, resolved against the step registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepPlan {
    /// Registry name
    pub name: String,
    /// Whether failure is fatal to the workflow
    pub required: bool,
    /// Overrides the engine default
    pub max_retries: Option<u32>,
    /// Overrides the registry default
    pub timeout: Option<Duration>,
}

impl StepPlan {
    /// Step whose failure stops the workflow.
    #[must_use]
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            max_retries: None,
            timeout: None,
        }
    }

    /// Step whose failure is logged and skipped.
    #[must_use]
    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }

    /// Override the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Declarative workflow: a name and an ordered list of step references.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowPlan {
    /// Workflow name
    pub name: String,
    /// Steps in order
    pub steps: Vec<StepPlan>,
}

impl WorkflowPlan {
    /// Empty plan.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step.
    #[must_use]
    pub fn step(mut self, step: StepPlan) -> Self {
        self.steps.push(step);
        self
    }
}

/// Status of a workflow execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, not started
    Pending,
    /// Steps executing
    Running,
    /// Every required step succeeded
    Completed,
    /// A required step failed, or a compensation could not be completed
    Failed,
    /// Undoing completed steps
    Compensating,
    /// Cancelled and fully undone
    Compensated,
}

impl WorkflowStatus {
    /// Whether the execution has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Compensated)
    }

    /// Lower-case name, used as a metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
        }
    }
}

/// Status of one step within an execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not attempted
    Pending,
    /// Handler in flight
    Running,
    /// Handler succeeded
    Succeeded,
    /// Handler failed after all retries
    Failed,
    /// Compensation succeeded
    Compensated,
}

/// Record of one step within an execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Step name
    pub step_name: String,
    /// Current status
    pub status: StepStatus,
    /// Handler attempts made
    pub attempt_count: u32,
    /// Keys the handler added to the context
    pub output_data: WorkflowContext,
    /// Last handler error
    pub error: Option<String>,
    /// Compensation attempts made
    pub compensation_attempts: u32,
    /// Last compensation error, if compensation did not succeed
    pub compensation_error: Option<String>,
    /// First attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// Last attempt finished
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// Fresh, unattempted step record.
    #[must_use]
    pub fn pending(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Pending,
            attempt_count: 0,
            output_data: WorkflowContext::new(),
            error: None,
            compensation_attempts: 0,
            compensation_error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether the handler was ever invoked.
    #[must_use]
    pub const fn was_started(&self) -> bool {
        self.attempt_count > 0
    }
}

/// Record of one workflow run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Execution id
    pub id: Uuid,
    /// Workflow that ran
    pub workflow_name: String,
    /// Current status
    pub status: WorkflowStatus,
    /// Per-step records in declared order
    pub steps: Vec<StepExecution>,
    /// Shared context
    pub context: WorkflowContext,
    /// Failures of optional steps
    pub warnings: Vec<String>,
    /// Failure that stopped the run
    pub error: Option<String>,
    /// Run started
    pub started_at: Option<DateTime<Utc>>,
    /// Run reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// Pending execution for `definition`.
    #[must_use]
    pub fn new(definition: &WorkflowDefinition, context: WorkflowContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_name: definition.name.clone(),
            status: WorkflowStatus::Pending,
            steps: definition
                .steps
                .iter()
                .map(|s| StepExecution::pending(&s.step_name))
                .collect(),
            context,
            warnings: Vec::new(),
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Step record by name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    /// String context value.
    #[must_use]
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }
}

/// Required string from the context.
///
/// # Errors
///
/// Returns [`StepError::InvalidInput`] if the key is absent, not a string, or blank.
pub fn require_str<'a>(ctx: &'a WorkflowContext, key: &str) -> Result<&'a str, StepError> {
    match ctx.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(StepError::InvalidInput {
            key: key.to_string(),
            reason: "empty string".to_string(),
        }),
        Some(_) => Err(StepError::InvalidInput {
            key: key.to_string(),
            reason: "expected a string".to_string(),
        }),
        None => Err(StepError::InvalidInput {
            key: key.to_string(),
            reason: "missing".to_string(),
        }),
    }
}

/// Optional non-blank string from the context.
#[must_use]
pub fn optional_str<'a>(ctx: &'a WorkflowContext, key: &str) -> Option<&'a str> {
    ctx.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Optional boolean from the context, defaulting to `default`.
#[must_use]
pub fn optional_bool(ctx: &WorkflowContext, key: &str, default: bool) -> bool {
    ctx.get(key).and_then(Value::as_bool).unwrap_or(default)
}
