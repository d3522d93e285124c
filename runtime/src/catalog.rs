//! Named workflows and `execute_workflow`.

use crate::engine::WorkflowEngine;
use crate::registry::StepRegistry;
use netprov_core::workflow::{
    WorkflowContext, WorkflowDefinition, WorkflowError, WorkflowExecution, WorkflowPlan,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Workflow definitions by name, bound to one engine.
///
/// Built at startup and shared read-only afterwards.
#[derive(Clone, Debug)]
pub struct WorkflowCatalog {
    engine: WorkflowEngine,
    workflows: HashMap<String, Arc<WorkflowDefinition>>,
}

impl WorkflowCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new(engine: WorkflowEngine) -> Self {
        Self {
            engine,
            workflows: HashMap::new(),
        }
    }

    /// Resolve every plan against `registry`.
    ///
    /// # Errors
    ///
    /// Returns the first [`WorkflowError`] from [`StepRegistry::build`].
    pub fn from_plans(
        registry: &StepRegistry,
        engine: WorkflowEngine,
        plans: impl IntoIterator<Item = WorkflowPlan>,
    ) -> Result<Self, WorkflowError> {
        let mut catalog = Self::new(engine);
        for plan in plans {
            catalog.insert(registry.build(&plan)?);
        }
        Ok(catalog)
    }

    /// Add a definition. Returns `true` if one with the same name was replaced.
    pub fn insert(&mut self, definition: WorkflowDefinition) -> bool {
        tracing::debug!(workflow = %definition.name, steps = definition.steps.len(), "Workflow registered");
        self.workflows
            .insert(definition.name.clone(), Arc::new(definition))
            .is_some()
    }

    /// Definition by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(name).map(AsRef::as_ref)
    }

    /// Registered workflow names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.keys().cloned().collect();
        names.sort();
        names
    }

    /// The engine runs are executed on.
    #[must_use]
    pub const fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Run the named workflow and return once it is terminal.
    ///
    /// Callers that want fire-and-forget behaviour spawn this themselves.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::UnknownWorkflow`]. Step failures are reported
    /// in the returned [`WorkflowExecution`], not as errors.
    pub async fn execute_workflow(
        &self,
        name: &str,
        input: WorkflowContext,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let definition = self.definition(name)?;
        Ok(self.engine.execute(&definition, input).await)
    }

    /// [`execute_workflow`](Self::execute_workflow) with a cancellation signal.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::UnknownWorkflow`].
    pub async fn execute_workflow_cancellable(
        &self,
        name: &str,
        input: WorkflowContext,
        cancel: &watch::Receiver<bool>,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let definition = self.definition(name)?;
        Ok(self
            .engine
            .execute_cancellable(&definition, input, cancel)
            .await)
    }

    fn definition(&self, name: &str) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        self.workflows
            .get(name)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownWorkflow(name.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use netprov_core::environment::SystemClock;
    use netprov_core::workflow::{StepPlan, WorkflowStatus, step_handler};
    use std::time::Duration;

    fn catalog() -> WorkflowCatalog {
        let mut registry = StepRegistry::new(0, Duration::from_secs(1));
        registry.register(
            "echo",
            step_handler(|ctx| async move {
                let mut out = WorkflowContext::new();
                if let Some(v) = ctx.get("in") {
                    out.insert("out".into(), v.clone());
                }
                Ok(out)
            }),
            None,
        )
        .unwrap();
        let engine = WorkflowEngine::new(RetryPolicy::default(), Arc::new(SystemClock), 8);
        WorkflowCatalog::from_plans(
            &registry,
            engine,
            [WorkflowPlan::new("echo_workflow").step(StepPlan::required("echo"))],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_workflow_returns_terminal_execution() {
        let mut input = WorkflowContext::new();
        input.insert("in".into(), "hello".into());

        let execution = catalog().execute_workflow("echo_workflow", input).await.unwrap();

        assert_eq!(execution.status, WorkflowStatus::Completed);
        assert_eq!(execution.context_str("out"), Some("hello"));
        assert_eq!(execution.context_str("in"), Some("hello"));
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let err = catalog()
            .execute_workflow("nope", WorkflowContext::new())
            .await
            .unwrap_err();
        assert_eq!(err, WorkflowError::UnknownWorkflow("nope".into()));
    }

    #[test]
    fn test_from_plans_propagates_unknown_step() {
        let registry = StepRegistry::new(0, Duration::from_secs(1));
        let engine = WorkflowEngine::new(RetryPolicy::default(), Arc::new(SystemClock), 8);
        let err = WorkflowCatalog::from_plans(
            &registry,
            engine,
            [WorkflowPlan::new("w").step(StepPlan::required("ghost"))],
        )
        .unwrap_err();
        assert_eq!(err, WorkflowError::UnknownStep("ghost".into()));
    }
}
