//! Step registry.
//!
//! Maps step names to their handler and compensation. Built once at startup
//! and then only read; workflow definitions are resolved against it with
//! [`StepRegistry::build`].

use netprov_core::workflow::{
    CompensationFn, StepDefinition, StepHandlerFn, StepPlan, WorkflowDefinition, WorkflowError,
    WorkflowPlan,
};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Clone)]
struct Registration {
    handler: StepHandlerFn,
    compensation: Option<CompensationFn>,
}

/// Named step handlers plus the engine-wide retry and timeout defaults.
///
/// ## Example
///
/// ```ignore
/// let mut registry = StepRegistry::new(2, Duration::from_secs(10));
/// registry.register("upsert_profile", handler, Some(compensation))?;
///
/// let definition = registry.build(&WorkflowPlan::new("onboard").step(StepPlan::required("upsert_profile")))?;
/// ```
#[derive(Clone)]
pub struct StepRegistry {
    steps: HashMap<String, Registration>,
    default_max_retries: u32,
    default_timeout: Duration,
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.names())
            .field("default_max_retries", &self.default_max_retries)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl StepRegistry {
    /// Empty registry; plans that leave retries or timeout unset get these defaults.
    #[must_use]
    pub fn new(default_max_retries: u32, default_timeout: Duration) -> Self {
        Self {
            steps: HashMap::new(),
            default_max_retries,
            default_timeout,
        }
    }

    /// Register a step.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::AlreadyRegistered`] if the name is taken; the
    /// existing registration is kept.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: StepHandlerFn,
        compensation: Option<CompensationFn>,
    ) -> Result<(), WorkflowError> {
        match self.steps.entry(name.into()) {
            Entry::Occupied(entry) => Err(WorkflowError::AlreadyRegistered(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(Registration {
                    handler,
                    compensation,
                });
                Ok(())
            }
        }
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Registered step names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.steps.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Resolve one plan entry into an executable step.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::UnknownStep`] if the name is not registered.
    pub fn resolve(&self, plan: &StepPlan) -> Result<StepDefinition, WorkflowError> {
        let registration = self
            .steps
            .get(&plan.name)
            .ok_or_else(|| WorkflowError::UnknownStep(plan.name.clone()))?;

        Ok(StepDefinition {
            step_name: plan.name.clone(),
            handler: registration.handler.clone(),
            compensation_handler: registration.compensation.clone(),
            max_retries: plan.max_retries.unwrap_or(self.default_max_retries),
            timeout: plan.timeout.unwrap_or(self.default_timeout),
            required: plan.required,
        })
    }

    /// Resolve a whole workflow.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::EmptyWorkflow`], [`WorkflowError::DuplicateStep`]
    /// or [`WorkflowError::UnknownStep`].
    pub fn build(&self, plan: &WorkflowPlan) -> Result<WorkflowDefinition, WorkflowError> {
        if plan.steps.is_empty() {
            return Err(WorkflowError::EmptyWorkflow(plan.name.clone()));
        }

        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(WorkflowError::DuplicateStep {
                    workflow: plan.name.clone(),
                    step: step.name.clone(),
                });
            }
            steps.push(self.resolve(step)?);
        }

        Ok(WorkflowDefinition {
            name: plan.name.clone(),
            steps,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use netprov_core::workflow::{WorkflowContext, compensation_handler, step_handler};

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::new(2, Duration::from_secs(10));
        registry
            .register("a", step_handler(|_| async { Ok(WorkflowContext::new()) }), None)
            .unwrap();
        registry
            .register(
                "b",
                step_handler(|_| async { Ok(WorkflowContext::new()) }),
                Some(compensation_handler(|_| async { Ok(()) })),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_register_rejects_duplicate_name() {
        let mut registry = registry();
        let err = registry
            .register(
                "b",
                step_handler(|_| async { Ok(WorkflowContext::new()) }),
                None,
            )
            .unwrap_err();

        assert_eq!(err, WorkflowError::AlreadyRegistered("b".into()));
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        let kept = registry.resolve(&StepPlan::optional("b")).unwrap();
        assert!(kept.compensation_handler.is_some());
    }

    #[test]
    fn test_resolve_applies_defaults_and_overrides() {
        let registry = registry();

        let step = registry.resolve(&StepPlan::optional("b")).unwrap();
        assert_eq!(step.max_retries, 2);
        assert_eq!(step.timeout, Duration::from_secs(10));
        assert!(!step.required);
        assert!(step.compensation_handler.is_some());

        let step = registry
            .resolve(
                &StepPlan::required("a")
                    .with_max_retries(0)
                    .with_timeout(Duration::from_millis(50)),
            )
            .unwrap();
        assert_eq!(step.max_retries, 0);
        assert_eq!(step.timeout, Duration::from_millis(50));
        assert!(step.required);
    }

    #[test]
    fn test_build_rejects_bad_plans() {
        let registry = registry();

        assert_eq!(
            registry.build(&WorkflowPlan::new("empty")).unwrap_err(),
            WorkflowError::EmptyWorkflow("empty".into())
        );
        assert_eq!(
            registry
                .build(&WorkflowPlan::new("w").step(StepPlan::required("missing")))
                .unwrap_err(),
            WorkflowError::UnknownStep("missing".into())
        );
        assert!(matches!(
            registry
                .build(
                    &WorkflowPlan::new("w")
                        .step(StepPlan::required("a"))
                        .step(StepPlan::required("a"))
                )
                .unwrap_err(),
            WorkflowError::DuplicateStep { .. }
        ));
    }

    #[test]
    fn test_build_preserves_order() {
        let definition = registry()
            .build(
                &WorkflowPlan::new("w")
                    .step(StepPlan::required("b"))
                    .step(StepPlan::optional("a")),
            )
            .unwrap();
        let names: Vec<_> = definition.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, ["b", "a"]);
    }
}
