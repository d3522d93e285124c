//! Saga engine semantics and the built-in provisioning workflows.

#![allow(clippy::unwrap_used)]

use netprov_core::circuit::CircuitPolicy;
use netprov_core::family::Protocol;
use netprov_core::lifecycle::LifecycleState;
use netprov_core::workflow::{
    StepError, StepPlan, StepStatus, WorkflowContext, WorkflowPlan, WorkflowStatus,
    compensation_handler, step_handler,
};
use netprov_runtime::steps::{
    DECOMMISSION_SUBSCRIBER, PROVISION_SUBSCRIBER, RESUME_SUBSCRIBER, SUSPEND_SUBSCRIBER,
};
use netprov_runtime::{RetryPolicy, StepRegistry, WorkflowCatalog, WorkflowEngine};
use netprov_testing::mocks::MockAllocator;
use netprov_testing::{LifecycleHarness, test_clock};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type Journal = Arc<Mutex<Vec<String>>>;

fn note(journal: &Journal, entry: String) {
    journal.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Registry with steps `a`, `b`, `c`; `fail` names the steps whose handler always fails.
fn journaled_registry(journal: &Journal, fail: &'static [&'static str]) -> StepRegistry {
    let mut registry = StepRegistry::new(1, Duration::from_secs(1));
    for name in ["a", "b", "c"] {
        let run = journal.clone();
        let undo = journal.clone();
        registry.register(
            name,
            step_handler(move |_| {
                note(&run, format!("run {name}"));
                async move {
                    if fail.contains(&name) {
                        Err(StepError::Failed(format!("{name} broke")))
                    } else {
                        let mut out = WorkflowContext::new();
                        out.insert(format!("{name}_done"), Value::Bool(true));
                        Ok(out)
                    }
                }
            }),
            Some(compensation_handler(move |_| {
                note(&undo, format!("undo {name}"));
                async { Ok(()) }
            })),
        )
        .unwrap();
    }
    registry
}

fn engine() -> WorkflowEngine {
    let retry = RetryPolicy::builder()
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(2))
        .build();
    WorkflowEngine::new(retry, Arc::new(test_clock()), 32)
}

#[tokio::test]
async fn test_required_failure_compensates_in_reverse_and_stops() {
    let journal = Journal::default();
    let registry = journaled_registry(&journal, &["b"]);
    let catalog = WorkflowCatalog::from_plans(
        &registry,
        engine(),
        [WorkflowPlan::new("abc")
            .step(StepPlan::required("a"))
            .step(StepPlan::required("b"))
            .step(StepPlan::required("c"))],
    )
    .unwrap();

    let execution = catalog
        .execute_workflow("abc", WorkflowContext::new())
        .await
        .unwrap();

    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert_eq!(execution.step("a").unwrap().status, StepStatus::Compensated);
    assert_eq!(execution.step("b").unwrap().status, StepStatus::Compensated);
    assert_eq!(execution.step("b").unwrap().attempt_count, 2);
    assert_eq!(execution.step("c").unwrap().status, StepStatus::Pending);
    assert_eq!(execution.step("c").unwrap().attempt_count, 0);
    assert!(execution.error.as_deref().unwrap().contains("step `b` failed after 2 attempt(s)"));
    assert_eq!(
        entries(&journal),
        ["run a", "run b", "run b", "undo b", "undo a"]
    );
}

#[tokio::test]
async fn test_optional_failure_records_warning_and_continues() {
    let journal = Journal::default();
    let registry = journaled_registry(&journal, &["b"]);
    let catalog = WorkflowCatalog::from_plans(
        &registry,
        engine(),
        [WorkflowPlan::new("abc")
            .step(StepPlan::required("a"))
            .step(StepPlan::optional("b").with_max_retries(0))
            .step(StepPlan::required("c"))],
    )
    .unwrap();

    let execution = catalog
        .execute_workflow("abc", WorkflowContext::new())
        .await
        .unwrap();

    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(execution.step("b").unwrap().status, StepStatus::Failed);
    assert_eq!(execution.step("c").unwrap().status, StepStatus::Succeeded);
    assert_eq!(execution.warnings.len(), 1);
    assert!(execution.warnings[0].contains("b broke"));
    assert_eq!(execution.context.get("c_done"), Some(&Value::Bool(true)));
    assert!(!entries(&journal).iter().any(|e| e.starts_with("undo")));
}

#[tokio::test]
async fn test_context_only_grows() {
    let journal = Journal::default();
    let registry = journaled_registry(&journal, &[]);
    let catalog = WorkflowCatalog::from_plans(
        &registry,
        engine(),
        [WorkflowPlan::new("ab")
            .step(StepPlan::required("a"))
            .step(StepPlan::required("b"))],
    )
    .unwrap();
    let mut input = WorkflowContext::new();
    input.insert("subscriber_id".into(), Value::from("sub-1"));

    let execution = catalog.execute_workflow("ab", input).await.unwrap();

    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(execution.context_str("subscriber_id"), Some("sub-1"));
    assert_eq!(execution.context.get("a_done"), Some(&Value::Bool(true)));
    assert_eq!(execution.context.get("b_done"), Some(&Value::Bool(true)));
    assert!(execution.completed_at.is_some());
}

fn provision_input(subscriber_id: &str) -> WorkflowContext {
    let input = json!({
        "subscriber_id": subscriber_id,
        "profile": { "plan": "fiber-500", "circuit_id": "olt-3/1/7" },
        "circuit_id": "olt-3/1/7",
        "ipv4_pool_id": "v4-residential",
        "ipv6_pool_id": "v6-pd",
        "session_ref": "acct-1",
    });
    match input {
        Value::Object(map) => map,
        _ => WorkflowContext::new(),
    }
}

#[tokio::test]
async fn test_provision_subscriber_end_to_end() {
    let harness = LifecycleHarness::new();
    let catalog = harness.catalog().unwrap();

    let execution = catalog
        .execute_workflow(PROVISION_SUBSCRIBER, provision_input("sub-1"))
        .await
        .unwrap();

    assert_eq!(execution.status, WorkflowStatus::Completed, "{:?}", execution.error);
    assert!(execution.warnings.is_empty());
    assert_eq!(execution.context_str("circuit_validation"), Some("NO_PROFILE"));
    assert_eq!(execution.context_str("ipv4_address"), Some("100.64.0.1"));
    assert_eq!(execution.context_str("ipv6_address"), Some("2001:db8:1::/56"));
    assert_eq!(execution.context_str("ipv4_state"), Some("ACTIVE"));
    assert_eq!(execution.context_str("ipv4_session_update"), Some("ok"));

    for protocol in [Protocol::Ipv4, Protocol::Ipv6] {
        let row = harness.reservation("sub-1", protocol).unwrap();
        assert_eq!(row.lifecycle_state, LifecycleState::Active);
    }
    assert_eq!(harness.session.coa_count(), 2);
    assert!(!harness.profiles.profile("sub-1").unwrap().deleted);
}

#[tokio::test]
async fn test_provision_without_ipv6_input_skips_ipv6() {
    let harness = LifecycleHarness::new();
    let catalog = harness.catalog().unwrap();
    let mut input = provision_input("sub-1");
    input.remove("ipv6_pool_id");

    let execution = catalog
        .execute_workflow(PROVISION_SUBSCRIBER, input)
        .await
        .unwrap();

    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert!(execution.warnings.is_empty());
    assert!(execution.context_str("ipv6_skipped").is_some());
    assert!(harness.reservation("sub-1", Protocol::Ipv6).is_none());
}

#[tokio::test]
async fn test_exhausted_ipv4_pool_rolls_back_profile() {
    let harness = LifecycleHarness::builder()
        .ipv4_allocator(MockAllocator::exhausted())
        .build();
    let catalog = harness.catalog().unwrap();

    let execution = catalog
        .execute_workflow(PROVISION_SUBSCRIBER, provision_input("sub-1"))
        .await
        .unwrap();

    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert_eq!(
        execution.step("upsert_profile").unwrap().status,
        StepStatus::Compensated
    );
    assert_eq!(
        execution.step("allocate_ipv6").unwrap().attempt_count,
        0,
        "steps after the failure never run"
    );
    assert!(harness.profiles.profile("sub-1").unwrap().deleted);
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn test_exhausted_ipv6_pool_is_a_warning() {
    let harness = LifecycleHarness::builder()
        .ipv6_allocator(MockAllocator::exhausted())
        .build();
    let catalog = harness.catalog().unwrap();

    let execution = catalog
        .execute_workflow(PROVISION_SUBSCRIBER, provision_input("sub-1"))
        .await
        .unwrap();

    assert_eq!(execution.status, WorkflowStatus::Completed);
    assert_eq!(execution.warnings.len(), 1);
    assert!(execution.warnings[0].contains("allocate_ipv6"));
    assert_eq!(
        harness.reservation("sub-1", Protocol::Ipv4).unwrap().lifecycle_state,
        LifecycleState::Active
    );
    assert_eq!(
        execution.step("activate_ipv6").unwrap().status,
        StepStatus::Succeeded
    );
    assert!(execution.context_str("ipv6_skipped").is_some());
}

#[tokio::test]
async fn test_enforced_location_mismatch_rejects_before_allocation() {
    let harness = LifecycleHarness::builder()
        .configure(|c| c.circuit.policy = CircuitPolicy::Enforce)
        .build();
    harness.profiles.bind("sub-1", Some("olt-1/1/1"), None);
    let catalog = harness.catalog().unwrap();

    let execution = catalog
        .execute_workflow(PROVISION_SUBSCRIBER, provision_input("sub-1"))
        .await
        .unwrap();

    assert_eq!(execution.status, WorkflowStatus::Failed);
    let validate = execution.step("validate_circuit").unwrap();
    assert_eq!(validate.status, StepStatus::Failed);
    assert_eq!(validate.attempt_count, 1);
    assert!(validate.error.as_deref().unwrap().contains("MISMATCH"));
    assert_eq!(harness.ipv4_allocator.reserve_count(), 0);
}

#[tokio::test]
async fn test_suspend_resume_and_decommission() {
    let harness = LifecycleHarness::new();
    let catalog = harness.catalog().unwrap();
    catalog
        .execute_workflow(PROVISION_SUBSCRIBER, provision_input("sub-1"))
        .await
        .unwrap();

    let mut input = provision_input("sub-1");
    input.insert("suspend_reason".into(), Value::from("unpaid"));
    let suspended = catalog
        .execute_workflow(SUSPEND_SUBSCRIBER, input.clone())
        .await
        .unwrap();
    assert_eq!(suspended.status, WorkflowStatus::Completed);
    assert_eq!(
        harness.reservation("sub-1", Protocol::Ipv6).unwrap().lifecycle_state,
        LifecycleState::Suspended
    );

    let resumed = catalog
        .execute_workflow(RESUME_SUBSCRIBER, input.clone())
        .await
        .unwrap();
    assert_eq!(resumed.status, WorkflowStatus::Completed);
    assert_eq!(
        harness.reservation("sub-1", Protocol::Ipv4).unwrap().lifecycle_state,
        LifecycleState::Active
    );

    let decommissioned = catalog
        .execute_workflow(DECOMMISSION_SUBSCRIBER, input)
        .await
        .unwrap();
    assert_eq!(decommissioned.status, WorkflowStatus::Completed);
    for protocol in [Protocol::Ipv4, Protocol::Ipv6] {
        assert_eq!(
            harness.reservation("sub-1", protocol).unwrap().lifecycle_state,
            LifecycleState::Revoked
        );
    }
    assert_eq!(harness.ipv4_allocator.release_count(), 1);
    assert_eq!(harness.ipv6_allocator.release_count(), 1);
    assert_eq!(harness.session.disconnect_count(), 2);
    assert!(harness.profiles.profile("sub-1").unwrap().deleted);
}

#[tokio::test]
async fn test_suspend_of_unknown_subscriber_fails() {
    let harness = LifecycleHarness::new();
    let catalog = harness.catalog().unwrap();

    let execution = catalog
        .execute_workflow(SUSPEND_SUBSCRIBER, provision_input("ghost"))
        .await
        .unwrap();

    assert_eq!(execution.status, WorkflowStatus::Failed);
    assert!(execution.error.as_deref().unwrap().contains("no ipv4 reservation"));
}
