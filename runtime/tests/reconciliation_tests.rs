//! Reconciliation sweep against the in-memory store and mock allocators.

#![allow(clippy::unwrap_used)]

use chrono::Duration;
use netprov_core::environment::Clock;
use netprov_core::family::Protocol;
use netprov_core::lifecycle::LifecycleState;
use netprov_core::reservation::{AddressReservation, meta};
use netprov_runtime::config::StaleAllocatedPolicy;
use netprov_runtime::{AddressLifecycleService, AllocateRequest, HealthStatus, SweepReport};
use netprov_testing::LifecycleHarness;
use serde_json::Value;

const SUB: &str = "sub-1";

async fn allocated(harness: &LifecycleHarness, subscriber_id: &str) {
    harness
        .ipv4
        .allocate(&AllocateRequest::new(subscriber_id).with_pool("v4"))
        .await
        .unwrap();
}

async fn active(harness: &LifecycleHarness, subscriber_id: &str) {
    allocated(harness, subscriber_id).await;
    harness.ipv4.activate(subscriber_id, None, false).await.unwrap();
}

fn past_stale_threshold(harness: &LifecycleHarness) {
    let secs = i64::try_from(harness.config.reconciliation.stale_after_secs).unwrap();
    harness.clock.advance(Duration::seconds(secs + 1));
}

#[tokio::test]
async fn test_stale_allocated_row_is_revoked_and_released() {
    let harness = LifecycleHarness::new();
    allocated(&harness, SUB).await;
    active(&harness, "sub-active").await;
    past_stale_threshold(&harness);
    allocated(&harness, "sub-fresh").await;

    let report = harness.reconciler().sweep().await.unwrap();

    assert_eq!(report.examined, 1);
    assert_eq!(report.resolved, 1);
    let row = harness.reservation(SUB, Protocol::Ipv4).unwrap();
    assert_eq!(row.lifecycle_state, LifecycleState::Revoked);
    assert_eq!(row.metadata_str(meta::POOL_RELEASE), Some("released"));
    assert_eq!(harness.ipv4_allocator.released(), ["100.64.0.1"]);
    assert_eq!(harness.session.disconnect_count(), 0);

    assert_eq!(
        harness.reservation("sub-active", Protocol::Ipv4).unwrap().lifecycle_state,
        LifecycleState::Active
    );
    assert_eq!(
        harness.reservation("sub-fresh", Protocol::Ipv4).unwrap().lifecycle_state,
        LifecycleState::Allocated
    );
}

#[tokio::test]
async fn test_flag_policy_marks_stale_allocated_failed() {
    let harness = LifecycleHarness::builder()
        .configure(|c| c.reconciliation.stale_allocated = StaleAllocatedPolicy::Flag)
        .build();
    allocated(&harness, SUB).await;
    past_stale_threshold(&harness);

    let report = harness.reconciler().sweep().await.unwrap();

    assert_eq!(report.flagged, 1);
    assert_eq!(report.resolved, 0);
    let row = harness.reservation(SUB, Protocol::Ipv4).unwrap();
    assert_eq!(row.lifecycle_state, LifecycleState::Failed);
    assert!(row.metadata_str(meta::FAILURE_REASON).is_some());
    assert_eq!(harness.ipv4_allocator.release_count(), 0);
}

#[tokio::test]
async fn test_stuck_revoking_row_after_release_finishes_without_releasing() {
    let harness = LifecycleHarness::new();
    let mut row = AddressReservation::pending(&harness.key(SUB, Protocol::Ipv4), harness.clock.now());
    row.pool_id = Some("v4".into());
    row.address = Some("100.64.0.9".into());
    row.lifecycle_state = LifecycleState::Revoking;
    for (key, value) in [
        (meta::ASSIGNMENT, Value::from(meta::ASSIGNMENT_POOL)),
        (meta::RELEASE_TO_POOL, Value::Bool(true)),
        (meta::POOL_RELEASE, Value::from("released")),
    ] {
        row.metadata.insert(key.to_string(), value);
    }
    harness.store.insert(row);
    past_stale_threshold(&harness);

    let report = harness.reconciler().sweep().await.unwrap();

    assert_eq!(report.resolved, 1);
    assert_eq!(
        harness.reservation(SUB, Protocol::Ipv4).unwrap().lifecycle_state,
        LifecycleState::Revoked
    );
    assert_eq!(harness.ipv4_allocator.release_count(), 0);
}

#[tokio::test]
async fn test_sweep_resumes_revoke_after_failed_release() {
    let harness = LifecycleHarness::new();
    active(&harness, SUB).await;
    harness.ipv4_allocator.fail_releases(1);
    assert!(harness.ipv4.revoke(SUB, None, true).await.is_err());
    past_stale_threshold(&harness);

    let report = harness.reconciler().sweep().await.unwrap();

    assert_eq!(report.resolved, 1);
    assert_eq!(
        harness.reservation(SUB, Protocol::Ipv4).unwrap().lifecycle_state,
        LifecycleState::Revoked
    );
    assert_eq!(harness.ipv4_allocator.released(), ["100.64.0.1"]);
}

#[tokio::test]
async fn test_unresolvable_row_is_flagged_and_dead_lettered() {
    let harness = LifecycleHarness::new();
    allocated(&harness, SUB).await;
    harness.ipv4_allocator.fail_releases(1);
    past_stale_threshold(&harness);
    let reconciler = harness.reconciler();

    let report = reconciler.sweep().await.unwrap();

    assert_eq!(report.failed, 1);
    let row = harness.reservation(SUB, Protocol::Ipv4).unwrap();
    assert_eq!(row.lifecycle_state, LifecycleState::Failed);
    assert!(
        row.metadata_str(meta::FAILURE_REASON)
            .unwrap()
            .starts_with("reconciliation failed")
    );

    let letters = reconciler.dead_letters().drain();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].payload.key, harness.key(SUB, Protocol::Ipv4));
    assert_eq!(letters[0].payload.state, LifecycleState::Allocated);

    let checks = reconciler.health_checks();
    assert_eq!(checks[0].status, HealthStatus::Degraded);
}

#[tokio::test]
async fn test_flagged_row_returns_its_address_when_reallocated() {
    let harness = LifecycleHarness::new();
    allocated(&harness, SUB).await;
    harness.ipv4_allocator.fail_releases(1);
    past_stale_threshold(&harness);
    harness.reconciler().sweep().await.unwrap();
    assert!(harness.ipv4_allocator.released().is_empty());

    harness.ipv4.recover(SUB).await.unwrap();
    let result = harness
        .ipv4
        .allocate(&AllocateRequest::new(SUB).with_pool("v4"))
        .await
        .unwrap();

    assert_eq!(result.address(), Some("100.64.0.2"));
    assert_eq!(harness.ipv4_allocator.released(), ["100.64.0.1"]);
}

#[tokio::test]
async fn test_revoked_rows_past_retention_are_purged() {
    let harness = LifecycleHarness::new();
    active(&harness, SUB).await;
    harness.ipv4.revoke(SUB, None, true).await.unwrap();
    harness.clock.advance(Duration::days(1));
    active(&harness, "sub-2").await;
    harness.ipv4.revoke("sub-2", None, true).await.unwrap();

    let retention = i64::from(harness.config.reconciliation.retention_days);
    harness.clock.advance(Duration::days(retention) - Duration::hours(12));

    let report = harness.reconciler().sweep().await.unwrap();

    assert_eq!(report.purged, 1);
    assert!(harness.reservation(SUB, Protocol::Ipv4).is_none());
    assert!(harness.reservation("sub-2", Protocol::Ipv4).is_some());
}

#[tokio::test]
async fn test_quiet_sweep_reports_nothing_and_stays_healthy() {
    let harness = LifecycleHarness::new();
    active(&harness, SUB).await;
    let reconciler = harness.reconciler();
    assert!(reconciler.last_report().is_none());

    let report = reconciler.sweep().await.unwrap();

    assert_eq!(report, SweepReport::default());
    assert_eq!(reconciler.last_report(), Some(report));
    assert!(
        reconciler
            .health_checks()
            .iter()
            .all(|c| c.status == HealthStatus::Healthy)
    );
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let harness = LifecycleHarness::builder()
        .configure(|c| c.reconciliation.interval_secs = 1)
        .build();
    let reconciler = harness.reconciler();
    let probe = reconciler.clone();
    let (tx, rx) = tokio::sync::watch::channel(false);

    let task = tokio::spawn(reconciler.run(rx));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    tx.send_replace(true);

    tokio::time::timeout(std::time::Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
    // The first interval tick fires immediately.
    assert!(probe.last_report().is_some());
}
