//! Provisioning benchmarks
//!
//! - Transition validation and access-location checks (pure, in-memory)
//! - A full allocate / activate / revoke cycle against the in-memory store
//! - Saga engine overhead for a workflow of no-op steps
//!
//! Run with: `cargo bench`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use chrono::Utc;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use netprov_core::adapters::Profile;
use netprov_core::circuit::{self, CircuitPolicy};
use netprov_core::environment::SystemClock;
use netprov_core::lifecycle::{LifecycleState, validate_transition};
use netprov_core::workflow::{
    StepDefinition, WorkflowContext, WorkflowDefinition, step_handler,
};
use netprov_runtime::allocator::{LocalPoolAllocator, NoopSessionController};
use netprov_runtime::config::{LifecycleConfig, PoolConfig, SessionConfig};
use netprov_runtime::{
    AddressLifecycleService, AllocateRequest, Ipv4LifecycleService, RetryPolicy, SessionGate,
    WorkflowEngine,
};
use netprov_testing::InMemoryReservationStore;
use netprov_testing::properties::ALL_STATES;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn benchmark_pure_checks(c: &mut Criterion) {
    let mut group = c.benchmark_group("pure_checks");

    group.throughput(Throughput::Elements(49));
    group.bench_function("validate_all_transitions", |b| {
        b.iter(|| {
            let mut allowed = 0;
            for from in ALL_STATES {
                for to in ALL_STATES {
                    if validate_transition(black_box(from), black_box(to)).is_ok() {
                        allowed += 1;
                    }
                }
            }
            allowed
        });
    });

    let mut attributes = Map::new();
    attributes.insert(Profile::CIRCUIT_ID.into(), Value::from("olt-3/1/7"));
    attributes.insert(Profile::REMOTE_ID.into(), Value::from("cpe-00:11:22"));
    let profile = Profile {
        subscriber_id: "sub-1".into(),
        attributes,
        deleted: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    group.throughput(Throughput::Elements(1));
    group.bench_function("circuit_validate", |b| {
        b.iter(|| {
            circuit::validate(
                Some(black_box(&profile)),
                Some("OLT-3/1/7"),
                Some("cpe-00:11:23"),
                CircuitPolicy::Enforce,
            )
        });
    });

    group.finish();
}

fn benchmark_lifecycle_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifecycle");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    let allocator = LocalPoolAllocator::new(&[PoolConfig {
        id: "v4".into(),
        cidr: "100.64.0.0/24".into(),
        delegated_prefix_length: None,
    }])
    .expect("valid pool");
    let service = Ipv4LifecycleService::new(
        "bench",
        Arc::new(InMemoryReservationStore::new()),
        Arc::new(allocator),
        SessionGate::new(Arc::new(NoopSessionController), &SessionConfig::default()),
        Arc::new(SystemClock),
        LifecycleConfig::default(),
    );
    let request = AllocateRequest::new("sub-1").with_pool("v4");

    group.bench_function("allocate_activate_revoke", |b| {
        b.to_async(&runtime).iter(|| async {
            let _ = service.allocate(black_box(&request)).await;
            let _ = service.activate("sub-1", None, false).await;
            let result = service.revoke("sub-1", None, true).await;
            debug_assert!(matches!(
                result.map(|r| r.state),
                Ok(Some(LifecycleState::Revoked))
            ));
        });
    });

    group.finish();
}

fn benchmark_engine_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    let runtime = runtime();
    let engine = WorkflowEngine::new(RetryPolicy::default(), Arc::new(SystemClock), 16);

    for steps in [1usize, 8] {
        let definition = WorkflowDefinition {
            name: format!("noop_{steps}"),
            steps: (0..steps)
                .map(|i| StepDefinition {
                    step_name: format!("step_{i}"),
                    handler: step_handler(move |_| async move {
                        let mut out = WorkflowContext::new();
                        out.insert(format!("step_{i}_done"), Value::Bool(true));
                        Ok(out)
                    }),
                    compensation_handler: None,
                    max_retries: 0,
                    timeout: Duration::from_secs(1),
                    required: true,
                })
                .collect(),
        };

        group.throughput(Throughput::Elements(steps as u64));
        group.bench_function(format!("noop_steps_{steps}"), |b| {
            b.to_async(&runtime).iter(|| async {
                engine
                    .execute(black_box(&definition), WorkflowContext::new())
                    .await
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_pure_checks,
    benchmark_lifecycle_cycle,
    benchmark_engine_overhead,
);
criterion_main!(benches);
