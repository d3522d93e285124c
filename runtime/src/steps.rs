//! Built-in provisioning steps and workflows.
//!
//! Every step reads its inputs from the workflow context and returns only the
//! keys it adds. Per-family steps are written once against
//! [`AddressLifecycleService`] and registered twice, once per protocol; their
//! context keys are prefixed with the protocol name (`ipv4_address`,
//! `ipv6_pool_id`, ...).
//!
//! Context inputs:
//!
//! | key                                  | used by                      |
//! |--------------------------------------|------------------------------|
//! | `subscriber_id`                      | every step                   |
//! | `circuit_id`, `remote_id`            | `validate_circuit`           |
//! | `profile` (object)                   | `upsert_profile`             |
//! | `{family}_pool_id`, `requested_{family}` | `allocate_{family}`      |
//! | `session_ref`, `session_attributes`  | activate / suspend / revoke  |
//! | `send_session_update` (default true) | `activate_{family}`          |
//! | `suspend_reason`                     | `suspend_{family}`           |
//! | `release_to_pool` (default true)     | `revoke_{family}`            |
//!
//! IPv6 steps treat a subscriber without IPv6 input or reservation as
//! nothing to do.

use crate::config::ProvisioningConfig;
use crate::lifecycle::{AddressLifecycleService, AllocateRequest};
use crate::registry::StepRegistry;
use netprov_core::adapters::ProfileStore;
use netprov_core::circuit::{self, CircuitPolicy};
use netprov_core::error::LifecycleError;
use netprov_core::family::Protocol;
use netprov_core::lifecycle::LifecycleState;
use netprov_core::reservation::{LifecycleResult, SessionContext};
use netprov_core::workflow::{
    CompensationFn, StepError, StepHandlerFn, StepPlan, WorkflowContext, WorkflowError,
    WorkflowPlan, compensation_handler, optional_bool, optional_str, require_str, step_handler,
};
use serde_json::Value;
use std::sync::Arc;

/// Context key of the subscriber every step acts on.
pub const SUBSCRIBER_ID: &str = "subscriber_id";
/// Context key of the session reference for session notifications.
pub const SESSION_REF: &str = "session_ref";
/// Context key of extra session attributes (object of strings).
pub const SESSION_ATTRIBUTES: &str = "session_attributes";
/// Context key of the profile fields to upsert (object).
pub const PROFILE: &str = "profile";

/// Workflow: admit, store the profile, allocate and activate addresses.
pub const PROVISION_SUBSCRIBER: &str = "provision_subscriber";
/// Workflow: suspend every address of a subscriber.
pub const SUSPEND_SUBSCRIBER: &str = "suspend_subscriber";
/// Workflow: reactivate every address of a subscriber.
pub const RESUME_SUBSCRIBER: &str = "resume_subscriber";
/// Workflow: revoke every address and delete the profile.
pub const DECOMMISSION_SUBSCRIBER: &str = "decommission_subscriber";

/// Services the built-in steps call.
#[derive(Clone)]
pub struct StepDeps {
    /// Subscriber profiles
    pub profiles: Arc<dyn ProfileStore>,
    /// IPv4 lifecycle
    pub ipv4: Arc<dyn AddressLifecycleService>,
    /// IPv6 lifecycle
    pub ipv6: Arc<dyn AddressLifecycleService>,
}

impl std::fmt::Debug for StepDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDeps").finish_non_exhaustive()
    }
}

/// `{protocol}_{suffix}` context key.
#[must_use]
pub fn family_key(protocol: Protocol, suffix: &str) -> String {
    format!("{}_{suffix}", protocol.as_str())
}

fn requested_key(protocol: Protocol) -> String {
    format!("requested_{}", protocol.as_str())
}

/// Registry holding every built-in step, with engine defaults from `config`.
///
/// # Errors
///
/// Returns [`WorkflowError::AlreadyRegistered`] if two steps share a name.
pub fn provisioning_registry(
    deps: &StepDeps,
    config: &ProvisioningConfig,
) -> Result<StepRegistry, WorkflowError> {
    let mut registry = StepRegistry::new(config.engine.max_retries, config.engine.step_timeout());

    registry.register(
        "validate_circuit",
        validate_circuit(deps.profiles.clone(), config.circuit.policy),
        None,
    )?;
    registry.register(
        "upsert_profile",
        upsert_profile(deps.profiles.clone()),
        Some(undo_profile_creation(deps.profiles.clone())),
    )?;
    registry.register("delete_profile", delete_profile(deps.profiles.clone()), None)?;

    for service in [&deps.ipv4, &deps.ipv6] {
        let protocol = service.protocol();
        registry.register(
            format!("allocate_{protocol}"),
            allocate(service.clone()),
            Some(undo_allocate(service.clone())),
        )?;
        registry.register(format!("activate_{protocol}"), activate(service.clone()), None)?;
        registry.register(
            format!("suspend_{protocol}"),
            suspend(service.clone()),
            Some(undo_suspend(service.clone())),
        )?;
        registry.register(
            format!("reactivate_{protocol}"),
            reactivate(service.clone()),
            Some(undo_reactivate(service.clone())),
        )?;
        registry.register(format!("revoke_{protocol}"), revoke(service.clone()), None)?;
    }

    Ok(registry)
}

/// The four workflows registered at startup.
#[must_use]
pub fn builtin_workflows() -> Vec<WorkflowPlan> {
    vec![
        WorkflowPlan::new(PROVISION_SUBSCRIBER)
            .step(StepPlan::required("validate_circuit").with_max_retries(0))
            .step(StepPlan::required("upsert_profile"))
            .step(StepPlan::required("allocate_ipv4"))
            .step(StepPlan::optional("allocate_ipv6"))
            .step(StepPlan::required("activate_ipv4"))
            .step(StepPlan::optional("activate_ipv6")),
        WorkflowPlan::new(SUSPEND_SUBSCRIBER)
            .step(StepPlan::required("suspend_ipv4"))
            .step(StepPlan::optional("suspend_ipv6")),
        WorkflowPlan::new(RESUME_SUBSCRIBER)
            .step(StepPlan::required("reactivate_ipv4"))
            .step(StepPlan::optional("reactivate_ipv6")),
        WorkflowPlan::new(DECOMMISSION_SUBSCRIBER)
            .step(StepPlan::required("revoke_ipv4"))
            .step(StepPlan::optional("revoke_ipv6"))
            .step(StepPlan::optional("delete_profile")),
    ]
}

fn session_context(ctx: &WorkflowContext) -> Option<SessionContext> {
    let session_ref = optional_str(ctx, SESSION_REF)?;
    let mut session = SessionContext::new(session_ref);
    if let Some(Value::Object(attributes)) = ctx.get(SESSION_ATTRIBUTES) {
        for (key, value) in attributes {
            if let Some(value) = value.as_str() {
                session = session.with_attribute(key.clone(), value);
            }
        }
    }
    Some(session)
}

/// Record the lifecycle result under `{protocol}_*` keys.
fn record_result(out: &mut WorkflowContext, protocol: Protocol, result: &LifecycleResult) {
    if let Some(state) = result.state {
        out.insert(family_key(protocol, "state"), Value::from(state.as_str()));
    }
    if let Some(address) = result.address() {
        out.insert(family_key(protocol, "address"), Value::from(address));
    }
    out.insert(
        family_key(protocol, "session_update"),
        Value::from(result.session.status_str()),
    );
    if let Some(error) = &result.error {
        out.insert(family_key(protocol, "session_error"), Value::from(error.as_str()));
    }
}

fn skipped(protocol: Protocol, reason: &str) -> WorkflowContext {
    tracing::debug!(%protocol, reason, "Step has nothing to do");
    let mut out = WorkflowContext::new();
    out.insert(family_key(protocol, "skipped"), Value::from(reason));
    out
}

/// IPv6 is optional for a subscriber; a missing reservation is not an error there.
fn tolerates_missing(protocol: Protocol, error: &LifecycleError) -> bool {
    protocol == Protocol::Ipv6 && matches!(error, LifecycleError::NotFound { .. })
}

fn validate_circuit(profiles: Arc<dyn ProfileStore>, policy: CircuitPolicy) -> StepHandlerFn {
    step_handler(move |ctx| {
        let profiles = profiles.clone();
        async move {
            let subscriber_id = require_str(&ctx, SUBSCRIBER_ID)?;
            let profile = profiles
                .get(subscriber_id)
                .await
                .map_err(|e| StepError::Failed(e.to_string()))?
                .filter(|p| !p.deleted);

            let verdict = circuit::validate(
                profile.as_ref(),
                optional_str(&ctx, "circuit_id"),
                optional_str(&ctx, "remote_id"),
                policy,
            );

            if !verdict.is_accepted() {
                tracing::warn!(subscriber_id, result = %verdict.result, fields = ?verdict.fields, "Access location rejected");
                return Err(StepError::Rejected(format!(
                    "access location {} ({})",
                    verdict.result,
                    verdict.fields.join(", ")
                )));
            }

            let mut out = WorkflowContext::new();
            out.insert("circuit_validation".into(), Value::from(verdict.result.to_string()));
            out.insert(
                "circuit_action".into(),
                serde_json::to_value(verdict.action).unwrap_or(Value::Null),
            );
            Ok(out)
        }
    })
}

fn upsert_profile(profiles: Arc<dyn ProfileStore>) -> StepHandlerFn {
    step_handler(move |ctx| {
        let profiles = profiles.clone();
        async move {
            let subscriber_id = require_str(&ctx, SUBSCRIBER_ID)?;
            let fields = match ctx.get(PROFILE) {
                Some(Value::Object(fields)) => fields.clone(),
                None | Some(Value::Null) => serde_json::Map::new(),
                Some(_) => {
                    return Err(StepError::InvalidInput {
                        key: PROFILE.to_string(),
                        reason: "expected an object".to_string(),
                    });
                }
            };

            let existed = profiles
                .get(subscriber_id)
                .await
                .map_err(|e| StepError::Failed(e.to_string()))?
                .is_some_and(|p| !p.deleted);
            profiles
                .upsert(subscriber_id, fields)
                .await
                .map_err(|e| StepError::Failed(e.to_string()))?;

            let mut out = WorkflowContext::new();
            out.insert("profile_created".into(), Value::Bool(!existed));
            Ok(out)
        }
    })
}

fn undo_profile_creation(profiles: Arc<dyn ProfileStore>) -> CompensationFn {
    compensation_handler(move |ctx| {
        let profiles = profiles.clone();
        async move {
            if !optional_bool(&ctx, "profile_created", false) {
                return Ok(());
            }
            let subscriber_id = require_str(&ctx, SUBSCRIBER_ID)?;
            profiles
                .soft_delete(subscriber_id)
                .await
                .map(|_| ())
                .map_err(|e| StepError::Failed(e.to_string()))
        }
    })
}

fn delete_profile(profiles: Arc<dyn ProfileStore>) -> StepHandlerFn {
    step_handler(move |ctx| {
        let profiles = profiles.clone();
        async move {
            let subscriber_id = require_str(&ctx, SUBSCRIBER_ID)?;
            let deleted = profiles
                .soft_delete(subscriber_id)
                .await
                .map_err(|e| StepError::Failed(e.to_string()))?;
            let mut out = WorkflowContext::new();
            out.insert("profile_deleted".into(), Value::Bool(deleted));
            Ok(out)
        }
    })
}

fn allocate(service: Arc<dyn AddressLifecycleService>) -> StepHandlerFn {
    step_handler(move |ctx| {
        let service = service.clone();
        async move {
            let protocol = service.protocol();
            let subscriber_id = require_str(&ctx, SUBSCRIBER_ID)?;
            let pool_id = optional_str(&ctx, &family_key(protocol, "pool_id"));
            let requested = optional_str(&ctx, &requested_key(protocol));

            if protocol == Protocol::Ipv6 && pool_id.is_none() && requested.is_none() {
                return Ok(skipped(protocol, "no pool or requested address"));
            }

            let mut request = AllocateRequest::new(subscriber_id);
            request.pool_id = pool_id.map(str::to_owned);
            request.requested_address = requested.map(str::to_owned);

            let result = service.allocate(&request).await?;

            let mut out = WorkflowContext::new();
            record_result(&mut out, protocol, &result);
            out.insert(family_key(protocol, "allocated"), Value::Bool(true));
            Ok(out)
        }
    })
}

/// Revoke what `allocate_{family}` allocated in this run; nothing otherwise.
fn undo_allocate(service: Arc<dyn AddressLifecycleService>) -> CompensationFn {
    compensation_handler(move |ctx| {
        let service = service.clone();
        async move {
            let protocol = service.protocol();
            if !optional_bool(&ctx, &family_key(protocol, "allocated"), false) {
                return Ok(());
            }
            let subscriber_id = require_str(&ctx, SUBSCRIBER_ID)?;
            let session = session_context(&ctx);
            match service.revoke(subscriber_id, session.as_ref(), true).await {
                Ok(_) | Err(LifecycleError::NotFound { .. }) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    })
}

fn activate(service: Arc<dyn AddressLifecycleService>) -> StepHandlerFn {
    step_handler(move |ctx| {
        let service = service.clone();
        async move {
            let protocol = service.protocol();
            let subscriber_id = require_str(&ctx, SUBSCRIBER_ID)?;
            if optional_str(&ctx, &family_key(protocol, "address")).is_none() {
                return Ok(skipped(protocol, "no address allocated"));
            }

            let session = session_context(&ctx);
            let send_update = optional_bool(&ctx, "send_session_update", true);
            let result = service
                .activate(subscriber_id, session.as_ref(), send_update)
                .await?;

            let mut out = WorkflowContext::new();
            record_result(&mut out, protocol, &result);
            Ok(out)
        }
    })
}

fn suspend(service: Arc<dyn AddressLifecycleService>) -> StepHandlerFn {
    step_handler(move |ctx| {
        let service = service.clone();
        async move {
            let protocol = service.protocol();
            let subscriber_id = require_str(&ctx, SUBSCRIBER_ID)?;
            let session = session_context(&ctx);

            let before = service.get_state(subscriber_id).await?;
            let Some(before) = before else {
                if protocol == Protocol::Ipv6 {
                    return Ok(skipped(protocol, "no reservation"));
                }
                return Err(LifecycleError::NotFound {
                    subscriber_id: subscriber_id.to_string(),
                    protocol,
                }
                .into());
            };

            let result = service
                .suspend(subscriber_id, session.as_ref(), optional_str(&ctx, "suspend_reason"))
                .await?;

            let mut out = WorkflowContext::new();
            record_result(&mut out, protocol, &result);
            out.insert(
                family_key(protocol, "suspended"),
                Value::Bool(before.lifecycle_state != LifecycleState::Suspended),
            );
            Ok(out)
        }
    })
}

fn undo_suspend(service: Arc<dyn AddressLifecycleService>) -> CompensationFn {
    compensation_handler(move |ctx| {
        let service = service.clone();
        async move {
            if !optional_bool(&ctx, &family_key(service.protocol(), "suspended"), false) {
                return Ok(());
            }
            let subscriber_id = require_str(&ctx, SUBSCRIBER_ID)?;
            let session = session_context(&ctx);
            service.reactivate(subscriber_id, session.as_ref()).await?;
            Ok(())
        }
    })
}

fn reactivate(service: Arc<dyn AddressLifecycleService>) -> StepHandlerFn {
    step_handler(move |ctx| {
        let service = service.clone();
        async move {
            let protocol = service.protocol();
            let subscriber_id = require_str(&ctx, SUBSCRIBER_ID)?;
            let session = session_context(&ctx);

            match service.reactivate(subscriber_id, session.as_ref()).await {
                Ok(result) => {
                    let mut out = WorkflowContext::new();
                    record_result(&mut out, protocol, &result);
                    out.insert(family_key(protocol, "reactivated"), Value::Bool(true));
                    Ok(out)
                }
                Err(e) if tolerates_missing(protocol, &e) => Ok(skipped(protocol, "no reservation")),
                Err(e) => Err(e.into()),
            }
        }
    })
}

fn undo_reactivate(service: Arc<dyn AddressLifecycleService>) -> CompensationFn {
    compensation_handler(move |ctx| {
        let service = service.clone();
        async move {
            if !optional_bool(&ctx, &family_key(service.protocol(), "reactivated"), false) {
                return Ok(());
            }
            let subscriber_id = require_str(&ctx, SUBSCRIBER_ID)?;
            let session = session_context(&ctx);
            service
                .suspend(subscriber_id, session.as_ref(), Some("resume rolled back"))
                .await?;
            Ok(())
        }
    })
}

fn revoke(service: Arc<dyn AddressLifecycleService>) -> StepHandlerFn {
    step_handler(move |ctx| {
        let service = service.clone();
        async move {
            let protocol = service.protocol();
            let subscriber_id = require_str(&ctx, SUBSCRIBER_ID)?;
            let session = session_context(&ctx);
            let release_to_pool = optional_bool(&ctx, "release_to_pool", true);

            match service
                .revoke(subscriber_id, session.as_ref(), release_to_pool)
                .await
            {
                Ok(result) => {
                    let mut out = WorkflowContext::new();
                    record_result(&mut out, protocol, &result);
                    Ok(out)
                }
                Err(e) if tolerates_missing(protocol, &e) => Ok(skipped(protocol, "no reservation")),
                Err(e) => Err(e.into()),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_workflows_are_named_and_unique() {
        let plans = builtin_workflows();
        let names: HashSet<_> = plans.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            HashSet::from([
                PROVISION_SUBSCRIBER,
                SUSPEND_SUBSCRIBER,
                RESUME_SUBSCRIBER,
                DECOMMISSION_SUBSCRIBER
            ])
        );
        for plan in &plans {
            assert!(!plan.steps.is_empty());
        }
    }

    #[test]
    fn test_ipv6_steps_are_optional() {
        for plan in builtin_workflows() {
            for step in plan.steps.iter().filter(|s| s.name.ends_with("_ipv6")) {
                assert!(!step.required, "{} in {} should be optional", step.name, plan.name);
            }
        }
    }

    #[test]
    fn test_session_context_from_workflow_context() {
        let mut ctx = WorkflowContext::new();
        assert!(session_context(&ctx).is_none());

        ctx.insert(SESSION_REF.into(), Value::from("acct-7"));
        ctx.insert(
            SESSION_ATTRIBUTES.into(),
            serde_json::json!({ "Filter-Id": "gold", "ignored": 3 }),
        );
        let session = session_context(&ctx);
        let session = session.as_ref();
        assert_eq!(session.map(|s| s.session_ref.as_str()), Some("acct-7"));
        assert_eq!(session.map(|s| s.attributes.len()), Some(1));
    }

    #[test]
    fn test_family_keys() {
        assert_eq!(family_key(Protocol::Ipv4, "address"), "ipv4_address");
        assert_eq!(requested_key(Protocol::Ipv6), "requested_ipv6");
    }
}
