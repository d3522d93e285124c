//! Address reservations and the uniform result returned by lifecycle operations.

use crate::error::LifecycleError;
use crate::family::Protocol;
use crate::lifecycle::{InvalidTransitionError, LifecycleState, validate_transition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Primary key of the reservation table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationKey {
    /// Owning tenant
    pub tenant_id: String,
    /// Subscriber holding the address
    pub subscriber_id: String,
    /// Address family
    pub protocol: Protocol,
}

impl ReservationKey {
    /// Build a key.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        subscriber_id: impl Into<String>,
        protocol: Protocol,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            subscriber_id: subscriber_id.into(),
            protocol,
        }
    }
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.subscriber_id, self.protocol)
    }
}

/// One subscriber's address of one family.
///
/// The reservation references its subscriber only by id; profile data is
/// looked up on demand through the profile store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddressReservation {
    /// Owning tenant
    pub tenant_id: String,
    /// Subscriber holding the address
    pub subscriber_id: String,
    /// Address family
    pub protocol: Protocol,
    /// Pool the address came from (`None` for static assignments)
    pub pool_id: Option<String>,
    /// Canonical address or delegated prefix
    pub address: Option<String>,
    /// Current lifecycle state
    pub lifecycle_state: LifecycleState,
    /// Set on PENDING -> ALLOCATED
    pub allocated_at: Option<DateTime<Utc>>,
    /// Set on every move into ACTIVE
    pub activated_at: Option<DateTime<Utc>>,
    /// Set on ACTIVE -> SUSPENDED, cleared on reactivation
    pub suspended_at: Option<DateTime<Utc>>,
    /// Set on REVOKING -> REVOKED
    pub revoked_at: Option<DateTime<Utc>>,
    /// Time of the last transition
    pub updated_at: DateTime<Utc>,
    /// Adapter echo data (session update status, ack codes, ...)
    pub metadata: Map<String, Value>,
    /// Optimistic concurrency counter; 0 means never persisted
    pub version: u64,
}

impl AddressReservation {
    /// A fresh, unpersisted PENDING reservation.
    #[must_use]
    pub fn pending(key: &ReservationKey, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: key.tenant_id.clone(),
            subscriber_id: key.subscriber_id.clone(),
            protocol: key.protocol,
            pool_id: None,
            address: None,
            lifecycle_state: LifecycleState::Pending,
            allocated_at: None,
            activated_at: None,
            suspended_at: None,
            revoked_at: None,
            updated_at: now,
            metadata: Map::new(),
            version: 0,
        }
    }

    /// Key of this reservation.
    #[must_use]
    pub fn key(&self) -> ReservationKey {
        ReservationKey::new(&self.tenant_id, &self.subscriber_id, self.protocol)
    }

    /// Move to `target`, stamping the matching timestamp.
    ///
    /// Validates against the transition table first; on error nothing is modified.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransitionError`] if `target` is not reachable.
    pub fn transition_to(
        &mut self,
        target: LifecycleState,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransitionError> {
        validate_transition(self.lifecycle_state, target)?;

        match target {
            LifecycleState::Allocated => self.allocated_at = Some(now),
            LifecycleState::Active => {
                self.activated_at = Some(now);
                self.suspended_at = None;
            }
            LifecycleState::Suspended => self.suspended_at = Some(now),
            LifecycleState::Revoked => self.revoked_at = Some(now),
            LifecycleState::Pending | LifecycleState::Revoking | LifecycleState::Failed => {}
        }

        self.lifecycle_state = target;
        self.updated_at = now;
        Ok(())
    }

    /// String metadata value, if present.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Whether the address was assigned statically (allocator never involved).
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.metadata_str(meta::ASSIGNMENT) == Some(meta::ASSIGNMENT_STATIC)
    }
}

/// Metadata keys written by the lifecycle service.
pub mod meta {
    /// `"static"` or `"pool"`
    pub const ASSIGNMENT: &str = "assignment";
    /// Static assignment marker
    pub const ASSIGNMENT_STATIC: &str = "static";
    /// Pool assignment marker
    pub const ASSIGNMENT_POOL: &str = "pool";
    /// Outcome of the last session notification
    pub const SESSION_UPDATE: &str = "session_update";
    /// Ack/Nack code echoed by the session controller
    pub const SESSION_ACK_CODE: &str = "session_ack_code";
    /// Session error message
    pub const SESSION_ERROR: &str = "session_error";
    /// Suspension reason supplied by the caller
    pub const SUSPEND_REASON: &str = "suspend_reason";
    /// Whether revocation returns the address to its pool
    pub const RELEASE_TO_POOL: &str = "release_to_pool";
    /// `"released"`, `"failed"` or `"skipped"`
    pub const POOL_RELEASE: &str = "pool_release";
    /// Reason recorded on the move to FAILED
    pub const FAILURE_REASON: &str = "failure_reason";
}

/// Session a lifecycle operation should notify.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Opaque session reference understood by the session controller
    pub session_ref: String,
    /// Extra attributes merged into CoA requests
    pub attributes: BTreeMap<String, String>,
}

impl SessionContext {
    /// Context with no extra attributes.
    #[must_use]
    pub fn new(session_ref: impl Into<String>) -> Self {
        Self {
            session_ref: session_ref.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// What happened to the session side of a lifecycle operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// No session notification was asked for
    NotRequested,
    /// Session controller acknowledged
    Acked {
        /// Optional ack code
        code: Option<String>,
    },
    /// Session controller refused
    Nacked {
        /// Optional nack code
        code: Option<String>,
    },
    /// Transport error or timeout
    Failed {
        /// Error description
        reason: String,
    },
    /// Notification was not attempted
    Skipped {
        /// Why it was skipped
        reason: String,
    },
}

impl SessionOutcome {
    /// Value stored under `metadata.session_update`.
    #[must_use]
    pub const fn status_str(&self) -> &'static str {
        match self {
            Self::NotRequested => "not_requested",
            Self::Acked { .. } => "ok",
            Self::Nacked { .. } | Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }

    /// Whether the session side failed.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Nacked { .. } | Self::Failed { .. })
    }
}

/// Uniform result of every lifecycle operation.
///
/// `success` reflects the address-ownership transition, which is
/// authoritative. The session sub-operation is reported separately in
/// `session`; a session failure sets `error` while `success` stays `true`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LifecycleResult {
    /// Whether the address transition succeeded
    pub success: bool,
    /// State after the operation
    pub state: Option<LifecycleState>,
    /// Error description for a failed transition or session sub-operation
    pub error: Option<String>,
    /// Metadata snapshot of the reservation
    pub metadata: Map<String, Value>,
    /// Session sub-operation outcome
    pub session: SessionOutcome,
    /// Reservation snapshot after the operation
    pub reservation: Option<AddressReservation>,
}

impl LifecycleResult {
    /// Successful transition with the given session outcome.
    #[must_use]
    pub fn completed(reservation: AddressReservation, session: SessionOutcome) -> Self {
        Self {
            success: true,
            state: Some(reservation.lifecycle_state),
            error: None,
            metadata: reservation.metadata.clone(),
            session,
            reservation: Some(reservation),
        }
    }

    /// Attach a session sub-operation error without failing the result.
    #[must_use]
    pub fn with_session_error(mut self, error: &LifecycleError) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Failed result, for transports that flatten errors into the uniform shape.
    #[must_use]
    pub fn failure(error: &LifecycleError, state: Option<LifecycleState>) -> Self {
        Self {
            success: false,
            state,
            error: Some(error.to_string()),
            metadata: Map::new(),
            session: SessionOutcome::NotRequested,
            reservation: None,
        }
    }

    /// Address held after the operation.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.reservation.as_ref().and_then(|r| r.address.as_deref())
    }

    /// String metadata value, if present.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap_or_default()
    }

    #[test]
    fn test_transition_stamps_timestamps() {
        let key = ReservationKey::new("t1", "sub-1", Protocol::Ipv4);
        let mut reservation = AddressReservation::pending(&key, now());

        reservation.transition_to(LifecycleState::Allocated, now()).ok();
        reservation.transition_to(LifecycleState::Active, now()).ok();
        reservation.transition_to(LifecycleState::Suspended, now()).ok();
        assert!(reservation.suspended_at.is_some());

        reservation.transition_to(LifecycleState::Active, now()).ok();
        assert_eq!(reservation.lifecycle_state, LifecycleState::Active);
        assert!(reservation.suspended_at.is_none());
        assert!(reservation.allocated_at.is_some());
    }

    #[test]
    fn test_invalid_transition_leaves_record_untouched() {
        let key = ReservationKey::new("t1", "sub-1", Protocol::Ipv6);
        let mut reservation = AddressReservation::pending(&key, now());
        let before = reservation.clone();

        let result = reservation.transition_to(LifecycleState::Active, now());

        assert!(result.is_err());
        assert_eq!(reservation, before);
    }

    #[test]
    fn test_session_outcome_status() {
        assert_eq!(SessionOutcome::Acked { code: None }.status_str(), "ok");
        assert_eq!(SessionOutcome::Nacked { code: None }.status_str(), "failed");
        assert!(SessionOutcome::Failed { reason: "x".into() }.is_failure());
        assert!(!SessionOutcome::NotRequested.is_failure());
    }

    #[test]
    fn test_key_display() {
        let key = ReservationKey::new("t1", "sub-1", Protocol::Ipv6);
        assert_eq!(key.to_string(), "t1/sub-1/ipv6");
    }
}
