//! Contracts for the external systems the provisioning core consumes.
//!
//! These traits return boxed futures instead of using `async fn` so they stay
//! dyn-compatible: the lifecycle services, step handlers and the
//! reconciliation sweep all hold them as `Arc<dyn Trait>`.

use crate::error::{AllocationError, ProfileError, SessionError, StoreError};
use crate::lifecycle::LifecycleState;
use crate::reservation::{AddressReservation, ReservationKey};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Address pool manager (IPAM).
///
/// Serialising access to a pool is the allocator's job; the lifecycle service
/// treats every exhaustion uniformly as [`AllocationError`].
pub trait ExternalAllocator: Send + Sync {
    /// Reserve an address from `pool_id`, optionally a specific one.
    fn reserve<'a>(
        &'a self,
        pool_id: &'a str,
        requested: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String, AllocationError>>;

    /// Return an address to its pool.
    fn release<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<(), AllocationError>>;
}

/// Answer from the session controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckResult {
    /// Request applied
    Ack {
        /// Optional ack code
        code: Option<String>,
    },
    /// Request refused
    Nack {
        /// Optional nack code
        code: Option<String>,
        /// Optional human-readable reason
        reason: Option<String>,
    },
}

impl AckResult {
    /// Plain ack.
    #[must_use]
    pub const fn ack() -> Self {
        Self::Ack { code: None }
    }

    /// Nack with a reason.
    #[must_use]
    pub fn nack(reason: impl Into<String>) -> Self {
        Self::Nack {
            code: None,
            reason: Some(reason.into()),
        }
    }

    /// Whether the controller accepted the request.
    #[must_use]
    pub const fn is_ack(&self) -> bool {
        matches!(self, Self::Ack { .. })
    }
}

/// AAA session control (RADIUS CoA / Disconnect-Message).
///
/// Advisory: the lifecycle service never lets a failure here revert an
/// address-ownership transition.
pub trait SessionController: Send + Sync {
    /// Change attributes of a live session.
    fn send_coa<'a>(
        &'a self,
        session_ref: &'a str,
        attributes: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<AckResult, SessionError>>;

    /// Tear a live session down.
    fn send_disconnect<'a>(
        &'a self,
        session_ref: &'a str,
    ) -> BoxFuture<'a, Result<AckResult, SessionError>>;
}

/// Subscriber configuration record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Subscriber id
    pub subscriber_id: String,
    /// Free-form attributes; `circuit_id` / `remote_id` carry the access binding
    pub attributes: Map<String, Value>,
    /// Soft-deleted flag
    pub deleted: bool,
    /// First write
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    /// Attribute key for the bound relay-agent circuit id.
    pub const CIRCUIT_ID: &'static str = "circuit_id";
    /// Attribute key for the bound relay-agent remote id.
    pub const REMOTE_ID: &'static str = "remote_id";

    /// Bound circuit id, if any.
    #[must_use]
    pub fn circuit_id(&self) -> Option<&str> {
        self.attribute_str(Self::CIRCUIT_ID)
    }

    /// Bound remote id, if any.
    #[must_use]
    pub fn remote_id(&self) -> Option<&str> {
        self.attribute_str(Self::REMOTE_ID)
    }

    /// String attribute, ignoring empty values.
    #[must_use]
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }
}

/// Subscriber configuration persistence.
pub trait ProfileStore: Send + Sync {
    /// Live (not soft-deleted) profile for the subscriber.
    fn get<'a>(&'a self, subscriber_id: &'a str) -> BoxFuture<'a, Result<Option<Profile>, ProfileError>>;

    /// Merge `fields` into the profile, creating or undeleting it.
    fn upsert<'a>(
        &'a self,
        subscriber_id: &'a str,
        fields: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Profile, ProfileError>>;

    /// Soft-delete; `false` when there was nothing live to delete.
    fn soft_delete<'a>(&'a self, subscriber_id: &'a str) -> BoxFuture<'a, Result<bool, ProfileError>>;
}

/// Reservation table: one row per `(tenant_id, subscriber_id, protocol)`.
pub trait ReservationStore: Send + Sync {
    /// Load the row for `key`.
    fn load<'a>(
        &'a self,
        key: &'a ReservationKey,
    ) -> BoxFuture<'a, Result<Option<AddressReservation>, StoreError>>;

    /// Compare-and-swap write.
    ///
    /// With `expected_version = None` the row must not exist (insert); with
    /// `Some(v)` the stored version must equal `v`. Returns the new version.
    /// A mismatch is [`StoreError::VersionConflict`].
    fn save<'a>(
        &'a self,
        reservation: &'a AddressReservation,
        expected_version: Option<u64>,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    /// Rows of `tenant_id` in one of `states` whose last transition is older
    /// than `updated_before`.
    fn find_stale<'a>(
        &'a self,
        tenant_id: &'a str,
        states: &'a [LifecycleState],
        updated_before: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<AddressReservation>, StoreError>>;

    /// Hard-delete REVOKED rows revoked before `revoked_before`. Returns the count.
    fn purge_revoked<'a>(
        &'a self,
        tenant_id: &'a str,
        revoked_before: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;
}
