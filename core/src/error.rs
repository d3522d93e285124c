//! Error taxonomy shared by the lifecycle service, stores and adapters.

use crate::family::Protocol;
use crate::lifecycle::InvalidTransitionError;
use std::time::Duration;
use thiserror::Error;

/// Address could not be obtained from (or returned to) a pool.
///
/// Recoverable: callers may retry later or pick another pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    /// No free addresses left in the pool.
    #[error("pool {pool_id} is exhausted")]
    PoolExhausted {
        /// Pool that ran dry
        pool_id: String,
    },

    /// Requested address is already assigned elsewhere.
    #[error("address {address} conflicts with an existing assignment")]
    Conflict {
        /// Contested address
        address: String,
    },

    /// The allocator does not know the pool.
    #[error("unknown pool {pool_id}")]
    UnknownPool {
        /// Pool that was asked for
        pool_id: String,
    },

    /// Neither a pool nor a static address was supplied.
    #[error("no pool given and no requested address")]
    MissingPool,

    /// Address is malformed or not assignable for the family.
    #[error("invalid {protocol} address {address}: {reason}")]
    InvalidAddress {
        /// Family the address was validated against
        protocol: Protocol,
        /// Offending input
        address: String,
        /// Why it was rejected
        reason: String,
    },

    /// Allocator did not answer in time.
    #[error("allocator timed out after {0:?}")]
    Timeout(Duration),

    /// Any other allocator failure.
    #[error("allocator error: {0}")]
    Backend(String),
}

/// Reservation persistence failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency conflict: the row moved under us.
    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    VersionConflict {
        /// Reservation key that conflicted
        key: String,
        /// Version the writer expected (`None` = row must not exist)
        expected: Option<u64>,
        /// Version actually stored (`None` = row missing)
        actual: Option<u64>,
    },

    /// Store did not answer in time.
    #[error("store timed out after {0:?}")]
    Timeout(Duration),

    /// Database connection or query failure.
    #[error("store backend error: {0}")]
    Backend(String),

    /// Stored data could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Session-control (AAA) failure. Advisory to the lifecycle service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Transport or protocol failure talking to the session controller.
    #[error("session controller error: {0}")]
    Transport(String),

    /// No answer within the adapter timeout.
    #[error("session controller timed out after {0:?}")]
    Timeout(Duration),

    /// Calls are being short-circuited after repeated failures.
    #[error("session controller circuit is open")]
    CircuitOpen,
}

/// Profile store failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("profile store error: {0}")]
pub struct ProfileError(pub String);

/// Errors surfaced by `AddressLifecycleService` operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Transition outside the allowed table; the record is unchanged.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransitionError),

    /// Pool exhausted, conflict or invalid address.
    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    /// Adapter failure during activation (reported, never reverts the transition).
    #[error("activation: {0}")]
    Activation(String),

    /// Adapter failure during suspension or reactivation.
    #[error("suspension: {0}")]
    Suspension(String),

    /// Adapter failure during revocation.
    #[error("revocation: {0}")]
    Revocation(String),

    /// Lost the optimistic concurrency race twice in a row.
    #[error("concurrent modification of {protocol} reservation for {subscriber_id}")]
    ConcurrentModification {
        /// Subscriber whose row was contended
        subscriber_id: String,
        /// Family of the contended row
        protocol: Protocol,
    },

    /// No reservation exists for the subscriber.
    #[error("no {protocol} reservation for {subscriber_id}")]
    NotFound {
        /// Subscriber that was looked up
        subscriber_id: String,
        /// Family that was looked up
        protocol: Protocol,
    },

    /// Persistence failure; the transition did not happen.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl LifecycleError {
    /// Short machine-readable name, used as a metrics label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Allocation(_) => "allocation",
            Self::Activation(_) => "activation",
            Self::Suspension(_) => "suspension",
            Self::Revocation(_) => "revocation",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::NotFound { .. } => "not_found",
            Self::Store(_) => "store",
        }
    }
}
