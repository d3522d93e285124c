//! # Netprov Core
//!
//! Domain types and collaborator contracts for subscriber network provisioning.
//!
//! This crate is pure: no I/O, no runtime. It defines
//!
//! - the address **lifecycle** state machine and its transition table,
//! - **address families** (IPv4 host addresses, IPv6 addresses and delegated prefixes),
//! - **reservations**, the uniform **lifecycle result**, and the error taxonomy,
//! - the **adapter** traits for the allocator, session controller, profile store
//!   and reservation store,
//! - the **workflow** (saga) data model, and
//! - the pure **circuit** (access location) validation.
//!
//! Execution lives in `netprov-runtime`.
//!
//! ## Example
//!
//! ```
//! use netprov_core::lifecycle::{LifecycleState, validate_transition};
//!
//! assert!(validate_transition(LifecycleState::Pending, LifecycleState::Allocated).is_ok());
//! assert!(validate_transition(LifecycleState::Revoked, LifecycleState::Active).is_err());
//! ```

pub mod adapters;
pub mod circuit;
pub mod error;
pub mod family;
pub mod lifecycle;
pub mod reservation;
pub mod workflow;

pub use adapters::{
    AckResult, ExternalAllocator, Profile, ProfileStore, ReservationStore, SessionController,
};
pub use error::{AllocationError, LifecycleError, ProfileError, SessionError, StoreError};
pub use family::{AddressFamily, Ipv4, Ipv6, Protocol};
pub use lifecycle::{InvalidTransitionError, LifecycleState, validate_transition};
pub use reservation::{
    AddressReservation, LifecycleResult, ReservationKey, SessionContext, SessionOutcome,
};

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Every timestamp written by the lifecycle service and every staleness
    /// cutoff computed by the reconciliation sweep comes from a `Clock`.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
