//! # Netprov Testing
//!
//! Testing utilities for subscriber network provisioning.
//!
//! This crate provides:
//! - Deterministic clocks
//! - Scriptable allocator, session controller and profile store mocks
//! - An in-memory reservation store with fault injection
//! - [`LifecycleHarness`]: both lifecycle services wired to the mocks
//! - proptest strategies for domain types
//!
//! ## Example
//!
//! ```ignore
//! use netprov_testing::LifecycleHarness;
//! use netprov_runtime::{AddressLifecycleService, AllocateRequest};
//!
//! #[tokio::test]
//! async fn test_allocate() {
//!     let harness = LifecycleHarness::new();
//!     let result = harness
//!         .ipv4
//!         .allocate(&AllocateRequest::new("sub-1").with_pool("v4"))
//!         .await
//!         .unwrap();
//!     assert_eq!(result.address(), Some("100.64.0.1"));
//! }
//! ```

use chrono::{DateTime, Utc};
use netprov_core::environment::Clock;
use std::sync::{Arc, Mutex, PoisonError};

/// Test harness wiring lifecycle services to mocks
pub mod harness;

/// Mock implementations of the external adapters
pub mod mocks;

/// Property-based testing strategies
pub mod properties;

/// In-memory reservation store
pub mod store;

pub use harness::LifecycleHarness;
pub use store::InMemoryReservationStore;

/// Fixed clock for deterministic tests
///
/// Always returns the same time, making tests reproducible.
///
/// # Example
///
/// ```
/// use netprov_testing::FixedClock;
/// use netprov_core::environment::Clock;
/// use chrono::Utc;
///
/// let clock = FixedClock::new(Utc::now());
/// assert_eq!(clock.now(), clock.now());
/// ```
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a new fixed clock with the given time
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    time: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Clock starting at `time`.
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(Mutex::new(time)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
        *time += by;
    }

    /// Set the clock.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 2025-01-01 00:00:00 UTC, the epoch of every test clock.
#[must_use]
pub fn test_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
}

/// Fixed clock at [`test_epoch`].
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(test_epoch())
}

/// Manual clock starting at [`test_epoch`].
#[must_use]
pub fn manual_clock() -> ManualClock {
    ManualClock::new(test_epoch())
}

/// Install a `tracing` subscriber writing to the test output.
///
/// Honours `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_manual_clock_advances_all_clones() {
        let clock = manual_clock();
        let other = clock.clone();

        clock.advance(chrono::Duration::minutes(16));

        assert_eq!(other.now() - test_epoch(), chrono::Duration::minutes(16));
    }
}
