//! HashMap-backed [`ReservationStore`] with the same compare-and-swap
//! semantics as the Postgres store, plus fault injection.

use futures::future::BoxFuture;
use netprov_core::adapters::ReservationStore;
use netprov_core::error::StoreError;
use netprov_core::lifecycle::LifecycleState;
use netprov_core::reservation::{AddressReservation, ReservationKey};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

#[derive(Debug, Default)]
struct Faults {
    conflicts: usize,
    failures: usize,
    saves: usize,
}

/// In-memory reservation table for fast, deterministic tests.
///
/// # Example
///
/// ```
/// use netprov_testing::InMemoryReservationStore;
///
/// let store = InMemoryReservationStore::new();
/// store.inject_conflicts(1); // next save loses the race once
/// assert!(store.is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryReservationStore {
    rows: Arc<RwLock<HashMap<ReservationKey, AddressReservation>>>,
    faults: Arc<Mutex<Faults>>,
}

impl InMemoryReservationStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a row in place, bypassing version checks. Version 0 becomes 1.
    pub fn insert(&self, mut reservation: AddressReservation) {
        if reservation.version == 0 {
            reservation.version = 1;
        }
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reservation.key(), reservation);
    }

    /// Row for `key`.
    #[must_use]
    pub fn get(&self, key: &ReservationKey) -> Option<AddressReservation> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Every row.
    #[must_use]
    pub fn rows(&self) -> Vec<AddressReservation> {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `n` saves fail with a version conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).conflicts = n;
    }

    /// Make the next `n` saves fail with a backend error.
    pub fn inject_failures(&self, n: usize) {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).failures = n;
    }

    /// Successful saves so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).saves
    }

    fn injected_fault(&self, key: &ReservationKey, expected: Option<u64>) -> Option<StoreError> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        if faults.failures > 0 {
            faults.failures -= 1;
            return Some(StoreError::Backend("injected failure".to_string()));
        }
        if faults.conflicts > 0 {
            faults.conflicts -= 1;
            return Some(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
                actual: expected.map(|v| v + 1),
            });
        }
        None
    }
}

impl ReservationStore for InMemoryReservationStore {
    fn load<'a>(
        &'a self,
        key: &'a ReservationKey,
    ) -> BoxFuture<'a, Result<Option<AddressReservation>, StoreError>> {
        Box::pin(async move { Ok(self.get(key)) })
    }

    fn save<'a>(
        &'a self,
        reservation: &'a AddressReservation,
        expected_version: Option<u64>,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let key = reservation.key();
            if let Some(fault) = self.injected_fault(&key, expected_version) {
                return Err(fault);
            }

            let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
            let actual = rows.get(&key).map(|r| r.version);
            if actual != expected_version {
                return Err(StoreError::VersionConflict {
                    key: key.to_string(),
                    expected: expected_version,
                    actual,
                });
            }

            let version = actual.unwrap_or(0) + 1;
            let mut stored = reservation.clone();
            stored.version = version;
            rows.insert(key, stored);
            drop(rows);

            self.faults.lock().unwrap_or_else(PoisonError::into_inner).saves += 1;
            Ok(version)
        })
    }

    fn find_stale<'a>(
        &'a self,
        tenant_id: &'a str,
        states: &'a [LifecycleState],
        updated_before: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<AddressReservation>, StoreError>> {
        Box::pin(async move {
            let mut stale: Vec<_> = self
                .rows
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .filter(|r| {
                    r.tenant_id == tenant_id
                        && states.contains(&r.lifecycle_state)
                        && r.updated_at < updated_before
                })
                .cloned()
                .collect();
            stale.sort_by_key(|r| r.updated_at);
            Ok(stale)
        })
    }

    fn purge_revoked<'a>(
        &'a self,
        tenant_id: &'a str,
        revoked_before: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
            let before = rows.len();
            rows.retain(|_, r| {
                !(r.tenant_id == tenant_id
                    && r.lifecycle_state == LifecycleState::Revoked
                    && r.revoked_at.is_some_and(|at| at < revoked_before))
            });
            Ok((before - rows.len()) as u64)
        })
    }
}
