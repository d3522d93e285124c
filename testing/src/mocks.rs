//! Scriptable mocks for the external adapters.
//!
//! Every mock counts its calls so tests can assert on side effects
//! (e.g. "exactly one release").

#![allow(clippy::missing_panics_doc)] // Poisoned locks are recovered, never unwrapped

use chrono::Utc;
use futures::future::BoxFuture;
use netprov_core::adapters::{
    AckResult, ExternalAllocator, Profile, ProfileStore, SessionController,
};
use netprov_core::error::{AllocationError, ProfileError, SessionError};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct AllocatorState {
    free: VecDeque<String>,
    reserved: Vec<String>,
    released: Vec<String>,
    reserve_calls: usize,
    release_failures: usize,
}

/// Allocator handing out a fixed list of addresses in order.
///
/// Any pool id is accepted. Releases are recorded, not returned to the list.
#[derive(Clone, Debug, Default)]
pub struct MockAllocator {
    state: Arc<Mutex<AllocatorState>>,
}

impl MockAllocator {
    /// Allocator serving exactly `addresses`.
    #[must_use]
    pub fn with_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let state = AllocatorState {
            free: addresses.into_iter().map(Into::into).collect(),
            ..AllocatorState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// `100.64.0.1`, `100.64.0.2`, ... (`count` at most 254).
    #[must_use]
    pub fn ipv4(count: u8) -> Self {
        Self::with_addresses((1..=count.min(254)).map(|i| format!("100.64.0.{i}")))
    }

    /// `2001:db8:1::/56`, `2001:db8:2::/56`, ...
    #[must_use]
    pub fn ipv6(count: u16) -> Self {
        Self::with_addresses((1..=count).map(|i| format!("2001:db8:{i:x}::/56")))
    }

    /// Allocator whose pool is already empty.
    #[must_use]
    pub fn exhausted() -> Self {
        Self::default()
    }

    /// Make the next `n` releases fail.
    pub fn fail_releases(&self, n: usize) {
        self.lock().release_failures = n;
    }

    /// Calls to `reserve`, successful or not.
    #[must_use]
    pub fn reserve_count(&self) -> usize {
        self.lock().reserve_calls
    }

    /// Successful releases.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.lock().released.len()
    }

    /// Addresses released so far, in order.
    #[must_use]
    pub fn released(&self) -> Vec<String> {
        self.lock().released.clone()
    }

    /// Addresses handed out so far, in order.
    #[must_use]
    pub fn reserved(&self) -> Vec<String> {
        self.lock().reserved.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExternalAllocator for MockAllocator {
    fn reserve<'a>(
        &'a self,
        pool_id: &'a str,
        requested: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String, AllocationError>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.reserve_calls += 1;

            let address = match requested {
                Some(address) => {
                    let position = state.free.iter().position(|a| a == address).ok_or_else(|| {
                        AllocationError::Conflict {
                            address: address.to_string(),
                        }
                    })?;
                    state.free.remove(position)
                }
                None => state.free.pop_front(),
            }
            .ok_or_else(|| AllocationError::PoolExhausted {
                pool_id: pool_id.to_string(),
            })?;

            state.reserved.push(address.clone());
            Ok(address)
        })
    }

    fn release<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<(), AllocationError>> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.release_failures > 0 {
                state.release_failures -= 1;
                return Err(AllocationError::Backend("injected release failure".to_string()));
            }
            state.released.push(address.to_string());
            Ok(())
        })
    }
}

/// How the mock session controller answers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionScript {
    /// Ack every request
    Ack,
    /// Nack every request with this reason
    Nack(String),
    /// Fail every request with a transport error
    Error(String),
    /// Answer after this delay (then ack)
    Delay(Duration),
}

#[derive(Debug)]
struct SessionState {
    script: SessionScript,
    coa: Vec<(String, BTreeMap<String, String>)>,
    disconnects: Vec<String>,
}

/// Session controller that answers according to a [`SessionScript`].
#[derive(Clone, Debug)]
pub struct MockSessionController {
    state: Arc<Mutex<SessionState>>,
}

impl Default for MockSessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSessionController {
    /// Controller that acks everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState {
                script: SessionScript::Ack,
                coa: Vec::new(),
                disconnects: Vec::new(),
            })),
        }
    }

    /// Change how later requests are answered.
    pub fn script(&self, script: SessionScript) {
        self.lock().script = script;
    }

    /// CoA requests received.
    #[must_use]
    pub fn coa_count(&self) -> usize {
        self.lock().coa.len()
    }

    /// Attributes of the most recent CoA.
    #[must_use]
    pub fn last_coa(&self) -> Option<(String, BTreeMap<String, String>)> {
        self.lock().coa.last().cloned()
    }

    /// Disconnect requests received.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn answer(&self) -> Result<AckResult, SessionError> {
        let script = self.lock().script.clone();
        match script {
            SessionScript::Ack => Ok(AckResult::ack()),
            SessionScript::Nack(reason) => Ok(AckResult::Nack {
                code: Some("nak".to_string()),
                reason: Some(reason),
            }),
            SessionScript::Error(reason) => Err(SessionError::Transport(reason)),
            SessionScript::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(AckResult::ack())
            }
        }
    }
}

impl SessionController for MockSessionController {
    fn send_coa<'a>(
        &'a self,
        session_ref: &'a str,
        attributes: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<AckResult, SessionError>> {
        Box::pin(async move {
            self.lock()
                .coa
                .push((session_ref.to_string(), attributes.clone()));
            self.answer().await
        })
    }

    fn send_disconnect<'a>(
        &'a self,
        session_ref: &'a str,
    ) -> BoxFuture<'a, Result<AckResult, SessionError>> {
        Box::pin(async move {
            self.lock().disconnects.push(session_ref.to_string());
            self.answer().await
        })
    }
}

/// HashMap-backed profile store.
#[derive(Clone, Debug, Default)]
pub struct InMemoryProfileStore {
    profiles: Arc<Mutex<HashMap<String, Profile>>>,
}

impl InMemoryProfileStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a live profile with the given access binding.
    pub fn bind(&self, subscriber_id: &str, circuit_id: Option<&str>, remote_id: Option<&str>) {
        let mut attributes = Map::new();
        if let Some(circuit_id) = circuit_id {
            attributes.insert(Profile::CIRCUIT_ID.to_string(), Value::from(circuit_id));
        }
        if let Some(remote_id) = remote_id {
            attributes.insert(Profile::REMOTE_ID.to_string(), Value::from(remote_id));
        }
        let now = Utc::now();
        self.lock().insert(
            subscriber_id.to_string(),
            Profile {
                subscriber_id: subscriber_id.to_string(),
                attributes,
                deleted: false,
                created_at: now,
                updated_at: now,
            },
        );
    }

    /// Profile, including soft-deleted ones.
    #[must_use]
    pub fn profile(&self, subscriber_id: &str) -> Option<Profile> {
        self.lock().get(subscriber_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Profile>> {
        self.profiles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ProfileStore for InMemoryProfileStore {
    fn get<'a>(&'a self, subscriber_id: &'a str) -> BoxFuture<'a, Result<Option<Profile>, ProfileError>> {
        Box::pin(async move { Ok(self.profile(subscriber_id)) })
    }

    fn upsert<'a>(
        &'a self,
        subscriber_id: &'a str,
        fields: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Profile, ProfileError>> {
        Box::pin(async move {
            let now = Utc::now();
            let mut profiles = self.lock();
            let profile = profiles
                .entry(subscriber_id.to_string())
                .or_insert_with(|| Profile {
                    subscriber_id: subscriber_id.to_string(),
                    attributes: Map::new(),
                    deleted: false,
                    created_at: now,
                    updated_at: now,
                });
            profile.attributes.extend(fields);
            profile.deleted = false;
            profile.updated_at = now;
            Ok(profile.clone())
        })
    }

    fn soft_delete<'a>(&'a self, subscriber_id: &'a str) -> BoxFuture<'a, Result<bool, ProfileError>> {
        Box::pin(async move {
            let mut profiles = self.lock();
            match profiles.get_mut(subscriber_id) {
                Some(profile) if !profile.deleted => {
                    profile.deleted = true;
                    profile.updated_at = Utc::now();
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocator_hands_out_in_order_then_exhausts() {
        let allocator = MockAllocator::ipv4(2);

        assert_eq!(allocator.reserve("p", None).await.unwrap(), "100.64.0.1");
        assert_eq!(allocator.reserve("p", None).await.unwrap(), "100.64.0.2");
        assert!(matches!(
            allocator.reserve("p", None).await,
            Err(AllocationError::PoolExhausted { .. })
        ));
        assert_eq!(allocator.reserve_count(), 3);
    }

    #[tokio::test]
    async fn test_release_failures_are_injected() {
        let allocator = MockAllocator::ipv4(1);
        allocator.fail_releases(1);

        assert!(allocator.release("100.64.0.1").await.is_err());
        assert!(allocator.release("100.64.0.1").await.is_ok());
        assert_eq!(allocator.release_count(), 1);
    }

    #[tokio::test]
    async fn test_session_controller_follows_script() {
        let controller = MockSessionController::new();
        assert!(controller.send_disconnect("s").await.unwrap().is_ack());

        controller.script(SessionScript::Nack("no".into()));
        assert!(!controller.send_coa("s", &BTreeMap::new()).await.unwrap().is_ack());

        controller.script(SessionScript::Error("down".into()));
        assert!(controller.send_disconnect("s").await.is_err());

        assert_eq!(controller.coa_count(), 1);
        assert_eq!(controller.disconnect_count(), 2);
    }

    #[tokio::test]
    async fn test_profile_soft_delete_and_undelete() {
        let store = InMemoryProfileStore::new();
        store.upsert("sub-1", Map::new()).await.unwrap();

        assert!(store.soft_delete("sub-1").await.unwrap());
        assert!(!store.soft_delete("sub-1").await.unwrap());
        assert!(store.get("sub-1").await.unwrap().unwrap().deleted);

        store.upsert("sub-1", Map::new()).await.unwrap();
        assert!(!store.profile("sub-1").unwrap().deleted);
    }
}
