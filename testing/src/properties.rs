//! proptest strategies for domain types.

use netprov_core::family::Protocol;
use netprov_core::lifecycle::LifecycleState;
use proptest::prelude::*;
use std::net::Ipv4Addr;

/// Every lifecycle state.
pub const ALL_STATES: [LifecycleState; 7] = [
    LifecycleState::Pending,
    LifecycleState::Allocated,
    LifecycleState::Active,
    LifecycleState::Suspended,
    LifecycleState::Revoking,
    LifecycleState::Revoked,
    LifecycleState::Failed,
];

/// Any lifecycle state.
pub fn lifecycle_state() -> impl Strategy<Value = LifecycleState> {
    proptest::sample::select(ALL_STATES.to_vec())
}

/// Any (from, to) pair, allowed or not.
pub fn state_pair() -> impl Strategy<Value = (LifecycleState, LifecycleState)> {
    (lifecycle_state(), lifecycle_state())
}

/// Any protocol.
pub fn protocol() -> impl Strategy<Value = Protocol> {
    prop_oneof![Just(Protocol::Ipv4), Just(Protocol::Ipv6)]
}

/// Assignable IPv4 host address in 100.64.0.0/10.
pub fn ipv4_host() -> impl Strategy<Value = String> {
    (64u8..128, any::<u8>(), 1u8..255)
        .prop_map(|(b, c, d)| Ipv4Addr::new(100, b, c, d).to_string())
}

/// Subscriber id such as `sub-4821`.
pub fn subscriber_id() -> impl Strategy<Value = String> {
    (0u32..100_000).prop_map(|n| format!("sub-{n}"))
}

/// Optional relay-agent identifier, sometimes blank or differently cased.
pub fn relay_id() -> impl Strategy<Value = Option<String>> {
    prop_oneof![
        Just(None),
        Just(Some(String::new())),
        "[a-zA-Z0-9/:.-]{1,16}".prop_map(Some),
    ]
}
