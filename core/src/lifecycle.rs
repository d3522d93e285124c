//! Address lifecycle state machine.
//!
//! Both address families share this one transition table. Every lifecycle
//! operation validates against it before touching stored state, so the IPv4
//! and IPv6 services cannot drift apart.
//!
//! ```text
//! PENDING   -> {ALLOCATED, FAILED}
//! ALLOCATED -> {ACTIVE, REVOKING, FAILED}
//! ACTIVE    -> {SUSPENDED, REVOKING, FAILED}
//! SUSPENDED -> {ACTIVE, REVOKING, FAILED}
//! REVOKING  -> {REVOKED, FAILED}
//! REVOKED   -> {}                    (terminal)
//! FAILED    -> {PENDING}             (manual recovery only)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle state of an address reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Record exists but no address is held yet
    Pending,
    /// Address reserved, not yet announced to the session
    Allocated,
    /// Address in service
    Active,
    /// Address held but service suspended
    Suspended,
    /// Revocation started, address not yet returned
    Revoking,
    /// Address returned; terminal
    Revoked,
    /// Needs operator attention
    Failed,
}

impl LifecycleState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Allocated,
        Self::Active,
        Self::Suspended,
        Self::Revoking,
        Self::Revoked,
        Self::Failed,
    ];

    /// States a reservation may legally move to from `self`.
    #[must_use]
    pub const fn allowed_targets(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Allocated, Self::Failed],
            Self::Allocated => &[Self::Active, Self::Revoking, Self::Failed],
            Self::Active => &[Self::Suspended, Self::Revoking, Self::Failed],
            Self::Suspended => &[Self::Active, Self::Revoking, Self::Failed],
            Self::Revoking => &[Self::Revoked, Self::Failed],
            Self::Revoked => &[],
            Self::Failed => &[Self::Pending],
        }
    }

    /// Whether `self -> target` appears in the transition table.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// REVOKED is the only terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Revoked)
    }

    /// Whether a reservation in this state still owns an address.
    #[must_use]
    pub const fn holds_address(self) -> bool {
        matches!(
            self,
            Self::Allocated | Self::Active | Self::Suspended | Self::Revoking
        )
    }

    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Allocated => "ALLOCATED",
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
            Self::Revoking => "REVOKING",
            Self::Revoked => "REVOKED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown lifecycle state: {0}")]
pub struct UnknownStateError(pub String);

impl FromStr for LifecycleState {
    type Err = UnknownStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStateError(s.to_string()))
    }
}

/// A transition outside the allowed table was attempted.
///
/// This is a correctness bug in the caller and is never coerced into a
/// different transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition {from} -> {to}")]
pub struct InvalidTransitionError {
    /// State the reservation was in
    pub from: LifecycleState,
    /// State that was requested
    pub to: LifecycleState,
}

/// Check `current -> target` against the shared transition table.
///
/// # Errors
///
/// Returns [`InvalidTransitionError`] when the pair is not in the table.
pub fn validate_transition(
    current: LifecycleState,
    target: LifecycleState,
) -> Result<(), InvalidTransitionError> {
    if current.can_transition_to(target) {
        Ok(())
    } else {
        Err(InvalidTransitionError {
            from: current,
            to: target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::{Active, Allocated, Failed, Pending, Revoked, Revoking, Suspended};

    #[test]
    fn test_table_matches_documented_transitions() {
        let allowed = [
            (Pending, Allocated),
            (Pending, Failed),
            (Allocated, Active),
            (Allocated, Revoking),
            (Allocated, Failed),
            (Active, Suspended),
            (Active, Revoking),
            (Active, Failed),
            (Suspended, Active),
            (Suspended, Revoking),
            (Suspended, Failed),
            (Revoking, Revoked),
            (Revoking, Failed),
            (Failed, Pending),
        ];

        for from in LifecycleState::ALL {
            for to in LifecycleState::ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    validate_transition(from, to).is_ok(),
                    expected,
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_revoked_is_terminal() {
        assert!(Revoked.is_terminal());
        assert!(Revoked.allowed_targets().is_empty());
        assert_eq!(
            validate_transition(Revoked, Pending),
            Err(InvalidTransitionError {
                from: Revoked,
                to: Pending
            })
        );
    }

    #[test]
    fn test_failed_only_recovers_to_pending() {
        assert_eq!(Failed.allowed_targets(), &[Pending]);
        assert!(validate_transition(Failed, Allocated).is_err());
    }

    #[test]
    fn test_self_transitions_are_rejected() {
        for state in LifecycleState::ALL {
            assert!(validate_transition(state, state).is_err(), "{state}");
        }
    }

    #[test]
    fn test_parse_round_trips_display() {
        for state in LifecycleState::ALL {
            assert_eq!(state.to_string().parse::<LifecycleState>(), Ok(state));
        }
        assert_eq!("active".parse::<LifecycleState>(), Ok(Active));
        assert!("GONE".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn test_holds_address() {
        assert!(!Pending.holds_address());
        assert!(Allocated.holds_address());
        assert!(Suspended.holds_address());
        assert!(Revoking.holds_address());
        assert!(!Revoked.holds_address());
        assert!(!Failed.holds_address());
    }
}
