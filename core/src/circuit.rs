//! Access-network location validation (DHCP option 82 style).
//!
//! Compares the circuit-id / remote-id a relay agent reports for a session
//! against the binding stored on the subscriber profile. Pure: no I/O, no
//! clock, no logging.

use crate::adapters::Profile;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How strictly a binding mismatch is treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitPolicy {
    /// Reject on mismatch or missing values
    Enforce,
    /// Always accept, but flag non-matches for logging
    #[default]
    Log,
    /// Do not compare at all
    Ignore,
}

impl FromStr for CircuitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enforce" => Ok(Self::Enforce),
            "log" => Ok(Self::Log),
            "ignore" => Ok(Self::Ignore),
            other => Err(format!("unknown circuit policy: {other}")),
        }
    }
}

/// Comparison verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationResult {
    /// Every bound value matched
    Match,
    /// A bound value differs from what was observed
    Mismatch,
    /// A bound value was not observed at all
    Missing,
    /// No profile, or a profile without any binding
    NoProfile,
    /// Policy said not to compare
    PolicyIgnore,
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Match => "MATCH",
            Self::Mismatch => "MISMATCH",
            Self::Missing => "MISSING",
            Self::NoProfile => "NO_PROFILE",
            Self::PolicyIgnore => "POLICY_IGNORE",
        };
        f.write_str(s)
    }
}

/// What the caller should do with the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationAction {
    /// Let it through
    Accept,
    /// Refuse it
    Reject,
    /// Let it through and record the discrepancy
    Log,
}

/// Verdict plus action, with the fields that did not line up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitValidation {
    /// Comparison verdict
    pub result: ValidationResult,
    /// Action for the caller
    pub action: ValidationAction,
    /// Names of the fields that mismatched or were missing
    pub fields: Vec<String>,
}

impl CircuitValidation {
    const fn new(result: ValidationResult, action: ValidationAction) -> Self {
        Self {
            result,
            action,
            fields: Vec::new(),
        }
    }

    /// Whether the session may proceed.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        !matches!(self.action, ValidationAction::Reject)
    }
}

enum FieldCheck {
    Match,
    Mismatch,
    Missing,
}

fn check_field(bound: &str, observed: Option<&str>) -> FieldCheck {
    match observed.map(str::trim).filter(|s| !s.is_empty()) {
        None => FieldCheck::Missing,
        Some(seen) if seen.eq_ignore_ascii_case(bound.trim()) => FieldCheck::Match,
        Some(_) => FieldCheck::Mismatch,
    }
}

/// Compare observed relay-agent identifiers with the stored binding.
#[must_use]
pub fn validate(
    stored_profile: Option<&Profile>,
    observed_circuit_id: Option<&str>,
    observed_remote_id: Option<&str>,
    policy: CircuitPolicy,
) -> CircuitValidation {
    if policy == CircuitPolicy::Ignore {
        return CircuitValidation::new(ValidationResult::PolicyIgnore, ValidationAction::Accept);
    }

    let Some(profile) = stored_profile else {
        return CircuitValidation::new(ValidationResult::NoProfile, ValidationAction::Log);
    };

    let bindings = [
        (Profile::CIRCUIT_ID, profile.circuit_id(), observed_circuit_id),
        (Profile::REMOTE_ID, profile.remote_id(), observed_remote_id),
    ];

    if bindings.iter().all(|(_, bound, _)| bound.is_none()) {
        return CircuitValidation::new(ValidationResult::NoProfile, ValidationAction::Log);
    }

    let mut mismatched = Vec::new();
    let mut missing = Vec::new();
    for (name, bound, observed) in bindings {
        let Some(bound) = bound else { continue };
        match check_field(bound, observed) {
            FieldCheck::Match => {}
            FieldCheck::Mismatch => mismatched.push(name.to_string()),
            FieldCheck::Missing => missing.push(name.to_string()),
        }
    }

    // Mismatch outranks missing: a wrong location is worse than an absent one.
    let (result, fields) = if !mismatched.is_empty() {
        (ValidationResult::Mismatch, mismatched)
    } else if !missing.is_empty() {
        (ValidationResult::Missing, missing)
    } else {
        (ValidationResult::Match, Vec::new())
    };

    let action = match (result, policy) {
        (ValidationResult::Match, _) => ValidationAction::Accept,
        (_, CircuitPolicy::Enforce) => ValidationAction::Reject,
        _ => ValidationAction::Log,
    };

    CircuitValidation {
        result,
        action,
        fields,
    }
}
