//! Protocol families and their address rules.
//!
//! The lifecycle manager is generic over [`AddressFamily`]; the family decides
//! what a valid address looks like, how it is stored, and which session
//! attributes announce it to the AAA side.

use crate::error::AllocationError;
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// IP protocol family of a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// IPv4 host addresses
    Ipv4,
    /// IPv6 addresses and delegated prefixes
    Ipv6,
}

impl Protocol {
    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipv4 => "ipv4",
            Self::Ipv6 => "ipv6",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" | "v4" => Ok(Self::Ipv4),
            "ipv6" | "v6" => Ok(Self::Ipv6),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Address rules for one protocol family.
///
/// Implemented by the zero-sized [`Ipv4`] and [`Ipv6`] markers and selected at
/// compile time by `AddressLifecycleManager<F>`.
pub trait AddressFamily: Send + Sync + 'static {
    /// Protocol this family manages.
    const PROTOCOL: Protocol;

    /// Validate an address handed in by a caller or returned by an allocator
    /// and return its canonical stored form.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::InvalidAddress`] if the address is malformed
    /// or not assignable to a subscriber.
    fn canonicalize(raw: &str) -> Result<String, AllocationError>;

    /// Session attributes announcing `address` on a live session.
    fn session_attributes(address: &str) -> BTreeMap<String, String>;

    /// Family specific metadata recorded at allocation time.
    fn allocation_metadata(_address: &str) -> Map<String, Value> {
        Map::new()
    }
}

fn invalid(protocol: Protocol, address: &str, reason: impl Into<String>) -> AllocationError {
    AllocationError::InvalidAddress {
        protocol,
        address: address.to_string(),
        reason: reason.into(),
    }
}

/// IPv4 host addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv4;

impl AddressFamily for Ipv4 {
    const PROTOCOL: Protocol = Protocol::Ipv4;

    fn canonicalize(raw: &str) -> Result<String, AllocationError> {
        let trimmed = raw.trim();
        // A /32 is accepted as a host route for the same address.
        let addr = if trimmed.contains('/') {
            let net = Ipv4Net::from_str(trimmed)
                .map_err(|e| invalid(Protocol::Ipv4, raw, e.to_string()))?;
            if net.prefix_len() != 32 {
                return Err(invalid(Protocol::Ipv4, raw, "only /32 host routes are assignable"));
            }
            net.addr()
        } else {
            Ipv4Addr::from_str(trimmed).map_err(|e| invalid(Protocol::Ipv4, raw, e.to_string()))?
        };

        if addr.is_unspecified() {
            return Err(invalid(Protocol::Ipv4, raw, "unspecified address"));
        }
        if addr.is_broadcast() {
            return Err(invalid(Protocol::Ipv4, raw, "broadcast address"));
        }
        if addr.is_multicast() {
            return Err(invalid(Protocol::Ipv4, raw, "multicast address"));
        }
        if addr.is_loopback() {
            return Err(invalid(Protocol::Ipv4, raw, "loopback address"));
        }

        Ok(addr.to_string())
    }

    fn session_attributes(address: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("Framed-IP-Address".to_string(), address.to_string())])
    }
}

/// IPv6 host addresses and delegated prefixes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv6;

impl Ipv6 {
    /// Prefix length of a stored address; bare addresses are /128.
    #[must_use]
    pub fn prefix_length(address: &str) -> u8 {
        Ipv6Net::from_str(address.trim()).map_or(128, |net| net.prefix_len())
    }

    fn is_prefix(address: &str) -> bool {
        Self::prefix_length(address) < 128
    }
}

impl AddressFamily for Ipv6 {
    const PROTOCOL: Protocol = Protocol::Ipv6;

    fn canonicalize(raw: &str) -> Result<String, AllocationError> {
        let trimmed = raw.trim();
        let net = if trimmed.contains('/') {
            Ipv6Net::from_str(trimmed).map_err(|e| invalid(Protocol::Ipv6, raw, e.to_string()))?
        } else {
            Ipv6Addr::from_str(trimmed)
                .map(Ipv6Net::from)
                .map_err(|e| invalid(Protocol::Ipv6, raw, e.to_string()))?
        };
        if net.prefix_len() == 0 {
            return Err(invalid(Protocol::Ipv6, raw, "prefix length must be 1..=128"));
        }

        let addr = net.addr();

        if addr.is_unspecified() {
            return Err(invalid(Protocol::Ipv6, raw, "unspecified address"));
        }
        if addr.is_multicast() {
            return Err(invalid(Protocol::Ipv6, raw, "multicast address"));
        }
        if addr.is_loopback() {
            return Err(invalid(Protocol::Ipv6, raw, "loopback address"));
        }

        if net.prefix_len() == 128 {
            return Ok(addr.to_string());
        }
        if net != net.trunc() {
            return Err(invalid(Protocol::Ipv6, raw, "host bits set below the prefix length"));
        }

        Ok(net.to_string())
    }

    fn session_attributes(address: &str) -> BTreeMap<String, String> {
        if Self::is_prefix(address) {
            BTreeMap::from([("Delegated-IPv6-Prefix".to_string(), address.to_string())])
        } else {
            // A single address is announced as a /128 framed prefix.
            let framed = address.split_once('/').map_or(address, |(host, _)| host);
            BTreeMap::from([("Framed-IPv6-Prefix".to_string(), format!("{framed}/128"))])
        }
    }

    fn allocation_metadata(address: &str) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert(
            "prefix_length".to_string(),
            Value::from(Self::prefix_length(address)),
        );
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_canonicalize_accepts_hosts() {
        assert_eq!(Ipv4::canonicalize(" 100.64.0.10 "), Ok("100.64.0.10".to_string()));
        assert_eq!(Ipv4::canonicalize("10.0.0.1/32"), Ok("10.0.0.1".to_string()));
    }

    #[test]
    fn test_ipv4_canonicalize_rejects_unassignable() {
        for raw in ["0.0.0.0", "255.255.255.255", "224.0.0.1", "127.0.0.1", "10.0.0.0/24", "300.1.1.1", "2001:db8::1"] {
            assert!(
                matches!(Ipv4::canonicalize(raw), Err(AllocationError::InvalidAddress { .. })),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_ipv6_canonicalize_prefix() {
        assert_eq!(
            Ipv6::canonicalize("2001:0db8:0000:0100::/56"),
            Ok("2001:db8:0:100::/56".to_string())
        );
        assert_eq!(Ipv6::canonicalize("2001:db8::1"), Ok("2001:db8::1".to_string()));
        assert_eq!(Ipv6::canonicalize("2001:db8::1/128"), Ok("2001:db8::1".to_string()));
    }

    #[test]
    fn test_ipv6_canonicalize_rejects_host_bits_and_bad_lengths() {
        for raw in [
            "2001:db8::1/56",
            "2001:db8:0:101::/56",
            "2001:db8::/0",
            "2001:db8::/129",
            "2001:db8::/x",
            "::",
            "ff02::1",
            "::1",
            "10.0.0.1",
        ] {
            assert!(Ipv6::canonicalize(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_session_attributes_per_family() {
        assert_eq!(
            Ipv4::session_attributes("100.64.0.10").get("Framed-IP-Address"),
            Some(&"100.64.0.10".to_string())
        );
        assert!(Ipv6::session_attributes("2001:db8:0:100::/56").contains_key("Delegated-IPv6-Prefix"));
        assert_eq!(
            Ipv6::session_attributes("2001:db8::1").get("Framed-IPv6-Prefix"),
            Some(&"2001:db8::1/128".to_string())
        );
        assert!(!Ipv6::session_attributes("2001:db8::1").contains_key("Framed-IPv6-Address"));
    }

    #[test]
    fn test_ipv6_allocation_metadata_records_prefix_length() {
        let metadata = Ipv6::allocation_metadata("2001:db8:0:100::/56");
        assert_eq!(metadata.get("prefix_length"), Some(&Value::from(56)));
        assert_eq!(
            Ipv6::allocation_metadata("2001:db8::1").get("prefix_length"),
            Some(&Value::from(128))
        );
        assert!(Ipv4::allocation_metadata("100.64.0.10").is_empty());
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("IPv6".parse::<Protocol>(), Ok(Protocol::Ipv6));
        assert_eq!("v4".parse::<Protocol>(), Ok(Protocol::Ipv4));
        assert!("ipx".parse::<Protocol>().is_err());
    }
}
