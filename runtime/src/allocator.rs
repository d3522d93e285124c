//! In-process collaborators for deployments without external IPAM or AAA.
//!
//! [`LocalPoolAllocator`] hands out IPv4 host addresses and IPv6 addresses or
//! delegated prefixes from configured CIDR pools. Pool access is serialised
//! behind one mutex; assignments live in memory only, so a restart forgets
//! them (use a real IPAM when that matters).

use crate::config::PoolConfig;
use futures::future::BoxFuture;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use netprov_core::adapters::{AckResult, ExternalAllocator, SessionController};
use netprov_core::error::{AllocationError, SessionError};
use netprov_core::family::Protocol;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// A pool definition that does not describe a usable range.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("pool {pool_id}: {reason}")]
pub struct InvalidPool {
    /// Offending pool
    pub pool_id: String,
    /// What is wrong with it
    pub reason: String,
}

/// Parsed address range of one pool.
///
/// Slots are numbered from 0; for IPv6 a slot is one delegated prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRange {
    /// IPv4 network
    V4(Ipv4Net),
    /// IPv6 network carved into prefixes of `delegated` bits
    V6 {
        /// Pool network
        net: Ipv6Net,
        /// Length of each handed-out prefix (128 = single addresses)
        delegated: u8,
    },
}

impl PoolRange {
    /// Parse a pool definition.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPool`] for malformed CIDRs, host bits set, or a
    /// delegated length that does not fit the network.
    pub fn parse(config: &PoolConfig) -> Result<Self, InvalidPool> {
        let fail = |reason: String| InvalidPool {
            pool_id: config.id.clone(),
            reason,
        };

        let net: IpNet = config
            .cidr
            .trim()
            .parse()
            .map_err(|_| fail(format!("{} is not in CIDR notation", config.cidr)))?;
        if net.prefix_len() == 0 {
            return Err(fail("prefix length /0 out of range".into()));
        }
        if net != net.trunc() {
            return Err(fail(format!("{} has host bits set", config.cidr)));
        }

        match net {
            IpNet::V4(v4) => {
                if config.delegated_prefix_length.is_some() {
                    return Err(fail("delegated_prefix_length only applies to IPv6 pools".into()));
                }
                Ok(Self::V4(v4))
            }
            IpNet::V6(v6) => {
                let delegated = config.delegated_prefix_length.unwrap_or(128);
                if v6.subnets(delegated).is_err() {
                    return Err(fail(format!(
                        "delegated length /{delegated} does not fit in /{}",
                        v6.prefix_len()
                    )));
                }
                Ok(Self::V6 { net: v6, delegated })
            }
        }
    }

    /// Family of the addresses in this pool.
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        match self {
            Self::V4(_) => Protocol::Ipv4,
            Self::V6 { .. } => Protocol::Ipv6,
        }
    }

    /// Index of the first assignable slot and the number of assignable slots.
    ///
    /// IPv4 networks larger than /31 lose their network and broadcast
    /// addresses, matching [`Ipv4Net::hosts`].
    #[must_use]
    pub fn usable_slots(&self) -> (u128, u128) {
        match self {
            Self::V4(net) => {
                let size = 1u128 << (32 - u32::from(net.prefix_len()));
                if net.prefix_len() <= 30 { (1, size - 2) } else { (0, size) }
            }
            Self::V6 { net, delegated } => {
                (0, 1u128 << u32::from(delegated - net.prefix_len()))
            }
        }
    }

    /// Canonical text of slot `index`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn slot_address(&self, index: u128) -> String {
        match self {
            Self::V4(net) => Ipv4Addr::from(u32::from(net.network()) + index as u32).to_string(),
            Self::V6 { net, delegated } => {
                let addr = Ipv6Addr::from(
                    u128::from(net.network()) + (index << (128 - u32::from(*delegated))),
                );
                if *delegated == 128 {
                    addr.to_string()
                } else {
                    Ipv6Net::new(addr, *delegated).map_or_else(|_| addr.to_string(), |n| n.to_string())
                }
            }
        }
    }

    /// Slot index of `address`, if it is an assignable slot of this pool.
    #[must_use]
    pub fn slot_of(&self, address: &str) -> Option<u128> {
        let (first, count) = self.usable_slots();
        let address = address.trim();
        let index = match self {
            Self::V4(net) => {
                let addr: Ipv4Addr = address.strip_suffix("/32").unwrap_or(address).parse().ok()?;
                if !net.contains(&addr) {
                    return None;
                }
                u128::from(u32::from(addr) - u32::from(net.network()))
            }
            Self::V6 { net, delegated } => {
                let candidate = if address.contains('/') {
                    address.parse::<Ipv6Net>().ok()?
                } else {
                    Ipv6Net::from(address.parse::<Ipv6Addr>().ok()?)
                };
                if candidate.prefix_len() != *delegated
                    || candidate != candidate.trunc()
                    || !net.contains(&candidate)
                {
                    return None;
                }
                let offset = u128::from(candidate.network()) - u128::from(net.network());
                offset >> (128 - u32::from(*delegated))
            }
        };
        (index >= first && index < first + count).then_some(index)
    }
}

#[derive(Debug)]
struct Pool {
    range: PoolRange,
    assigned: BTreeSet<u128>,
    cursor: u128,
}

/// In-memory allocator over configured CIDR pools.
#[derive(Debug)]
pub struct LocalPoolAllocator {
    pools: Mutex<HashMap<String, Pool>>,
}

impl LocalPoolAllocator {
    /// Build from pool definitions.
    ///
    /// # Errors
    ///
    /// Returns the first [`InvalidPool`].
    pub fn new(configs: &[PoolConfig]) -> Result<Self, InvalidPool> {
        let mut pools = HashMap::with_capacity(configs.len());
        for config in configs {
            let range = PoolRange::parse(config)?;
            pools.insert(
                config.id.clone(),
                Pool {
                    range,
                    assigned: BTreeSet::new(),
                    cursor: 0,
                },
            );
        }
        Ok(Self {
            pools: Mutex::new(pools),
        })
    }

    /// Free slots left in `pool_id`.
    #[must_use]
    pub fn available(&self, pool_id: &str) -> Option<u128> {
        let pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        pools.get(pool_id).map(|pool| {
            let (_, count) = pool.range.usable_slots();
            count - pool.assigned.len() as u128
        })
    }

    fn reserve_sync(&self, pool_id: &str, requested: Option<&str>) -> Result<String, AllocationError> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        let pool = pools.get_mut(pool_id).ok_or_else(|| AllocationError::UnknownPool {
            pool_id: pool_id.to_string(),
        })?;

        if let Some(requested) = requested {
            let index = pool
                .range
                .slot_of(requested)
                .ok_or_else(|| AllocationError::InvalidAddress {
                    protocol: pool.range.protocol(),
                    address: requested.to_string(),
                    reason: format!("not an assignable address of pool {pool_id}"),
                })?;
            if !pool.assigned.insert(index) {
                return Err(AllocationError::Conflict {
                    address: requested.to_string(),
                });
            }
            return Ok(pool.range.slot_address(index));
        }

        let (first, count) = pool.range.usable_slots();
        let taken = pool.assigned.len() as u128;
        if taken >= count {
            return Err(AllocationError::PoolExhausted {
                pool_id: pool_id.to_string(),
            });
        }

        // At most `taken` slots are occupied, so a free one turns up within taken + 1 probes.
        for step in 0..=taken {
            let offset = (pool.cursor + step) % count;
            let index = first + offset;
            if pool.assigned.insert(index) {
                pool.cursor = (offset + 1) % count;
                return Ok(pool.range.slot_address(index));
            }
        }

        Err(AllocationError::PoolExhausted {
            pool_id: pool_id.to_string(),
        })
    }

    fn release_sync(&self, address: &str) {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        for (pool_id, pool) in pools.iter_mut() {
            if let Some(index) = pool.range.slot_of(address) {
                if pool.assigned.remove(&index) {
                    tracing::debug!(pool_id = %pool_id, address, "Address returned to pool");
                    return;
                }
            }
        }
        tracing::debug!(address, "Release of unassigned address ignored");
    }
}

impl ExternalAllocator for LocalPoolAllocator {
    fn reserve<'a>(
        &'a self,
        pool_id: &'a str,
        requested: Option<&'a str>,
    ) -> BoxFuture<'a, Result<String, AllocationError>> {
        Box::pin(async move { self.reserve_sync(pool_id, requested) })
    }

    fn release<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<(), AllocationError>> {
        Box::pin(async move {
            self.release_sync(address);
            Ok(())
        })
    }
}

/// Session controller that acknowledges everything without doing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSessionController;

impl SessionController for NoopSessionController {
    fn send_coa<'a>(
        &'a self,
        session_ref: &'a str,
        attributes: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<AckResult, SessionError>> {
        Box::pin(async move {
            tracing::debug!(session_ref, attributes = attributes.len(), "CoA (noop)");
            Ok(AckResult::ack())
        })
    }

    fn send_disconnect<'a>(
        &'a self,
        session_ref: &'a str,
    ) -> BoxFuture<'a, Result<AckResult, SessionError>> {
        Box::pin(async move {
            tracing::debug!(session_ref, "Disconnect (noop)");
            Ok(AckResult::ack())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pool(id: &str, cidr: &str, delegated: Option<u8>) -> PoolConfig {
        PoolConfig {
            id: id.to_string(),
            cidr: cidr.to_string(),
            delegated_prefix_length: delegated,
        }
    }

    #[test]
    fn test_parse_rejects_bad_pools() {
        assert!(PoolRange::parse(&pool("a", "10.0.0.1/24", None)).is_err());
        assert!(PoolRange::parse(&pool("a", "10.0.0.0/24", Some(64))).is_err());
        assert!(PoolRange::parse(&pool("a", "2001:db8::/64", Some(48))).is_err());
        assert!(PoolRange::parse(&pool("a", "10.0.0.0", None)).is_err());
        assert!(PoolRange::parse(&pool("a", "0.0.0.0/0", None)).is_err());
        assert!(PoolRange::parse(&pool("a", "2001:db8::/48", Some(129))).is_err());
    }

    #[test]
    fn test_ipv4_slots_match_network_hosts() {
        for cidr in ["198.51.100.0/29", "198.51.100.0/31", "198.51.100.7/32"] {
            let net: Ipv4Net = cidr.parse().unwrap();
            let range = PoolRange::parse(&pool("a", cidr, None)).unwrap();
            let (first, count) = range.usable_slots();

            let slots: Vec<String> = (first..first + count).map(|i| range.slot_address(i)).collect();
            let hosts: Vec<String> = net.hosts().map(|h| h.to_string()).collect();
            assert_eq!(slots, hosts, "{cidr}");
        }
    }

    #[test]
    fn test_ipv4_slots_skip_network_and_broadcast() {
        let range = PoolRange::parse(&pool("a", "192.0.2.0/30", None)).unwrap();
        assert_eq!(range.usable_slots(), (1, 2));
        assert_eq!(range.slot_address(1), "192.0.2.1");
        assert_eq!(range.slot_of("192.0.2.2"), Some(2));
        assert_eq!(range.slot_of("192.0.2.3"), None);
        assert_eq!(range.slot_of("192.0.3.1"), None);
    }

    #[test]
    fn test_ipv6_delegated_slots() {
        let range = PoolRange::parse(&pool("pd", "2001:db8::/48", Some(56))).unwrap();
        assert_eq!(range.usable_slots(), (0, 256));
        assert_eq!(range.slot_address(1), "2001:db8:0:100::/56");
        assert_eq!(range.slot_of("2001:db8:0:100::/56"), Some(1));
        assert_eq!(range.slot_of("2001:db8:0:101::/56"), None);
        assert_eq!(range.slot_of("2001:db8:0:100::/64"), None);
    }

    #[tokio::test]
    async fn test_reserve_until_exhausted_then_release() {
        let allocator = LocalPoolAllocator::new(&[pool("tiny", "192.0.2.0/30", None)]).unwrap();

        let a = allocator.reserve("tiny", None).await.unwrap();
        let b = allocator.reserve("tiny", None).await.unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            allocator.reserve("tiny", None).await,
            Err(AllocationError::PoolExhausted { .. })
        ));

        allocator.release(&a).await.unwrap();
        assert_eq!(allocator.available("tiny"), Some(1));
        assert_eq!(allocator.reserve("tiny", None).await.unwrap(), a);
    }

    #[tokio::test]
    async fn test_requested_address_conflicts_once_taken() {
        let allocator = LocalPoolAllocator::new(&[pool("v4", "10.0.0.0/24", None)]).unwrap();

        assert_eq!(allocator.reserve("v4", Some("10.0.0.7")).await.unwrap(), "10.0.0.7");
        assert!(matches!(
            allocator.reserve("v4", Some("10.0.0.7")).await,
            Err(AllocationError::Conflict { .. })
        ));
        assert!(matches!(
            allocator.reserve("v4", Some("10.9.0.7")).await,
            Err(AllocationError::InvalidAddress { .. })
        ));
        assert!(matches!(
            allocator.reserve("missing", None).await,
            Err(AllocationError::UnknownPool { .. })
        ));
    }

    #[tokio::test]
    async fn test_noop_session_controller_acks() {
        let controller = NoopSessionController;
        let ack = controller.send_disconnect("sess-1").await.unwrap();
        assert!(ack.is_ack());
    }
}
