//! Seams to the cluster topology subsystems.
//!
//! The messaging service consults three external oracles: the locality
//! oracle (which datacenter/rack an address lives in, for per-peer TLS and
//! compression selection), the membership oracle (whether an address is
//! still a known cluster member, consulted by the streaming retry loop),
//! and the preferred-IP store (persisted alternate addresses for same-DC
//! peers). Null implementations are provided for deployments where a
//! subsystem is absent; selection policy then falls back conservatively.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::RpcError;

/// Answers datacenter and rack questions for an address.
///
/// Returning `None` means the oracle cannot place the address; callers
/// must treat that conservatively (no encryption for dc/rack modes,
/// compression for dc mode).
pub trait LocalityOracle {
    /// The datacenter the address resides in.
    fn datacenter(&self, addr: IpAddr) -> Option<String>;

    /// The rack the address resides in.
    fn rack(&self, addr: IpAddr) -> Option<String>;
}

/// Answers "is this address a known cluster member".
pub trait MembershipOracle {
    /// Whether the address is currently a known endpoint.
    fn is_known_endpoint(&self, addr: IpAddr) -> bool;
}

/// Loads the persisted preferred-IP map at startup.
#[async_trait(?Send)]
pub trait PreferredIpStore {
    /// Load the persisted `peer-ip -> alternate-ip` map.
    async fn load(&self) -> Result<HashMap<IpAddr, IpAddr>, RpcError>;
}

/// Locality oracle that cannot place any address.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnknownLocality;

impl LocalityOracle for UnknownLocality {
    fn datacenter(&self, _addr: IpAddr) -> Option<String> {
        None
    }

    fn rack(&self, _addr: IpAddr) -> Option<String> {
        None
    }
}

/// Membership oracle that considers every address a member.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysMember;

impl MembershipOracle for AlwaysMember {
    fn is_known_endpoint(&self, _addr: IpAddr) -> bool {
        true
    }
}

/// Preferred-IP store with no persisted entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPreferredIps;

#[async_trait(?Send)]
impl PreferredIpStore for NoPreferredIps {
    async fn load(&self) -> Result<HashMap<IpAddr, IpAddr>, RpcError> {
        Ok(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn test_null_oracles() {
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(UnknownLocality.datacenter(addr), None);
        assert_eq!(UnknownLocality.rack(addr), None);
        assert!(AlwaysMember.is_known_endpoint(addr));
    }

    #[tokio::test]
    async fn test_empty_preferred_ip_store() {
        let map = NoPreferredIps.load().await.expect("load");
        assert!(map.is_empty());
    }
}
