//! Peer address: identifies a remote party in the cluster.
//!
//! A [`PeerAddr`] combines the peer's IP address with an opaque cpu id.
//! Shard-to-shard connections are not supported, so equality, ordering and
//! hashing consider only the IP: two addresses with equal `ip` are
//! indistinguishable to the connection cache, whatever their `cpu_id`.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Identity of a remote node plus the cpu shard that sent a message.
///
/// The `cpu_id` is auxiliary data carried to handlers (via the CLIENT_ID
/// handshake); it takes no part in identity.
///
/// # Examples
///
/// ```
/// use internode_core::PeerAddr;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let a = PeerAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 0);
/// let b = PeerAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 7);
/// assert_eq!(a, b);
/// assert_eq!(a.to_string(), "10.0.0.1:0");
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeerAddr {
    /// IP address of the peer node.
    pub ip: IpAddr,
    /// Source cpu shard. Opaque; ignored for routing and identity.
    pub cpu_id: u32,
}

impl PeerAddr {
    /// Create a new peer address.
    pub fn new(ip: IpAddr, cpu_id: u32) -> Self {
        Self { ip, cpu_id }
    }

    /// Create a peer address from an IP, with cpu id zero.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self { ip, cpu_id: 0 }
    }
}

impl Default for PeerAddr {
    fn default() -> Self {
        Self::from_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

impl PartialEq for PeerAddr {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip
    }
}

impl Eq for PeerAddr {}

impl PartialOrd for PeerAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ip.cmp(&other.ip)
    }
}

impl Hash for PeerAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.cpu_id)
    }
}

impl From<IpAddr> for PeerAddr {
    fn from(ip: IpAddr) -> Self {
        Self::from_ip(ip)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::collections::{HashMap, HashSet};

    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn hash_of(addr: &PeerAddr) -> u64 {
        let mut h = DefaultHasher::new();
        addr.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_equality_ignores_cpu_id() {
        let a = PeerAddr::new(ip(1), 0);
        let b = PeerAddr::new(ip(1), 31);
        let c = PeerAddr::new(ip(2), 0);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_ignores_cpu_id() {
        let a = PeerAddr::new(ip(1), 0);
        let b = PeerAddr::new(ip(1), 5);
        assert_eq!(hash_of(&a), hash_of(&b));

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_ordering_ignores_cpu_id() {
        let a = PeerAddr::new(ip(1), 9);
        let b = PeerAddr::new(ip(2), 0);
        assert!(a < b);
        assert_eq!(
            PeerAddr::new(ip(1), 0).cmp(&PeerAddr::new(ip(1), 1)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_map_lookup_by_any_cpu() {
        let mut map = HashMap::new();
        map.insert(PeerAddr::new(ip(3), 2), "entry");
        assert_eq!(map.get(&PeerAddr::new(ip(3), 11)), Some(&"entry"));
    }

    #[test]
    fn test_display() {
        let a = PeerAddr::new(ip(7), 3);
        assert_eq!(a.to_string(), "10.0.0.7:3");
    }

    #[test]
    fn test_serde_roundtrip() {
        let a = PeerAddr::new(ip(9), 4);
        let json = serde_json::to_string(&a).expect("serialize");
        let decoded: PeerAddr = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(a, decoded);
        assert_eq!(decoded.cpu_id, 4);
    }
}
