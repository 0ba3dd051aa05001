//! Messaging service configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which peers get TLS on their connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptWhat {
    /// Never encrypt.
    None,
    /// Encrypt every peer connection.
    All,
    /// Encrypt connections that cross a datacenter boundary.
    Dc,
    /// Encrypt connections that cross a rack boundary.
    Rack,
}

/// Which peers get compressed connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressWhat {
    /// Never compress.
    None,
    /// Compress connections that cross a datacenter boundary.
    Dc,
    /// Compress every peer connection.
    All,
}

/// TLS material locations for encrypted peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Node certificate chain, PEM.
    pub cert_path: PathBuf,
    /// Node private key, PEM.
    pub key_path: PathBuf,
    /// Trust anchor for peer certificates; the node certificate doubles
    /// as the anchor when absent.
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
}

/// Configuration of one messaging service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Bind address for the primary listeners.
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,

    /// Plain-TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// TLS port.
    #[serde(default = "default_ssl_port")]
    pub ssl_port: u16,

    /// Per-peer TLS selection.
    #[serde(default = "default_encrypt_what")]
    pub encrypt_what: EncryptWhat,

    /// Per-peer compression selection.
    #[serde(default = "default_compress_what")]
    pub compress_what: CompressWhat,

    /// Also bind listeners on the broadcast address when it differs from
    /// the listen address.
    #[serde(default)]
    pub should_listen_to_broadcast_address: bool,

    /// The address this node is known by cluster-wide; defaults to the
    /// listen address.
    #[serde(default)]
    pub broadcast_address: Option<IpAddr>,

    /// Start listeners at construction rather than on demand.
    #[serde(default = "default_listen_now")]
    pub listen_now: bool,

    /// The cpu shard this instance serves. Shard 0 is the logging leader.
    #[serde(default)]
    pub shard: u32,

    /// Memory budget the resource-limit policy derives from; defaults to
    /// total system memory.
    #[serde(default)]
    pub memory_budget: Option<usize>,

    /// Largest reply this node announces it will buffer.
    #[serde(default)]
    pub max_result_size: Option<u64>,

    /// TLS material; required for any `encrypt_what` other than `none`.
    #[serde(default)]
    pub tls: Option<TlsOptions>,
}

fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    7000
}

fn default_ssl_port() -> u16 {
    7001
}

fn default_encrypt_what() -> EncryptWhat {
    EncryptWhat::None
}

fn default_compress_what() -> CompressWhat {
    CompressWhat::None
}

fn default_listen_now() -> bool {
    true
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_port(),
            ssl_port: default_ssl_port(),
            encrypt_what: default_encrypt_what(),
            compress_what: default_compress_what(),
            should_listen_to_broadcast_address: false,
            broadcast_address: None,
            listen_now: default_listen_now(),
            shard: 0,
            memory_budget: None,
            max_result_size: None,
            tls: None,
        }
    }
}

impl MessagingConfig {
    /// The address this node is known by cluster-wide.
    pub fn broadcast_address(&self) -> IpAddr {
        self.broadcast_address.unwrap_or(self.listen_address)
    }

    /// Whether this shard is the designated logging leader.
    pub fn is_leader_shard(&self) -> bool {
        self.shard == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = MessagingConfig::default();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.ssl_port, 7001);
        assert_eq!(cfg.encrypt_what, EncryptWhat::None);
        assert_eq!(cfg.compress_what, CompressWhat::None);
        assert!(cfg.listen_now);
        assert!(!cfg.should_listen_to_broadcast_address);
        assert_eq!(cfg.broadcast_address(), cfg.listen_address);
        assert!(cfg.is_leader_shard());
    }

    #[test]
    fn test_deserialize_partial() {
        let cfg: MessagingConfig = serde_json::from_str(
            r#"{
                "listen_address": "10.0.0.5",
                "port": 9042,
                "encrypt_what": "dc",
                "compress_what": "all"
            }"#,
        )
        .expect("parse");
        assert_eq!(cfg.listen_address.to_string(), "10.0.0.5");
        assert_eq!(cfg.port, 9042);
        assert_eq!(cfg.encrypt_what, EncryptWhat::Dc);
        assert_eq!(cfg.compress_what, CompressWhat::All);
        // everything else defaulted
        assert_eq!(cfg.ssl_port, 7001);
        assert!(cfg.tls.is_none());
    }

    #[test]
    fn test_broadcast_address_override() {
        let mut cfg = MessagingConfig::default();
        cfg.broadcast_address = Some("192.168.1.44".parse().expect("ip"));
        assert_eq!(cfg.broadcast_address().to_string(), "192.168.1.44");
    }
}
