//! # internode
//!
//! Inter-node messaging service for a distributed database cluster.
//!
//! Each node runs one [`MessagingService`] per cpu shard. The service
//! multiplexes many logical request kinds ("verbs") over a small pool of
//! long-lived connections to every peer, with optional TLS and stream
//! compression, keepalive supervision, graceful shutdown, and a
//! retry-with-backoff wrapper for long-running streaming verbs. Gossip,
//! schema propagation and data streaming all build on it.
//!
//! ## Anatomy
//!
//! | Piece | Responsibility |
//! |-------|----------------|
//! | client registry | per-peer, per-pool lazy-created outbound clients; error eviction |
//! | server registry | plain and TLS listeners, optionally doubled on the broadcast address |
//! | handler registry | per-verb callbacks; caller identity via the CLIENT_ID handshake |
//! | send pipeline | typed send / send_with_timeout / send_oneway; dropped-message accounting |
//! | retry wrapper | streaming-verb retry with abortable waits and membership checks |
//!
//! ## Quick start
//!
//! ```ignore
//! use internode::{MessagingConfig, start_messaging};
//! use internode_core::PeerAddr;
//!
//! let service = start_messaging(MessagingConfig::default()).await?;
//!
//! service.register_gossip_echo(|_info| async { Ok(()) });
//! service.send_gossip_echo(PeerAddr::from_ip(peer_ip)).await?;
//!
//! service.stop().await;
//! ```
//!
//! The service is generic over a [`Providers`](internode_core::Providers)
//! bundle; production wiring uses the TCP transport from `internode-rpc`,
//! tests substitute scripted transports.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod config;
mod limits;
mod retry;
mod send;
mod service;

pub use config::{CompressWhat, EncryptWhat, MessagingConfig, TlsOptions};
pub use limits::rpc_resource_limits;
pub use retry::{STREAMING_NR_RETRY, STREAMING_TIMEOUT, STREAMING_WAIT_BEFORE_RETRY};
pub use service::{
    CONNECTION_POOL_COUNT, ClientEntry, MessagingService, MessagingServiceBuilder,
    rpc_client_index,
};

use std::rc::Rc;

use internode_core::{JsonCodec, RpcError};
use internode_rpc::{CredentialsBuilder, TcpProviders, TcpRpcProvider};

/// The production service type: TCP transport, JSON payloads.
pub type TcpMessagingService = MessagingService<TcpProviders<JsonCodec>, JsonCodec>;

/// Construct a production service from configuration and, when
/// `listen_now` is set, bring its listeners up.
///
/// # Errors
///
/// [`RpcError::Io`] when TLS material cannot be loaded or a listener
/// cannot be bound.
pub async fn start_messaging(cfg: MessagingConfig) -> Result<Rc<TcpMessagingService>, RpcError> {
    let mut rpc = TcpRpcProvider::new(JsonCodec);
    if let Some(tls) = &cfg.tls {
        let mut builder = CredentialsBuilder::new(&tls.cert_path, &tls.key_path);
        if let Some(ca) = &tls.ca_path {
            builder = builder.with_ca(ca);
        }
        rpc = rpc.with_tls(builder.build()?);
    }
    MessagingServiceBuilder::new(cfg, TcpProviders::new(rpc))
        .start()
        .await
}
