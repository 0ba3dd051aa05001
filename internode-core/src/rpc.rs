//! The seam to the wire RPC library.
//!
//! The messaging service consumes its transport exclusively through these
//! traits. The production implementation (framing, request multiplexing,
//! keepalive probes, LZ4 compression, TLS) lives in `internode-rpc`; tests
//! substitute scripted implementations.
//!
//! Three roles:
//!
//! - [`RpcProvider`]: constructs outbound clients and inbound listeners
//! - [`RpcClient`]: one outbound connection; typed calls are built on its
//!   byte-level `call`/`notify`
//! - [`RpcServer`]: one listener; dispatches inbound messages to the
//!   callbacks in a shared [`HandlerTable`]

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::verb::Verb;

/// TCP-style keepalive parameters for an outbound connection.
///
/// The connection sends a probe after `idle` without traffic, then every
/// `interval`; after `max_failures` unanswered probes it is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveParams {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Unanswered probes tolerated before dropping the connection.
    pub max_failures: u32,
}

impl Default for KeepaliveParams {
    fn default() -> Self {
        // probe each minute when idle, drop after 10 failures
        Self {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(60),
            max_failures: 10,
        }
    }
}

/// Identity announced by a client as its first message (the CLIENT_ID
/// handshake): which node and cpu shard the connection originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// The sender's broadcast address (its cluster-wide identity).
    pub broadcast_address: IpAddr,
    /// The sender's cpu shard.
    pub src_cpu_id: u32,
    /// Largest reply the sender is willing to buffer, if it announced one.
    pub max_result_size: Option<u64>,
}

/// Options for constructing an outbound client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Remote address to dial.
    pub remote: SocketAddr,
    /// Local address to bind before connecting, when fixed routing is
    /// wanted.
    pub local_ip: Option<IpAddr>,
    /// Keepalive supervision; `None` disables probing.
    pub keepalive: Option<KeepaliveParams>,
    /// Offer payload compression for this connection.
    pub compress: bool,
    /// Encrypt this connection with TLS.
    pub tls: bool,
    /// Identity announced in the CLIENT_ID handshake.
    pub identity: SourceInfo,
}

/// Memory budget handed to a listener.
///
/// Each in-flight request accounts for
/// `basic_request_size + bloat_factor * frame_len` bytes; requests that
/// would push the total past `max_memory` are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Baseline accounting cost of one request.
    pub basic_request_size: usize,
    /// Multiplier tolerating deserialization overhead.
    pub bloat_factor: usize,
    /// Ceiling on memory consumed by in-flight requests.
    pub max_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            basic_request_size: 1000,
            bloat_factor: 1,
            max_memory: 1_000_000,
        }
    }
}

/// Options for constructing a listener.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind.
    pub bind: SocketAddr,
    /// Accept compression offers from clients.
    pub compress: bool,
    /// Terminate TLS on this listener.
    pub tls: bool,
    /// Memory budget for in-flight requests.
    pub limits: ResourceLimits,
}

/// Counters for one connection, client- or server-side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Requests and one-way messages sent.
    pub requests_sent: u64,
    /// Successful replies received.
    pub replies_received: u64,
    /// Error replies received.
    pub errors_received: u64,
    /// Bytes written to the wire.
    pub bytes_sent: u64,
    /// Bytes read from the wire.
    pub bytes_received: u64,
}

/// Server-side identity of one inbound connection.
///
/// Carries the socket peer address plus the auxiliary data attached by the
/// CLIENT_ID handshake, from which handlers recover the caller's cluster
/// identity.
#[derive(Debug)]
pub struct ClientInfo {
    /// Socket address the connection arrived from.
    pub remote: SocketAddr,
    source: RefCell<Option<SourceInfo>>,
}

impl ClientInfo {
    /// Create an info record for a freshly accepted connection.
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            source: RefCell::new(None),
        }
    }

    /// Attach the identity announced by the CLIENT_ID handshake.
    pub fn attach_source(&self, source: SourceInfo) {
        *self.source.borrow_mut() = Some(source);
    }

    /// The identity announced by the CLIENT_ID handshake, if any arrived.
    pub fn source(&self) -> Option<SourceInfo> {
        *self.source.borrow()
    }
}

/// Future returned by a type-erased verb handler.
///
/// Resolves to `Some(reply bytes)` for request-response verbs and `None`
/// for no-reply verbs.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, RpcError>>>>;

/// A type-erased verb handler.
pub type VerbHandler = Rc<dyn Fn(Rc<ClientInfo>, Vec<u8>) -> HandlerFuture>;

/// Per-verb callback registry shared between the service and its listeners.
///
/// Registration is keyed by the verb's stable index; re-registering a verb
/// replaces the previous callback.
#[derive(Default)]
pub struct HandlerTable {
    entries: RefCell<HashMap<u32, VerbHandler>>,
}

impl HandlerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the callback for a verb, replacing any previous one.
    pub fn register(&self, verb: Verb, handler: VerbHandler) {
        self.entries.borrow_mut().insert(verb.as_u32(), handler);
    }

    /// Remove the callback for a verb.
    pub fn unregister(&self, verb: Verb) {
        self.entries.borrow_mut().remove(&verb.as_u32());
    }

    /// Look up the callback for a raw verb encoding.
    pub fn get(&self, verb: u32) -> Option<VerbHandler> {
        self.entries.borrow().get(&verb).cloned()
    }

    /// Whether a callback is installed for the verb.
    pub fn is_registered(&self, verb: Verb) -> bool {
        self.entries.borrow().contains_key(&verb.as_u32())
    }
}

/// One outbound connection to a peer.
///
/// Handles are shared (`Rc`) between the connection pool and in-flight
/// calls, so evicting a handle from the pool never invalidates a call that
/// is still running on it.
#[async_trait(?Send)]
pub trait RpcClient: 'static {
    /// Send a request and await its reply, optionally bounded by a
    /// deadline.
    ///
    /// # Errors
    ///
    /// [`RpcError::Closed`] if the connection is down or torn down
    /// mid-call, [`RpcError::Timeout`] if the deadline elapses,
    /// [`RpcError::Remote`] if the peer's handler failed.
    async fn call(
        &self,
        verb: Verb,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RpcError>;

    /// Send a one-way message. Resolves once the message is handed to the
    /// connection; delivery is not acknowledged.
    ///
    /// # Errors
    ///
    /// [`RpcError::Closed`] if the connection is down.
    async fn notify(&self, verb: Verb, payload: Vec<u8>) -> Result<(), RpcError>;

    /// Whether the connection has failed and should be evicted.
    fn is_error(&self) -> bool;

    /// Connection counters.
    fn stats(&self) -> ConnectionStats;

    /// Tear the connection down: fail all pending calls with
    /// [`RpcError::Closed`] and release resources. Idempotent.
    async fn stop(&self);
}

/// One inbound listener.
#[async_trait(?Send)]
pub trait RpcServer: 'static {
    /// The address the listener is bound to.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Visit every live inbound connection with its stats.
    fn foreach_connection(&self, f: &mut dyn FnMut(&ClientInfo, &ConnectionStats));

    /// Stop accepting and close all inbound connections. Idempotent.
    async fn stop(&self);
}

/// Factory for clients and listeners: the RPC library's front door.
#[async_trait(?Send)]
pub trait RpcProvider: Clone + 'static {
    /// Outbound connection type.
    type Client: RpcClient;
    /// Inbound listener type.
    type Server: RpcServer;

    /// Construct an outbound client.
    ///
    /// Construction is synchronous; the dial (and TLS handshake) happens
    /// lazily in the background, and calls issued before the connection is
    /// up are queued in order behind the handshake messages.
    fn connect(&self, opts: ClientOptions) -> Self::Client;

    /// Bind a listener that dispatches inbound messages through `handlers`.
    ///
    /// # Errors
    ///
    /// [`RpcError::Io`] if the address cannot be bound.
    async fn listen(
        &self,
        opts: ServerOptions,
        handlers: Rc<HandlerTable>,
    ) -> Result<Self::Server, RpcError>;
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn client_info() -> ClientInfo {
        ClientInfo::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999))
    }

    #[test]
    fn test_client_info_attach_source() {
        let info = client_info();
        assert!(info.source().is_none());

        info.attach_source(SourceInfo {
            broadcast_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_cpu_id: 3,
            max_result_size: Some(1 << 20),
        });

        let source = info.source().expect("source attached");
        assert_eq!(source.src_cpu_id, 3);
        assert_eq!(source.max_result_size, Some(1 << 20));
    }

    #[test]
    fn test_handler_table_register_unregister() {
        let table = HandlerTable::new();
        assert!(!table.is_registered(Verb::GossipEcho));

        let handler: VerbHandler =
            Rc::new(|_info, _payload| Box::pin(async { Ok(Some(Vec::new())) }));
        table.register(Verb::GossipEcho, handler);
        assert!(table.is_registered(Verb::GossipEcho));
        assert!(table.get(Verb::GossipEcho.as_u32()).is_some());

        table.unregister(Verb::GossipEcho);
        assert!(!table.is_registered(Verb::GossipEcho));
        assert!(table.get(Verb::GossipEcho.as_u32()).is_none());
    }

    #[test]
    fn test_handler_table_replace() {
        let table = HandlerTable::new();
        let first: VerbHandler = Rc::new(|_info, _payload| Box::pin(async { Ok(None) }));
        let second: VerbHandler =
            Rc::new(|_info, _payload| Box::pin(async { Ok(Some(vec![1])) }));

        table.register(Verb::Mutation, first);
        table.register(Verb::Mutation, second.clone());

        let got = table.get(Verb::Mutation.as_u32()).expect("registered");
        assert!(Rc::ptr_eq(&got, &second));
    }

    #[test]
    fn test_keepalive_defaults() {
        let ka = KeepaliveParams::default();
        assert_eq!(ka.idle, Duration::from_secs(60));
        assert_eq!(ka.interval, Duration::from_secs(60));
        assert_eq!(ka.max_failures, 10);
    }
}
