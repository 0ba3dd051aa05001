//! Core service state: connection pools, listeners, lifecycle.
//!
//! One [`MessagingService`] instance runs per cpu shard, behind an `Rc`.
//! It owns two outbound connection pools per peer (the default pool for
//! data-path verbs and a control pool for gossip chatter, so control
//! traffic never queues behind bulk transfers and dependent verbs cannot
//! deadlock on a shared connection), up to four listeners (plain and TLS,
//! each optionally doubled on the broadcast address), the preferred-IP
//! cache, and the per-verb dropped-message counters.
//!
//! Clients are created lazily on first use and evicted when their handle
//! reports an error, when their peer is removed, or at shutdown. Handles
//! are reference counted: eviction never invalidates a call in flight.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::Notify;

use internode_core::{
    AlwaysMember, ClientInfo, ClientOptions, ConnectionStats, HandlerTable, JsonCodec,
    KeepaliveParams, LocalityOracle, MembershipOracle, MessageCodec, NoPreferredIps, PeerAddr,
    PreferredIpStore, Providers, RpcClient, RpcError, RpcProvider, RpcServer, ServerOptions,
    SourceInfo, TaskProvider, UnknownLocality, Verb,
};

use crate::config::{CompressWhat, EncryptWhat, MessagingConfig};
use crate::limits::rpc_resource_limits;

/// Number of outbound connection pools per peer.
pub const CONNECTION_POOL_COUNT: usize = 2;

/// Pool for data-path verbs.
const POOL_DEFAULT: usize = 0;

/// Pool for low-latency control chatter.
const POOL_CONTROL: usize = 1;

/// The pool a verb's connections live in.
///
/// Gossip chatter gets its own pool so failure detection stays responsive
/// under data-path load. Schema-version lookups stay in the default pool
/// deliberately apart from gossip; what matters is that they never share a
/// connection with control traffic. Unclassified verbs fail closed into
/// the default pool.
pub fn rpc_client_index(verb: Verb) -> usize {
    match verb {
        Verb::GossipDigestSyn
        | Verb::GossipDigestAck2
        | Verb::GossipShutdown
        | Verb::GossipEcho => POOL_CONTROL,
        _ => POOL_DEFAULT,
    }
}

pub(crate) type ClientOf<P> = <<P as Providers>::Rpc as RpcProvider>::Client;
pub(crate) type ServerOf<P> = <<P as Providers>::Rpc as RpcProvider>::Server;

/// Cached state for one `(pool, peer)` connection.
pub struct ClientEntry<P: Providers> {
    rpc_client: Rc<ClientOf<P>>,
}

impl<P: Providers> ClientEntry<P> {
    /// Counters of the underlying connection.
    pub fn stats(&self) -> ConnectionStats {
        self.rpc_client.stats()
    }
}

/// The messaging service: peer-to-peer RPC substrate of one shard.
pub struct MessagingService<P: Providers, C: MessageCodec = JsonCodec> {
    cfg: MessagingConfig,
    providers: P,
    codec: C,
    locality: Rc<dyn LocalityOracle>,
    pub(crate) membership: Rc<dyn MembershipOracle>,
    preferred_ip_store: Rc<dyn PreferredIpStore>,
    handlers: Rc<HandlerTable>,
    clients: [RefCell<HashMap<PeerAddr, ClientEntry<P>>>; CONNECTION_POOL_COUNT],
    servers: RefCell<[Option<Rc<ServerOf<P>>>; 2]>,
    tls_servers: RefCell<[Option<Rc<ServerOf<P>>>; 2]>,
    preferred_ips: RefCell<HashMap<IpAddr, IpAddr>>,
    dropped: RefCell<[u64; Verb::COUNT]>,
    stopping: Cell<bool>,
    stop_notify: Notify,
}

/// Builder for a [`MessagingService`].
///
/// Oracles default to their null implementations; selection policy then
/// falls back conservatively (no dc/rack encryption, dc compression
/// behaves as all).
pub struct MessagingServiceBuilder<P: Providers, C: MessageCodec = JsonCodec> {
    cfg: MessagingConfig,
    providers: P,
    codec: C,
    locality: Rc<dyn LocalityOracle>,
    membership: Rc<dyn MembershipOracle>,
    preferred_ip_store: Rc<dyn PreferredIpStore>,
}

impl<P: Providers> MessagingServiceBuilder<P, JsonCodec> {
    /// Start a builder with the JSON codec and null oracles.
    pub fn new(cfg: MessagingConfig, providers: P) -> Self {
        Self {
            cfg,
            providers,
            codec: JsonCodec,
            locality: Rc::new(UnknownLocality),
            membership: Rc::new(AlwaysMember),
            preferred_ip_store: Rc::new(NoPreferredIps),
        }
    }
}

impl<P: Providers, C: MessageCodec> MessagingServiceBuilder<P, C> {
    /// Use a different payload codec.
    pub fn with_codec<C2: MessageCodec>(self, codec: C2) -> MessagingServiceBuilder<P, C2> {
        MessagingServiceBuilder {
            cfg: self.cfg,
            providers: self.providers,
            codec,
            locality: self.locality,
            membership: self.membership,
            preferred_ip_store: self.preferred_ip_store,
        }
    }

    /// Attach the locality oracle used for dc/rack selection.
    pub fn with_locality(mut self, locality: Rc<dyn LocalityOracle>) -> Self {
        self.locality = locality;
        self
    }

    /// Attach the membership oracle consulted by the retry wrapper.
    pub fn with_membership(mut self, membership: Rc<dyn MembershipOracle>) -> Self {
        self.membership = membership;
        self
    }

    /// Attach the persisted preferred-IP store.
    pub fn with_preferred_ip_store(mut self, store: Rc<dyn PreferredIpStore>) -> Self {
        self.preferred_ip_store = store;
        self
    }

    /// Construct the service without touching the network.
    ///
    /// Installs the CLIENT_ID handler so inbound connections get their
    /// caller identity attached.
    pub fn build(self) -> Rc<MessagingService<P, C>> {
        let service = Rc::new(MessagingService {
            cfg: self.cfg,
            providers: self.providers,
            codec: self.codec,
            locality: self.locality,
            membership: self.membership,
            preferred_ip_store: self.preferred_ip_store,
            handlers: Rc::new(HandlerTable::new()),
            clients: [
                RefCell::new(HashMap::new()),
                RefCell::new(HashMap::new()),
            ],
            servers: RefCell::new([None, None]),
            tls_servers: RefCell::new([None, None]),
            preferred_ips: RefCell::new(HashMap::new()),
            dropped: RefCell::new([0; Verb::COUNT]),
            stopping: Cell::new(false),
            stop_notify: Notify::new(),
        });

        let codec = service.codec.clone();
        service.handlers.register(
            Verb::ClientId,
            Rc::new(move |info: Rc<ClientInfo>, payload: Vec<u8>| {
                let codec = codec.clone();
                Box::pin(async move {
                    let source: SourceInfo = codec.decode(&payload).map_err(RpcError::from)?;
                    info.attach_source(source);
                    Ok(None)
                })
            }),
        );

        service
    }

    /// Construct the service and, when `listen_now` is set, bring the
    /// listeners up before returning.
    ///
    /// # Errors
    ///
    /// [`RpcError::Io`] when a listener cannot be bound.
    pub async fn start(self) -> Result<Rc<MessagingService<P, C>>, RpcError> {
        let listen_now = self.cfg.listen_now;
        let service = self.build();
        if listen_now {
            service.start_listen().await?;
        }
        Ok(service)
    }
}

impl<P: Providers, C: MessageCodec> MessagingService<P, C> {
    /// The configured plain-TCP port.
    pub fn port(&self) -> u16 {
        self.cfg.port
    }

    /// The configured listen address.
    pub fn listen_address(&self) -> IpAddr {
        self.cfg.listen_address
    }

    /// The service configuration.
    pub fn config(&self) -> &MessagingConfig {
        &self.cfg
    }

    /// Whether shutdown has begun. Once set it is never cleared.
    pub fn is_stopping(&self) -> bool {
        self.stopping.get()
    }

    pub(crate) fn codec(&self) -> &C {
        &self.codec
    }

    pub(crate) fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub(crate) fn time(&self) -> &P::Time {
        self.providers.time()
    }

    // ── Versioning ──────────────────────────────────────────────────

    /// Wire protocol version spoken by this node.
    pub const CURRENT_VERSION: i32 = 0;

    /// The protocol version of a peer.
    pub fn get_raw_version(&self, _endpoint: IpAddr) -> i32 {
        // TODO: per-endpoint version tracking once rolling upgrades need it
        Self::CURRENT_VERSION
    }

    /// Whether the peer's protocol version is known.
    pub fn knows_version(&self, _endpoint: IpAddr) -> bool {
        true
    }

    // ── Handler registry ────────────────────────────────────────────

    /// The caller identity attached to an inbound connection by the
    /// CLIENT_ID handshake.
    pub fn get_source(cinfo: &ClientInfo) -> Option<PeerAddr> {
        cinfo
            .source()
            .map(|s| PeerAddr::new(s.broadcast_address, s.src_cpu_id))
    }

    // ── Dropped-message accounting ──────────────────────────────────

    pub(crate) fn increment_dropped_messages(&self, verb: Verb) {
        self.dropped.borrow_mut()[verb.index()] += 1;
    }

    /// Messages of this verb dropped since startup.
    pub fn get_dropped_messages(&self, verb: Verb) -> u64 {
        self.dropped.borrow()[verb.index()]
    }

    /// Snapshot of all per-verb dropped-message counters.
    pub fn dropped_messages(&self) -> [u64; Verb::COUNT] {
        *self.dropped.borrow()
    }

    // ── Preferred-IP cache ──────────────────────────────────────────

    /// The address to dial for an endpoint.
    ///
    /// Returns the cached preferred (intra-DC) address when the endpoint
    /// has one and resides in this node's datacenter; otherwise the
    /// endpoint itself.
    pub fn get_preferred_ip(&self, endpoint: IpAddr) -> IpAddr {
        if let Some(alternate) = self.preferred_ips.borrow().get(&endpoint) {
            let own = self.cfg.broadcast_address();
            if let (Some(peer_dc), Some(own_dc)) = (
                self.locality.datacenter(endpoint),
                self.locality.datacenter(own),
            ) {
                if peer_dc == own_dc {
                    return *alternate;
                }
            }
        }
        endpoint
    }

    /// Load the persisted preferred-IP map and reset connections to every
    /// endpoint that has an entry, so they reopen on the preferred path.
    pub async fn init_preferred_ip_cache(self: &Rc<Self>) -> Result<(), RpcError> {
        let cache = self.preferred_ip_store.load().await?;
        let endpoints: Vec<IpAddr> = cache.keys().copied().collect();
        *self.preferred_ips.borrow_mut() = cache;
        for endpoint in endpoints {
            self.remove_rpc_client(PeerAddr::from_ip(endpoint));
        }
        Ok(())
    }

    /// Record a preferred address for an endpoint and invalidate its
    /// connections.
    pub fn cache_preferred_ip(self: &Rc<Self>, endpoint: IpAddr, preferred: IpAddr) {
        self.preferred_ips.borrow_mut().insert(endpoint, preferred);
        self.remove_rpc_client(PeerAddr::from_ip(endpoint));
    }

    // ── Client registry ─────────────────────────────────────────────

    /// Connection selection policy for a peer.
    fn must_encrypt(&self, peer: IpAddr) -> bool {
        match self.cfg.encrypt_what {
            EncryptWhat::None => false,
            EncryptWhat::All => true,
            EncryptWhat::Dc => self.crosses_boundary(peer, |oracle, ip| oracle.datacenter(ip)),
            EncryptWhat::Rack => self.crosses_boundary(peer, |oracle, ip| oracle.rack(ip)),
        }
    }

    fn must_compress(&self, peer: IpAddr) -> bool {
        match self.cfg.compress_what {
            CompressWhat::None => false,
            CompressWhat::All => true,
            // when the oracle cannot place the peer, compress anyway
            CompressWhat::Dc => {
                let own = self.cfg.broadcast_address();
                match (self.locality.datacenter(peer), self.locality.datacenter(own)) {
                    (Some(peer_dc), Some(own_dc)) => peer_dc != own_dc,
                    _ => true,
                }
            }
        }
    }

    /// Whether the peer is in a different locality bucket than this node.
    /// An unanswerable oracle reads as "same bucket".
    fn crosses_boundary(
        &self,
        peer: IpAddr,
        bucket: impl Fn(&dyn LocalityOracle, IpAddr) -> Option<String>,
    ) -> bool {
        let own = self.cfg.broadcast_address();
        match (
            bucket(self.locality.as_ref(), peer),
            bucket(self.locality.as_ref(), own),
        ) {
            (Some(peer_bucket), Some(own_bucket)) => peer_bucket != own_bucket,
            _ => false,
        }
    }

    /// A healthy client for `(pool(verb), peer)`, created if absent.
    ///
    /// A cached client whose handle reports an error is evicted and
    /// replaced. The returned handle is shared: it stays valid for the
    /// whole call even if the entry is evicted concurrently.
    ///
    /// # Errors
    ///
    /// [`RpcError::Closed`] when the service is stopping.
    pub fn get_rpc_client(
        self: &Rc<Self>,
        verb: Verb,
        id: PeerAddr,
    ) -> Result<Rc<ClientOf<P>>, RpcError> {
        if self.is_stopping() {
            return Err(RpcError::Closed);
        }
        let idx = rpc_client_index(verb);

        if let Some(entry) = self.clients[idx].borrow().get(&id) {
            if !entry.rpc_client.is_error() {
                return Ok(entry.rpc_client.clone());
            }
        }
        // evict the dead entry (if any) before dialing anew
        self.remove_error_rpc_client(verb, id);

        let must_encrypt = self.must_encrypt(id.ip);
        let must_compress = self.must_compress(id.ip);
        let remote_ip = self.get_preferred_ip(id.ip);
        let port = if must_encrypt {
            self.cfg.ssl_port
        } else {
            self.cfg.port
        };

        let opts = ClientOptions {
            remote: SocketAddr::new(remote_ip, port),
            local_ip: Some(self.cfg.listen_address),
            keepalive: Some(KeepaliveParams::default()),
            compress: must_compress,
            tls: must_encrypt,
            identity: SourceInfo {
                broadcast_address: self.cfg.broadcast_address(),
                src_cpu_id: self.cfg.shard,
                max_result_size: self.cfg.max_result_size,
            },
        };

        let client = Rc::new(self.providers.rpc().connect(opts));
        self.clients[idx].borrow_mut().insert(
            id,
            ClientEntry {
                rpc_client: client.clone(),
            },
        );
        Ok(client)
    }

    fn remove_rpc_client_one(self: &Rc<Self>, idx: usize, id: PeerAddr, dead_only: bool) {
        if self.is_stopping() {
            // all entries are being stopped by the shutdown path already
            return;
        }
        let entry = {
            let mut clients = self.clients[idx].borrow_mut();
            match clients.get(&id) {
                Some(e) if !dead_only || e.rpc_client.is_error() => clients.remove(&id),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            // stop the evicted client in the background, holding the
            // service alive until the stop completes
            let service = self.clone();
            self.providers.task().spawn_task("drop_rpc_client", async move {
                entry.rpc_client.stop().await;
                tracing::debug!(peer = %id, "dropped connection");
                drop(service);
            });
        }
    }

    /// Evict the client for `(pool(verb), peer)` if its handle is in the
    /// error state.
    pub fn remove_error_rpc_client(self: &Rc<Self>, verb: Verb, id: PeerAddr) {
        self.remove_rpc_client_one(rpc_client_index(verb), id, true);
    }

    /// Evict the peer's clients in every pool (peer removed from the
    /// cluster, or its preferred address changed).
    pub fn remove_rpc_client(self: &Rc<Self>, id: PeerAddr) {
        for idx in 0..CONNECTION_POOL_COUNT {
            self.remove_rpc_client_one(idx, id, false);
        }
    }

    /// Visit every cached client with its peer address and stats.
    pub fn foreach_client(&self, mut f: impl FnMut(&PeerAddr, ConnectionStats)) {
        for pool in &self.clients {
            for (id, entry) in pool.borrow().iter() {
                f(id, entry.stats());
            }
        }
    }

    /// Whether a client is cached for `(pool(verb), peer)`.
    pub fn has_rpc_client(&self, verb: Verb, id: PeerAddr) -> bool {
        self.clients[rpc_client_index(verb)].borrow().contains_key(&id)
    }

    // ── Server registry ─────────────────────────────────────────────

    async fn listen_on(
        &self,
        ip: IpAddr,
        port: u16,
        tls: bool,
    ) -> Result<Rc<ServerOf<P>>, RpcError> {
        let opts = ServerOptions {
            bind: SocketAddr::new(ip, port),
            compress: self.cfg.compress_what != CompressWhat::None,
            tls,
            limits: rpc_resource_limits(self.cfg.memory_budget),
        };
        let server = self.providers.rpc().listen(opts, self.handlers.clone()).await?;
        Ok(Rc::new(server))
    }

    /// Bring the listeners up. Idempotent: already-running listener
    /// groups are left untouched.
    ///
    /// # Errors
    ///
    /// [`RpcError::Io`] when an address cannot be bound.
    pub async fn start_listen(self: &Rc<Self>) -> Result<(), RpcError> {
        let listen_to_bc = self.cfg.should_listen_to_broadcast_address
            && self.cfg.broadcast_address() != self.cfg.listen_address;

        if self.servers.borrow()[0].is_none() {
            let primary = self.listen_on(self.cfg.listen_address, self.cfg.port, false).await?;
            let broadcast = if listen_to_bc {
                Some(
                    self.listen_on(self.cfg.broadcast_address(), self.cfg.port, false)
                        .await?,
                )
            } else {
                None
            };
            let mut servers = self.servers.borrow_mut();
            servers[0] = Some(primary);
            servers[1] = broadcast;
        }

        if self.cfg.encrypt_what != EncryptWhat::None && self.tls_servers.borrow()[0].is_none() {
            let primary = self
                .listen_on(self.cfg.listen_address, self.cfg.ssl_port, true)
                .await?;
            let broadcast = if listen_to_bc {
                Some(
                    self.listen_on(self.cfg.broadcast_address(), self.cfg.ssl_port, true)
                        .await?,
                )
            } else {
                None
            };
            let mut servers = self.tls_servers.borrow_mut();
            servers[0] = Some(primary);
            servers[1] = broadcast;
        }

        // only the leader shard logs, to avoid one line per cpu
        if self.cfg.is_leader_shard() {
            if self.tls_servers.borrow()[0].is_some() {
                tracing::info!(port = self.cfg.ssl_port, "starting encrypted messaging service");
            }
            tracing::info!(port = self.cfg.port, "starting messaging service");
        }
        Ok(())
    }

    /// The bound address of the primary plain listener, once listening.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.servers.borrow()[0].as_ref().and_then(|s| s.local_addr())
    }

    /// Visit every inbound connection of every listener with its stats.
    pub fn foreach_server_connection_stats(
        &self,
        mut f: impl FnMut(&ClientInfo, &ConnectionStats),
    ) {
        for group in [&self.servers, &self.tls_servers] {
            for server in group.borrow().iter().flatten() {
                server.foreach_connection(&mut f);
            }
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    async fn stop_server_group(group: &RefCell<[Option<Rc<ServerOf<P>>>; 2]>) {
        let taken: Vec<_> = {
            let mut servers = group.borrow_mut();
            servers.iter_mut().filter_map(|s| s.take()).collect()
        };
        for server in taken {
            server.stop().await;
        }
    }

    async fn stop_nontls_server(&self) {
        Self::stop_server_group(&self.servers).await;
    }

    async fn stop_tls_server(&self) {
        Self::stop_server_group(&self.tls_servers).await;
    }

    async fn stop_client(&self) {
        // fan the stops out across all pools and peers, then wait for all
        let mut handles = Vec::new();
        for pool in &self.clients {
            for entry in pool.borrow().values() {
                let client = entry.rpc_client.clone();
                handles.push(
                    self.providers
                        .task()
                        .spawn_task("stop_rpc_client", async move {
                            client.stop().await;
                        }),
                );
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Shut the service down.
    ///
    /// Sets `stopping` (new sends fail with [`RpcError::Closed`]), wakes
    /// every retry wait, then stops the plain listeners, the TLS
    /// listeners and all clients concurrently. Resolves once everything
    /// has stopped; the service may be dropped afterwards.
    pub async fn stop(self: &Rc<Self>) {
        self.stopping.set(true);
        self.stop_notify.notify_waiters();
        tokio::join!(
            self.stop_nontls_server(),
            self.stop_tls_server(),
            self.stop_client(),
        );
        tracing::debug!(shard = self.cfg.shard, "messaging service stopped");
    }

    /// Sleep that is cut short by [`stop`](Self::stop).
    ///
    /// # Errors
    ///
    /// [`RpcError::Closed`] when the service stops before or during the
    /// sleep.
    pub(crate) async fn sleep_abortable(&self, wait: Duration) -> Result<(), RpcError> {
        use internode_core::TimeProvider;

        let mut stopped = std::pin::pin!(self.stop_notify.notified());
        stopped.as_mut().enable();
        if self.is_stopping() {
            return Err(RpcError::Closed);
        }
        tokio::select! {
            _ = self.time().sleep(wait) => Ok(()),
            _ = stopped => Err(RpcError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_pool_partition() {
        let control = [
            Verb::GossipDigestSyn,
            Verb::GossipDigestAck2,
            Verb::GossipShutdown,
            Verb::GossipEcho,
        ];
        for verb in control {
            assert_eq!(rpc_client_index(verb), POOL_CONTROL, "{verb}");
        }
        for verb in Verb::ALL {
            if !control.contains(&verb) {
                assert_eq!(rpc_client_index(verb), POOL_DEFAULT, "{verb}");
            }
        }
    }

    #[test]
    fn test_gossip_digest_ack_is_data_path() {
        // the middle ack carries application state and rides the default
        // pool, matching the partition of the other two rounds' senders
        assert_eq!(rpc_client_index(Verb::GossipDigestAck), POOL_DEFAULT);
    }
}
