//! The typed send pipeline and per-verb wrappers.
//!
//! Three public shapes: [`send`](MessagingService::send) (await the
//! reply), [`send_with_timeout`](MessagingService::send_with_timeout)
//! (deadline-bounded) and [`send_oneway`](MessagingService::send_oneway)
//! (fire-and-forget). All of them:
//!
//! 1. short-circuit with [`RpcError::Closed`] while the service is
//!    stopping, without touching the connection pools;
//! 2. acquire the peer's client from the registry (dialing lazily);
//! 3. invoke the typed stub while holding shared references to the
//!    client handle and the service, so neither dies mid-call;
//! 4. on failure, bump the verb's dropped-message counter exactly once
//!    and, for transport errors only, evict the client from its pool.
//!
//! The per-verb wrappers at the bottom mirror the gossip surface:
//! register/unregister a handler and a typed send per verb. Payload
//! schemas stay with the subsystems that own them; wrappers are generic
//! over any serde payload.

use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use internode_core::{
    ClientInfo, MessageCodec, PeerAddr, Providers, RpcClient, RpcError, Verb, VerbHandler,
};

use crate::service::MessagingService;

/// Deadline applied to gossip echo probes.
const GOSSIP_ECHO_TIMEOUT: Duration = Duration::from_secs(3);

impl<P: Providers, C: MessageCodec> MessagingService<P, C> {
    async fn send_bytes(
        self: &Rc<Self>,
        verb: Verb,
        id: PeerAddr,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RpcError> {
        if self.is_stopping() {
            return Err(RpcError::Closed);
        }
        let client = self.get_rpc_client(verb, id)?;
        // the clones keep the handle and the service alive for the whole
        // call, even if the pool entry is evicted meanwhile
        let service = self.clone();
        match client.call(verb, payload, timeout).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                service.increment_dropped_messages(verb);
                if e.is_transport() {
                    service.remove_error_rpc_client(verb, id);
                }
                Err(e)
            }
        }
    }

    /// Send a request and await the typed reply.
    ///
    /// # Errors
    ///
    /// Failures propagate unchanged; see [`RpcError`] for the taxonomy.
    pub async fn send<Req, Rsp>(
        self: &Rc<Self>,
        verb: Verb,
        id: PeerAddr,
        msg: &Req,
    ) -> Result<Rsp, RpcError>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let payload = self.codec().encode(msg)?;
        let reply = self.send_bytes(verb, id, payload, None).await?;
        Ok(self.codec().decode(&reply)?)
    }

    /// Send a request with a per-call deadline and await the typed reply.
    ///
    /// # Errors
    ///
    /// [`RpcError::Timeout`] when the deadline elapses; other failures
    /// propagate unchanged.
    pub async fn send_with_timeout<Req, Rsp>(
        self: &Rc<Self>,
        verb: Verb,
        id: PeerAddr,
        timeout: Duration,
        msg: &Req,
    ) -> Result<Rsp, RpcError>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let payload = self.codec().encode(msg)?;
        let reply = self.send_bytes(verb, id, payload, Some(timeout)).await?;
        Ok(self.codec().decode(&reply)?)
    }

    /// Send a one-way message; resolves once the message is handed to the
    /// connection.
    ///
    /// # Errors
    ///
    /// [`RpcError::Closed`] when the service is stopping or the
    /// connection is down.
    pub async fn send_oneway<Req>(
        self: &Rc<Self>,
        verb: Verb,
        id: PeerAddr,
        msg: &Req,
    ) -> Result<(), RpcError>
    where
        Req: Serialize,
    {
        if self.is_stopping() {
            return Err(RpcError::Closed);
        }
        let payload = self.codec().encode(msg)?;
        let client = self.get_rpc_client(verb, id)?;
        let service = self.clone();
        match client.notify(verb, payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                service.increment_dropped_messages(verb);
                if e.is_transport() {
                    service.remove_error_rpc_client(verb, id);
                }
                Err(e)
            }
        }
    }

    // ── Handler registration ────────────────────────────────────────

    /// Install a request-response handler for a verb.
    ///
    /// The handler receives the caller's connection info and the decoded
    /// request; its reply is encoded back to the caller. Errors are
    /// reported to the caller as remote handler errors.
    pub fn register_handler<Req, Rsp, F, Fut>(&self, verb: Verb, f: F)
    where
        Req: DeserializeOwned + 'static,
        Rsp: Serialize + 'static,
        F: Fn(Rc<ClientInfo>, Req) -> Fut + 'static,
        Fut: Future<Output = Result<Rsp, RpcError>> + 'static,
    {
        let codec = self.codec().clone();
        let f = Rc::new(f);
        let handler: VerbHandler = Rc::new(move |info, payload| {
            let codec = codec.clone();
            let f = f.clone();
            Box::pin(async move {
                let request: Req = codec.decode(&payload).map_err(RpcError::from)?;
                let reply = f(info, request).await?;
                let encoded = codec.encode(&reply).map_err(RpcError::from)?;
                Ok(Some(encoded))
            })
        });
        self.handlers().register(verb, handler);
    }

    /// Install a no-reply handler for a verb.
    pub fn register_oneway_handler<Req, F, Fut>(&self, verb: Verb, f: F)
    where
        Req: DeserializeOwned + 'static,
        F: Fn(Rc<ClientInfo>, Req) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let codec = self.codec().clone();
        let f = Rc::new(f);
        let handler: VerbHandler = Rc::new(move |info, payload| {
            let codec = codec.clone();
            let f = f.clone();
            Box::pin(async move {
                let request: Req = codec.decode(&payload).map_err(RpcError::from)?;
                f(info, request).await;
                Ok(None)
            })
        });
        self.handlers().register(verb, handler);
    }

    /// Remove the handler for a verb. No-op when none is installed.
    pub fn unregister_handler(&self, verb: Verb) {
        self.handlers().unregister(verb);
    }

    /// Whether a handler is installed for a verb.
    pub fn has_handler(&self, verb: Verb) -> bool {
        self.handlers().is_registered(verb)
    }

    // ── Gossip verbs ────────────────────────────────────────────────

    /// Register the liveness-probe handler.
    pub fn register_gossip_echo<F, Fut>(&self, f: F)
    where
        F: Fn(Rc<ClientInfo>) -> Fut + 'static,
        Fut: Future<Output = Result<(), RpcError>> + 'static,
    {
        self.register_handler(Verb::GossipEcho, move |info, (): ()| f(info));
    }

    /// Remove the liveness-probe handler.
    pub fn unregister_gossip_echo(&self) {
        self.unregister_handler(Verb::GossipEcho);
    }

    /// Probe a peer's liveness; bounded to three seconds.
    pub async fn send_gossip_echo(self: &Rc<Self>, id: PeerAddr) -> Result<(), RpcError> {
        self.send_with_timeout(Verb::GossipEcho, id, GOSSIP_ECHO_TIMEOUT, &())
            .await
    }

    /// Register the shutdown-announcement handler.
    pub fn register_gossip_shutdown<M, F, Fut>(&self, f: F)
    where
        M: DeserializeOwned + 'static,
        F: Fn(Rc<ClientInfo>, M) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.register_oneway_handler(Verb::GossipShutdown, f);
    }

    /// Remove the shutdown-announcement handler.
    pub fn unregister_gossip_shutdown(&self) {
        self.unregister_handler(Verb::GossipShutdown);
    }

    /// Announce this node's shutdown to a peer.
    pub async fn send_gossip_shutdown<M: Serialize>(
        self: &Rc<Self>,
        id: PeerAddr,
        from: &M,
    ) -> Result<(), RpcError> {
        self.send_oneway(Verb::GossipShutdown, id, from).await
    }

    /// Register the gossip SYN handler.
    pub fn register_gossip_digest_syn<M, F, Fut>(&self, f: F)
    where
        M: DeserializeOwned + 'static,
        F: Fn(Rc<ClientInfo>, M) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.register_oneway_handler(Verb::GossipDigestSyn, f);
    }

    /// Remove the gossip SYN handler.
    pub fn unregister_gossip_digest_syn(&self) {
        self.unregister_handler(Verb::GossipDigestSyn);
    }

    /// Open a gossip round with a peer.
    pub async fn send_gossip_digest_syn<M: Serialize>(
        self: &Rc<Self>,
        id: PeerAddr,
        msg: &M,
    ) -> Result<(), RpcError> {
        self.send_oneway(Verb::GossipDigestSyn, id, msg).await
    }

    /// Register the gossip ACK handler.
    pub fn register_gossip_digest_ack<M, F, Fut>(&self, f: F)
    where
        M: DeserializeOwned + 'static,
        F: Fn(Rc<ClientInfo>, M) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.register_oneway_handler(Verb::GossipDigestAck, f);
    }

    /// Remove the gossip ACK handler.
    pub fn unregister_gossip_digest_ack(&self) {
        self.unregister_handler(Verb::GossipDigestAck);
    }

    /// Answer a gossip SYN.
    pub async fn send_gossip_digest_ack<M: Serialize>(
        self: &Rc<Self>,
        id: PeerAddr,
        msg: &M,
    ) -> Result<(), RpcError> {
        self.send_oneway(Verb::GossipDigestAck, id, msg).await
    }

    /// Register the gossip ACK2 handler.
    pub fn register_gossip_digest_ack2<M, F, Fut>(&self, f: F)
    where
        M: DeserializeOwned + 'static,
        F: Fn(Rc<ClientInfo>, M) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.register_oneway_handler(Verb::GossipDigestAck2, f);
    }

    /// Remove the gossip ACK2 handler.
    pub fn unregister_gossip_digest_ack2(&self) {
        self.unregister_handler(Verb::GossipDigestAck2);
    }

    /// Close a gossip round with a peer.
    pub async fn send_gossip_digest_ack2<M: Serialize>(
        self: &Rc<Self>,
        id: PeerAddr,
        msg: &M,
    ) -> Result<(), RpcError> {
        self.send_oneway(Verb::GossipDigestAck2, id, msg).await
    }
}
