//! Retry wrapper for long-running streaming verbs.
//!
//! Streaming transfers ride ordinary request-response verbs but survive
//! transient connection loss: a transport failure is retried after a
//! wait, while a timeout or an application error aborts immediately (a
//! ten-minute RPC that timed out will not do better on a second try; the
//! layer above decides). Retrying also stops when the service shuts down
//! or when the membership oracle no longer knows the peer.

use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use internode_core::{MessageCodec, PeerAddr, Providers, RpcError, Verb};

use crate::service::MessagingService;

/// Attempts before giving up on a streaming verb.
///
/// Together with the timeout and the wait, a streaming transfer gives up
/// after 10×30 s + 10×600 s (15 minutes) at most and 10×30 s at least.
pub const STREAMING_NR_RETRY: u32 = 10;

/// Per-attempt deadline for streaming verbs.
pub const STREAMING_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Wait between streaming attempts.
pub const STREAMING_WAIT_BEFORE_RETRY: Duration = Duration::from_secs(30);

impl<P: Providers, C: MessageCodec> MessagingService<P, C> {
    /// Send with a per-attempt deadline, retrying transport failures.
    ///
    /// Retries stop when the attempts are exhausted, the service is
    /// stopping, or the peer is no longer a known endpoint; the wait
    /// between attempts is cut short by [`stop`](MessagingService::stop).
    ///
    /// # Errors
    ///
    /// The final attempt's error: [`RpcError::Closed`] after exhausted or
    /// abandoned retries, [`RpcError::Timeout`] and application errors
    /// immediately.
    pub async fn send_with_retry<Req, Rsp>(
        self: &Rc<Self>,
        verb: Verb,
        id: PeerAddr,
        timeout: Duration,
        nr_retry: u32,
        wait: Duration,
        msg: &Req,
    ) -> Result<Rsp, RpcError>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let mut retry = nr_retry;
        loop {
            match self.send_with_timeout(verb, id, timeout, msg).await {
                Ok(reply) => {
                    if retry != nr_retry {
                        tracing::info!(%verb, peer = %id, retry, "retry succeeded");
                    }
                    return Ok(reply);
                }
                Err(RpcError::Timeout) => {
                    tracing::info!(
                        %verb,
                        peer = %id,
                        retry,
                        timeout_secs = timeout.as_secs(),
                        "timed out, not retrying"
                    );
                    return Err(RpcError::Timeout);
                }
                Err(e @ RpcError::Closed) => {
                    tracing::info!(%verb, peer = %id, retry, error = %e, "transport failure");
                    retry = retry.saturating_sub(1);
                    if retry == 0 {
                        tracing::debug!(%verb, peer = %id, "stop retrying: attempts exhausted");
                        return Err(e);
                    }
                    if self.is_stopping() {
                        tracing::debug!(%verb, peer = %id, "stop retrying: messaging service is stopped");
                        return Err(e);
                    }
                    if !self.membership.is_known_endpoint(id.ip) {
                        tracing::debug!(%verb, peer = %id, "stop retrying: node is removed from the cluster");
                        return Err(e);
                    }
                    self.sleep_abortable(wait).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Transfer a mutation batch with streaming retry semantics.
    pub async fn send_stream_mutation<Req, Rsp>(
        self: &Rc<Self>,
        id: PeerAddr,
        msg: &Req,
    ) -> Result<Rsp, RpcError>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        self.send_with_retry(
            Verb::StreamMutation,
            id,
            STREAMING_TIMEOUT,
            STREAMING_NR_RETRY,
            STREAMING_WAIT_BEFORE_RETRY,
            msg,
        )
        .await
    }

    /// Signal replication completion with streaming retry semantics.
    pub async fn send_replication_finished<Req>(
        self: &Rc<Self>,
        id: PeerAddr,
        msg: &Req,
    ) -> Result<(), RpcError>
    where
        Req: Serialize,
    {
        self.send_with_retry(
            Verb::ReplicationFinished,
            id,
            STREAMING_TIMEOUT,
            STREAMING_NR_RETRY,
            STREAMING_WAIT_BEFORE_RETRY,
            msg,
        )
        .await
    }
}
