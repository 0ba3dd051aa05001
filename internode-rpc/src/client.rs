//! Outbound RPC client.
//!
//! A [`TcpRpcClient`] is constructed synchronously; the dial (and the TLS
//! handshake, when enabled) happens in a background connection task.
//! Messages issued before the connection is up are queued in order behind
//! the two handshake frames the connection always opens with: the Hello
//! compression offer and the CLIENT_ID identity announce.
//!
//! Requests carry a per-connection sequence number; a correlation map of
//! oneshot senders pairs them with replies, so responses may complete out
//! of order while send order on the wire is preserved. Any transport
//! failure latches the error flag, fails every pending call with
//! [`RpcError::Closed`], and leaves the client for its owner to evict.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, ReadHalf};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

use internode_core::{
    ClientOptions, ConnectionStats, KeepaliveParams, RpcClient, RpcError, TaskProvider,
    TimeProvider, TokioTaskProvider, TokioTimeProvider, Verb,
};

use crate::compress::{Compressor, CompressorFactory};
use crate::conn::{BoxedStream, read_frame, write_frame};
use crate::tls::TlsContext;
use crate::wire::{Frame, FrameKind};

/// One outbound connection to a peer, produced by
/// [`TcpRpcProvider::connect`](crate::TcpRpcProvider).
pub struct TcpRpcClient {
    shared: Rc<ClientShared>,
}

struct ClientShared {
    opts: ClientOptions,
    factory: CompressorFactory,
    time: TokioTimeProvider,
    stats: RefCell<ConnectionStats>,
    error: Cell<bool>,
    stopped: Cell<bool>,
    /// Time of the last byte received, for keepalive idle detection.
    last_rx: Cell<Duration>,
    /// Set once the HelloAck picks an algorithm; used by both directions.
    compressor: RefCell<Option<Rc<dyn Compressor>>>,
    pending: RefCell<HashMap<u64, oneshot::Sender<Result<Vec<u8>, RpcError>>>>,
    next_seq: Cell<u64>,
    writer_tx: RefCell<Option<mpsc::UnboundedSender<Frame>>>,
    shutdown: Notify,
    conn_handle: RefCell<Option<JoinHandle<()>>>,
    reader_handle: RefCell<Option<JoinHandle<()>>>,
    keepalive_handle: RefCell<Option<JoinHandle<()>>>,
}

impl TcpRpcClient {
    /// Start a client: spawn the background connection task and return.
    pub(crate) fn start(
        opts: ClientOptions,
        identity_payload: Vec<u8>,
        factory: CompressorFactory,
        tls: Option<TlsContext>,
        time: TokioTimeProvider,
        task: TokioTaskProvider,
    ) -> Self {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let now = time.now();
        let shared = Rc::new(ClientShared {
            opts,
            factory,
            time,
            stats: RefCell::new(ConnectionStats::default()),
            error: Cell::new(false),
            stopped: Cell::new(false),
            last_rx: Cell::new(now),
            compressor: RefCell::new(None),
            pending: RefCell::new(HashMap::new()),
            next_seq: Cell::new(0),
            writer_tx: RefCell::new(Some(writer_tx)),
            shutdown: Notify::new(),
            conn_handle: RefCell::new(None),
            reader_handle: RefCell::new(None),
            keepalive_handle: RefCell::new(None),
        });

        let handle = task.spawn_task(
            "rpc_client_connection",
            connection_task(shared.clone(), writer_rx, identity_payload, tls, task.clone()),
        );
        shared.conn_handle.borrow_mut().replace(handle);

        Self { shared }
    }

    /// A client that is already in the error state (construction failed
    /// before any connection attempt).
    pub(crate) fn start_failed(opts: ClientOptions, time: TokioTimeProvider) -> Self {
        let now = time.now();
        let shared = Rc::new(ClientShared {
            opts,
            factory: CompressorFactory::new(),
            time,
            stats: RefCell::new(ConnectionStats::default()),
            error: Cell::new(true),
            stopped: Cell::new(false),
            last_rx: Cell::new(now),
            compressor: RefCell::new(None),
            pending: RefCell::new(HashMap::new()),
            next_seq: Cell::new(0),
            writer_tx: RefCell::new(None),
            shutdown: Notify::new(),
            conn_handle: RefCell::new(None),
            reader_handle: RefCell::new(None),
            keepalive_handle: RefCell::new(None),
        });
        Self { shared }
    }

    /// The address this client dials.
    pub fn remote(&self) -> SocketAddr {
        self.shared.opts.remote
    }

    fn enqueue(&self, frame: Frame) -> Result<(), RpcError> {
        let sent = self
            .shared
            .writer_tx
            .borrow()
            .as_ref()
            .map(|tx| tx.send(frame).is_ok())
            .unwrap_or(false);
        if sent { Ok(()) } else { Err(RpcError::Closed) }
    }
}

#[async_trait(?Send)]
impl RpcClient for TcpRpcClient {
    async fn call(
        &self,
        verb: Verb,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RpcError> {
        let shared = &self.shared;
        if shared.stopped.get() || shared.error.get() {
            return Err(RpcError::Closed);
        }

        let seq = shared.next_seq.get() + 1;
        shared.next_seq.set(seq);
        let (tx, rx) = oneshot::channel();
        shared.pending.borrow_mut().insert(seq, tx);

        if let Err(e) = self.enqueue(Frame::new(FrameKind::Request, verb.as_u32(), seq, payload)) {
            shared.pending.borrow_mut().remove(&seq);
            return Err(e);
        }
        shared.stats.borrow_mut().requests_sent += 1;

        let reply = async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(RpcError::Closed),
            }
        };
        match timeout {
            Some(deadline) => match shared.time.timeout(deadline, reply).await {
                Ok(result) => result,
                Err(_) => {
                    // abandon the correlation slot; a late reply is dropped
                    shared.pending.borrow_mut().remove(&seq);
                    Err(RpcError::Timeout)
                }
            },
            None => reply.await,
        }
    }

    async fn notify(&self, verb: Verb, payload: Vec<u8>) -> Result<(), RpcError> {
        let shared = &self.shared;
        if shared.stopped.get() || shared.error.get() {
            return Err(RpcError::Closed);
        }
        self.enqueue(Frame::new(FrameKind::OneWay, verb.as_u32(), 0, payload))?;
        shared.stats.borrow_mut().requests_sent += 1;
        Ok(())
    }

    fn is_error(&self) -> bool {
        self.shared.error.get()
    }

    fn stats(&self) -> ConnectionStats {
        *self.shared.stats.borrow()
    }

    async fn stop(&self) {
        let shared = &self.shared;
        if shared.stopped.replace(true) {
            return;
        }
        // wake a dial still in progress, let the writer drain and exit
        shared.shutdown.notify_one();
        shared.writer_tx.borrow_mut().take();

        if let Some(handle) = shared.keepalive_handle.borrow_mut().take() {
            handle.abort();
        }
        let conn = shared.conn_handle.borrow_mut().take();
        if let Some(handle) = conn {
            let _ = handle.await;
        }
        let reader = shared.reader_handle.borrow_mut().take();
        if let Some(handle) = reader {
            handle.abort();
            let _ = handle.await;
        }

        fail_pending(shared);
        tracing::debug!(remote = %shared.opts.remote, "rpc client stopped");
    }
}

/// Latch the error flag and fail every pending call.
fn mark_failed(shared: &Rc<ClientShared>) {
    if shared.error.replace(true) {
        return;
    }
    fail_pending(shared);
}

fn fail_pending(shared: &ClientShared) {
    let pending: Vec<_> = shared
        .pending
        .borrow_mut()
        .drain()
        .map(|(_, tx)| tx)
        .collect();
    for tx in pending {
        let _ = tx.send(Err(RpcError::Closed));
    }
}

async fn connection_task(
    shared: Rc<ClientShared>,
    mut writer_rx: mpsc::UnboundedReceiver<Frame>,
    identity_payload: Vec<u8>,
    tls: Option<TlsContext>,
    task: TokioTaskProvider,
) {
    let stream = tokio::select! {
        result = dial(&shared.opts, tls.as_ref()) => match result {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(remote = %shared.opts.remote, error = %e, "dial failed");
                mark_failed(&shared);
                return;
            }
        },
        _ = shared.shutdown.notified() => return,
    };
    if shared.stopped.get() {
        return;
    }
    tracing::debug!(remote = %shared.opts.remote, tls = shared.opts.tls, "connected");

    let (read_half, mut write_half) = tokio::io::split(stream);

    // handshake frames precede everything queued behind them
    let offer = if shared.opts.compress {
        shared.factory.supported_mask()
    } else {
        0
    };
    let hello = Frame::new(FrameKind::Hello, 0, 0, offer.to_le_bytes().to_vec());
    let client_id = Frame::new(
        FrameKind::OneWay,
        Verb::ClientId.as_u32(),
        0,
        identity_payload,
    );
    for frame in [hello, client_id] {
        match write_frame(&mut write_half, frame, None).await {
            Ok(n) => shared.stats.borrow_mut().bytes_sent += n as u64,
            Err(e) => {
                tracing::debug!(remote = %shared.opts.remote, error = %e, "handshake write failed");
                mark_failed(&shared);
                return;
            }
        }
    }

    let reader = task.spawn_task("rpc_client_reader", reader_task(shared.clone(), read_half));
    shared.reader_handle.borrow_mut().replace(reader);

    if let Some(params) = shared.opts.keepalive {
        let keepalive = task.spawn_task("rpc_client_keepalive", keepalive_task(shared.clone(), params));
        shared.keepalive_handle.borrow_mut().replace(keepalive);
    }

    while let Some(frame) = writer_rx.recv().await {
        let compressor = { shared.compressor.borrow().clone() };
        match write_frame(&mut write_half, frame, compressor.as_ref()).await {
            Ok(n) => shared.stats.borrow_mut().bytes_sent += n as u64,
            Err(e) => {
                tracing::debug!(remote = %shared.opts.remote, error = %e, "write failed");
                mark_failed(&shared);
                return;
            }
        }
    }
    // channel closed by stop(): flush done, close our half
    let _ = write_half.shutdown().await;
}

async fn dial(opts: &ClientOptions, tls: Option<&TlsContext>) -> std::io::Result<BoxedStream> {
    let stream = match opts.local_ip {
        Some(ip) => {
            let socket = match ip {
                IpAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
                IpAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
            };
            socket.bind(SocketAddr::new(ip, 0))?;
            socket.connect(opts.remote).await?
        }
        None => tokio::net::TcpStream::connect(opts.remote).await?,
    };
    stream.set_nodelay(true)?;

    if opts.tls {
        let Some(ctx) = tls else {
            return Err(std::io::Error::other(
                "TLS requested but no credentials configured",
            ));
        };
        let server_name = rustls::pki_types::ServerName::IpAddress(opts.remote.ip().into());
        let tls_stream = ctx.connector.connect(server_name, stream).await?;
        Ok(Box::new(tls_stream))
    } else {
        Ok(Box::new(stream))
    }
}

async fn reader_task(shared: Rc<ClientShared>, mut read_half: ReadHalf<BoxedStream>) {
    loop {
        let compressor = { shared.compressor.borrow().clone() };
        match read_frame(&mut read_half, compressor.as_ref()).await {
            Ok(Some((frame, n))) => {
                shared.stats.borrow_mut().bytes_received += n as u64;
                shared.last_rx.set(shared.time.now());
                handle_frame(&shared, frame);
            }
            Ok(None) => {
                tracing::debug!(remote = %shared.opts.remote, "connection closed by peer");
                mark_failed(&shared);
                return;
            }
            Err(e) => {
                tracing::debug!(remote = %shared.opts.remote, error = %e, "read failed");
                mark_failed(&shared);
                return;
            }
        }
    }
}

fn handle_frame(shared: &Rc<ClientShared>, frame: Frame) {
    match frame.kind {
        FrameKind::HelloAck => {
            let mask = frame
                .payload
                .get(..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0);
            if let Some(algorithm) = shared.factory.negotiate(mask) {
                *shared.compressor.borrow_mut() = Some(shared.factory.make(algorithm));
                tracing::debug!(remote = %shared.opts.remote, ?algorithm, "compression negotiated");
            }
        }
        FrameKind::Response => {
            if let Some(tx) = shared.pending.borrow_mut().remove(&frame.seq) {
                shared.stats.borrow_mut().replies_received += 1;
                let _ = tx.send(Ok(frame.payload));
            }
        }
        FrameKind::Error => {
            if let Some(tx) = shared.pending.borrow_mut().remove(&frame.seq) {
                shared.stats.borrow_mut().errors_received += 1;
                let message = String::from_utf8_lossy(&frame.payload).into_owned();
                let _ = tx.send(Err(RpcError::Remote { message }));
            }
        }
        FrameKind::Ping => {
            let pong = Frame::new(FrameKind::Pong, 0, frame.seq, Vec::new());
            let _ = shared
                .writer_tx
                .borrow()
                .as_ref()
                .map(|tx| tx.send(pong));
        }
        FrameKind::Pong => {
            // activity already recorded via last_rx
        }
        other => {
            tracing::warn!(remote = %shared.opts.remote, kind = ?other, "unexpected frame");
        }
    }
}

/// Idle supervision: probe after `idle` without traffic, once per
/// `interval`; tear the connection down after `max_failures` silent
/// intervals.
async fn keepalive_task(shared: Rc<ClientShared>, params: KeepaliveParams) {
    let mut failures = 0u32;
    let mut probe_seq = 0u64;
    loop {
        shared.time.sleep(params.interval).await;
        if shared.stopped.get() || shared.error.get() {
            return;
        }
        let idle_for = shared.time.now().saturating_sub(shared.last_rx.get());
        if idle_for < params.idle {
            failures = 0;
            continue;
        }
        if failures >= params.max_failures {
            tracing::warn!(
                remote = %shared.opts.remote,
                failures,
                "keepalive probes unanswered, dropping connection"
            );
            mark_failed(&shared);
            return;
        }
        probe_seq += 1;
        let ping = Frame::new(FrameKind::Ping, 0, probe_seq, Vec::new());
        let _ = shared.writer_tx.borrow().as_ref().map(|tx| tx.send(ping));
        failures += 1;
    }
}
