//! Inbound RPC listener.
//!
//! A [`TcpRpcServer`] accepts plain or TLS connections, reads frames and
//! dispatches Request/OneWay frames through the shared
//! [`HandlerTable`](internode_core::HandlerTable). Each in-flight request
//! is accounted against the listener's [`ResourceLimits`]: a request
//! costs `basic_request_size + bloat_factor × payload` bytes and is
//! rejected with an error reply when the budget is exhausted.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use internode_core::{
    ClientInfo, ConnectionStats, HandlerTable, RpcError, RpcServer, ServerOptions, TaskProvider,
    TokioTaskProvider,
};

use crate::compress::{Compressor, CompressorFactory};
use crate::conn::{BoxedStream, read_frame, write_frame};
use crate::tls::TlsContext;
use crate::wire::{Frame, FrameKind};

/// One listener, produced by
/// [`TcpRpcProvider::listen`](crate::TcpRpcProvider).
pub struct TcpRpcServer {
    shared: Rc<ServerShared>,
}

struct ServerShared {
    opts: ServerOptions,
    factory: CompressorFactory,
    handlers: Rc<HandlerTable>,
    task: TokioTaskProvider,
    local_addr: SocketAddr,
    conns: RefCell<HashMap<u64, Rc<ServerConn>>>,
    next_conn_id: Cell<u64>,
    /// Memory currently accounted to in-flight requests.
    mem_in_flight: Cell<usize>,
    stopped: Cell<bool>,
    accept_handle: RefCell<Option<JoinHandle<()>>>,
}

struct ServerConn {
    id: u64,
    info: Rc<ClientInfo>,
    stats: RefCell<ConnectionStats>,
    writer_tx: mpsc::UnboundedSender<Frame>,
    compressor: RefCell<Option<Rc<dyn Compressor>>>,
    reader_handle: RefCell<Option<JoinHandle<()>>>,
    writer_handle: RefCell<Option<JoinHandle<()>>>,
}

impl TcpRpcServer {
    pub(crate) async fn bind(
        opts: ServerOptions,
        handlers: Rc<HandlerTable>,
        factory: CompressorFactory,
        tls: Option<TlsContext>,
        task: TokioTaskProvider,
    ) -> Result<Self, RpcError> {
        if opts.tls && tls.is_none() {
            return Err(RpcError::Io {
                message: "TLS listener requested but no credentials configured".to_string(),
            });
        }
        let listener = tokio::net::TcpListener::bind(opts.bind).await?;
        let local_addr = listener.local_addr()?;

        let shared = Rc::new(ServerShared {
            opts,
            factory,
            handlers,
            task: task.clone(),
            local_addr,
            conns: RefCell::new(HashMap::new()),
            next_conn_id: Cell::new(0),
            mem_in_flight: Cell::new(0),
            stopped: Cell::new(false),
            accept_handle: RefCell::new(None),
        });

        let accept = task.spawn_task(
            "rpc_server_accept",
            accept_loop(shared.clone(), listener, tls),
        );
        shared.accept_handle.borrow_mut().replace(accept);

        Ok(Self { shared })
    }
}

#[async_trait(?Send)]
impl RpcServer for TcpRpcServer {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.shared.local_addr)
    }

    fn foreach_connection(&self, f: &mut dyn FnMut(&ClientInfo, &ConnectionStats)) {
        for conn in self.shared.conns.borrow().values() {
            f(&conn.info, &conn.stats.borrow());
        }
    }

    async fn stop(&self) {
        let shared = &self.shared;
        if shared.stopped.replace(true) {
            return;
        }
        if let Some(handle) = shared.accept_handle.borrow_mut().take() {
            handle.abort();
            let _ = handle.await;
        }
        let conns: Vec<_> = shared.conns.borrow_mut().drain().map(|(_, c)| c).collect();
        for conn in conns {
            let reader = conn.reader_handle.borrow_mut().take();
            if let Some(handle) = reader {
                handle.abort();
                let _ = handle.await;
            }
            let writer = conn.writer_handle.borrow_mut().take();
            if let Some(handle) = writer {
                handle.abort();
                let _ = handle.await;
            }
        }
        tracing::debug!(addr = %shared.local_addr, "rpc server stopped");
    }
}

async fn accept_loop(
    shared: Rc<ServerShared>,
    listener: tokio::net::TcpListener,
    tls: Option<TlsContext>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let shared = shared.clone();
                let acceptor = tls.as_ref().map(|ctx| ctx.acceptor.clone());
                let task = shared.task.clone();
                task.spawn_task("rpc_server_conn", async move {
                    let _ = stream.set_nodelay(true);
                    let stream: BoxedStream = if let Some(acceptor) = acceptor {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => Box::new(tls_stream),
                            Err(e) => {
                                tracing::debug!(%remote, error = %e, "TLS accept failed");
                                return;
                            }
                        }
                    } else {
                        Box::new(stream)
                    };
                    serve_connection(shared, stream, remote).await;
                });
            }
            Err(e) => {
                tracing::warn!(addr = %shared.local_addr, error = %e, "accept failed");
            }
        }
    }
}

async fn serve_connection(shared: Rc<ServerShared>, stream: BoxedStream, remote: SocketAddr) {
    if shared.stopped.get() {
        // accepted (or finished its TLS handshake) after stop
        return;
    }
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Frame>();

    let id = shared.next_conn_id.get();
    shared.next_conn_id.set(id + 1);
    let conn = Rc::new(ServerConn {
        id,
        info: Rc::new(ClientInfo::new(remote)),
        stats: RefCell::new(ConnectionStats::default()),
        writer_tx,
        compressor: RefCell::new(None),
        reader_handle: RefCell::new(None),
        writer_handle: RefCell::new(None),
    });
    shared.conns.borrow_mut().insert(id, conn.clone());
    tracing::debug!(%remote, "accepted connection");

    let writer = shared.task.spawn_task("rpc_server_writer", {
        let conn = conn.clone();
        async move {
            while let Some(frame) = writer_rx.recv().await {
                let compressor = { conn.compressor.borrow().clone() };
                match write_frame(&mut write_half, frame, compressor.as_ref()).await {
                    Ok(n) => conn.stats.borrow_mut().bytes_sent += n as u64,
                    Err(e) => {
                        tracing::debug!(remote = %conn.info.remote, error = %e, "write failed");
                        break;
                    }
                }
            }
            let _ = write_half.shutdown().await;
        }
    });
    conn.writer_handle.borrow_mut().replace(writer);

    let reader = shared.task.spawn_task("rpc_server_reader", {
        let shared = shared.clone();
        let conn = conn.clone();
        async move {
            reader_loop(&shared, &conn, read_half).await;
            // connection gone: forget it and stop writing
            shared.conns.borrow_mut().remove(&conn.id);
            if let Some(handle) = conn.writer_handle.borrow_mut().take() {
                handle.abort();
            }
            tracing::debug!(remote = %conn.info.remote, "connection closed");
        }
    });
    conn.reader_handle.borrow_mut().replace(reader);
}

async fn reader_loop(shared: &Rc<ServerShared>, conn: &Rc<ServerConn>, mut read_half: ReadHalf<BoxedStream>) {
    loop {
        let compressor = { conn.compressor.borrow().clone() };
        match read_frame(&mut read_half, compressor.as_ref()).await {
            Ok(Some((frame, n))) => {
                conn.stats.borrow_mut().bytes_received += n as u64;
                handle_frame(shared, conn, frame);
            }
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(remote = %conn.info.remote, error = %e, "read failed");
                return;
            }
        }
    }
}

fn handle_frame(shared: &Rc<ServerShared>, conn: &Rc<ServerConn>, frame: Frame) {
    match frame.kind {
        FrameKind::Hello => {
            let offered = frame
                .payload
                .get(..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .unwrap_or(0);
            let chosen = if shared.opts.compress {
                shared.factory.negotiate(offered)
            } else {
                None
            };
            let mask = chosen.map(|a| a.bit()).unwrap_or(0);
            if let Some(algorithm) = chosen {
                *conn.compressor.borrow_mut() = Some(shared.factory.make(algorithm));
                tracing::debug!(remote = %conn.info.remote, ?algorithm, "compression negotiated");
            }
            let ack = Frame::new(FrameKind::HelloAck, 0, 0, mask.to_le_bytes().to_vec());
            let _ = conn.writer_tx.send(ack);
        }
        FrameKind::Request => dispatch(shared, conn, frame, true),
        FrameKind::OneWay => dispatch(shared, conn, frame, false),
        FrameKind::Ping => {
            let pong = Frame::new(FrameKind::Pong, 0, frame.seq, Vec::new());
            let _ = conn.writer_tx.send(pong);
        }
        FrameKind::Pong => {}
        other => {
            tracing::warn!(remote = %conn.info.remote, kind = ?other, "unexpected frame");
        }
    }
}

fn dispatch(shared: &Rc<ServerShared>, conn: &Rc<ServerConn>, frame: Frame, wants_reply: bool) {
    let limits = shared.opts.limits;
    let cost = limits.basic_request_size + limits.bloat_factor * frame.payload.len();
    if shared.mem_in_flight.get() + cost > limits.max_memory {
        tracing::warn!(
            remote = %conn.info.remote,
            verb = frame.verb,
            in_flight = shared.mem_in_flight.get(),
            "request rejected: memory limit reached"
        );
        if wants_reply {
            let reply = Frame::new(
                FrameKind::Error,
                0,
                frame.seq,
                b"server out of request memory".to_vec(),
            );
            let _ = conn.writer_tx.send(reply);
        }
        return;
    }
    shared.mem_in_flight.set(shared.mem_in_flight.get() + cost);

    let handler = shared.handlers.get(frame.verb);
    let task = shared.task.clone();
    let shared = shared.clone();
    let conn = conn.clone();
    task.spawn_task("rpc_server_handler", async move {
        let result = match handler {
            Some(handler) => handler(conn.info.clone(), frame.payload).await,
            None => Err(RpcError::Remote {
                message: format!("no handler registered for verb {}", frame.verb),
            }),
        };
        if wants_reply {
            let reply = match result {
                Ok(payload) => Frame::new(
                    FrameKind::Response,
                    0,
                    frame.seq,
                    payload.unwrap_or_default(),
                ),
                Err(e) => Frame::new(FrameKind::Error, 0, frame.seq, e.to_string().into_bytes()),
            };
            let _ = conn.writer_tx.send(reply);
        } else if let Err(e) = result {
            tracing::warn!(remote = %conn.info.remote, verb = frame.verb, error = %e, "one-way handler failed");
        }
        shared.mem_in_flight.set(shared.mem_in_flight.get() - cost);
    });
}
