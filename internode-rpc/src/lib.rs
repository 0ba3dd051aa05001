//! # internode-rpc
//!
//! Framed TCP/TLS RPC transport: the production implementation of the
//! [`internode_core::RpcProvider`] seam.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │        Messaging service (internode)            │
//! │   talks RpcProvider / RpcClient / RpcServer     │
//! ├─────────────────────────────────────────────────┤
//! │   TcpRpcClient / TcpRpcServer                   │
//! │   • lazy background dial, CLIENT_ID announce    │
//! │   • sequence-numbered request multiplexing      │
//! │   • keepalive probes, error latching            │
//! │   • per-connection compression negotiation      │
//! ├─────────────────────────────────────────────────┤
//! │   Wire format                                   │
//! │   • length-prefixed frames, CRC32C checksums    │
//! │   • optional LZ4 payload compression            │
//! ├─────────────────────────────────────────────────┤
//! │   tokio TCP, optionally wrapped in rustls TLS   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! One frame carries one message: a request awaiting a reply, a one-way
//! message, a reply, an error reply, or a keepalive probe. Requests are
//! correlated to replies by a per-connection sequence number, so many
//! calls multiplex over one connection and responses may complete out of
//! order while per-connection send order is preserved.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod client;
mod compress;
mod conn;
mod provider;
mod server;
mod tls;
mod wire;

pub use client::TcpRpcClient;
pub use compress::{CompressionAlgorithm, Compressor, CompressorFactory};
pub use conn::{read_frame, write_frame};
pub use provider::{TcpProviders, TcpRpcProvider};
pub use server::TcpRpcServer;
pub use tls::{CredentialsBuilder, TlsContext};
pub use wire::{Frame, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE, WireError};
