//! # internode-core
//!
//! Core abstractions for the internode messaging layer.
//!
//! Each node in a cluster runs one messaging service per CPU shard; the
//! service multiplexes many logical request kinds ("verbs") over a small
//! pool of long-lived connections to every peer. This crate provides the
//! vocabulary shared by the service and its transport:
//!
//! - [`PeerAddr`]: identity of a remote party (ip + opaque cpu id)
//! - [`Verb`]: the closed enumeration of message kinds
//! - [`MessageCodec`]: pluggable payload serialization
//! - [`RpcProvider`] / [`RpcClient`] / [`RpcServer`]: the seam to the wire
//!   RPC library (framing, multiplexing, keepalive, compression, TLS)
//! - [`TimeProvider`] / [`TaskProvider`]: runtime seams for sleep, timeout
//!   and local task spawning
//! - [`LocalityOracle`] / [`MembershipOracle`] / [`PreferredIpStore`]:
//!   seams to the cluster topology subsystems
//!
//! ## The Provider Pattern
//!
//! Service code never talks to tokio or to a concrete transport directly.
//! It depends on the traits above, so tests can substitute scripted
//! transports and the production wiring can substitute the real one:
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │              Messaging service                    │
//! │   Uses: RpcProvider, TimeProvider, TaskProvider   │
//! └───────────────────────┬──────────────────────────┘
//!                         │ depends on traits
//!          ┌──────────────┴──────────────┐
//!          ▼                             ▼
//!   ┌─────────────────┐         ┌──────────────────┐
//!   │   Test doubles  │         │   Production     │
//!   │ scripted client │         │ internode-rpc    │
//!   │ canned failures │         │ (real TCP/TLS)   │
//!   └─────────────────┘         └──────────────────┘
//! ```
//!
//! All of this is single-core by design: no `Send` bounds, shared state is
//! `Rc`/`RefCell`, and futures are driven on a current-thread runtime.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod addr;
mod codec;
mod error;
mod oracle;
mod providers;
mod rpc;
mod task;
mod time;
mod verb;

pub use addr::PeerAddr;
pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use error::{RpcError, RpcResult};
pub use oracle::{
    AlwaysMember, LocalityOracle, MembershipOracle, NoPreferredIps, PreferredIpStore,
    UnknownLocality,
};
pub use providers::Providers;
pub use rpc::{
    ClientInfo, ClientOptions, ConnectionStats, HandlerFuture, HandlerTable, KeepaliveParams,
    ResourceLimits, RpcClient, RpcProvider, RpcServer, ServerOptions, SourceInfo, VerbHandler,
};
pub use task::{TaskProvider, TokioTaskProvider};
pub use time::{TimeError, TimeProvider, TokioTimeProvider};
pub use verb::{UnknownVerb, Verb};
