//! Provider bundle trait for simplified type parameters.
//!
//! The messaging service needs three providers: the RPC library, time, and
//! task spawning. Bundling them into one [`Providers`] type parameter keeps
//! downstream signatures to a single generic instead of three.

use crate::rpc::RpcProvider;
use crate::task::TaskProvider;
use crate::time::TimeProvider;

/// Bundle of the provider types for one runtime environment.
///
/// The production bundle (`TcpProviders` in `internode-rpc`) wires the TCP
/// transport with tokio time and task providers; test bundles substitute
/// scripted transports.
pub trait Providers: Clone + 'static {
    /// RPC library implementation.
    type Rpc: RpcProvider;

    /// Time provider for sleep and timeout.
    type Time: TimeProvider + 'static;

    /// Task provider for spawning local tasks.
    type Task: TaskProvider + 'static;

    /// The RPC provider instance.
    fn rpc(&self) -> &Self::Rpc;

    /// The time provider instance.
    fn time(&self) -> &Self::Time;

    /// The task provider instance.
    fn task(&self) -> &Self::Task;
}
