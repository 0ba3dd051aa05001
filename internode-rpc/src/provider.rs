//! Production provider bundle.
//!
//! [`TcpRpcProvider`] implements the [`RpcProvider`] seam over tokio TCP
//! with optional rustls TLS; [`TcpProviders`] bundles it with the tokio
//! time and task providers for handing to the messaging service.

use std::rc::Rc;

use async_trait::async_trait;

use internode_core::{
    ClientOptions, HandlerTable, JsonCodec, MessageCodec, Providers, RpcError, RpcProvider,
    ServerOptions, TokioTaskProvider, TokioTimeProvider,
};

use crate::client::TcpRpcClient;
use crate::compress::CompressorFactory;
use crate::server::TcpRpcServer;
use crate::tls::TlsContext;

/// RPC provider over tokio TCP, optionally wrapped in rustls TLS.
///
/// The codec is only used for transport-internal payloads (the CLIENT_ID
/// identity announce); it must match the codec of the messaging service
/// that registers the CLIENT_ID handler.
#[derive(Clone)]
pub struct TcpRpcProvider<C: MessageCodec = JsonCodec> {
    codec: C,
    factory: CompressorFactory,
    tls: Option<TlsContext>,
    time: TokioTimeProvider,
    task: TokioTaskProvider,
}

impl<C: MessageCodec> TcpRpcProvider<C> {
    /// Create a provider with the given codec and no TLS material.
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            factory: CompressorFactory::new(),
            tls: None,
            time: TokioTimeProvider::new(),
            task: TokioTaskProvider,
        }
    }

    /// Attach TLS material for encrypted clients and listeners.
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }
}

impl Default for TcpRpcProvider<JsonCodec> {
    fn default() -> Self {
        Self::new(JsonCodec)
    }
}

#[async_trait(?Send)]
impl<C: MessageCodec> RpcProvider for TcpRpcProvider<C> {
    type Client = TcpRpcClient;
    type Server = TcpRpcServer;

    fn connect(&self, opts: ClientOptions) -> Self::Client {
        match self.codec.encode(&opts.identity) {
            Ok(identity_payload) => TcpRpcClient::start(
                opts,
                identity_payload,
                self.factory.clone(),
                self.tls.clone(),
                self.time.clone(),
                self.task.clone(),
            ),
            Err(e) => {
                tracing::error!(error = %e, "client identity encode failed");
                TcpRpcClient::start_failed(opts, self.time.clone())
            }
        }
    }

    async fn listen(
        &self,
        opts: ServerOptions,
        handlers: Rc<HandlerTable>,
    ) -> Result<Self::Server, RpcError> {
        TcpRpcServer::bind(
            opts,
            handlers,
            self.factory.clone(),
            self.tls.clone(),
            self.task.clone(),
        )
        .await
    }
}

/// Production providers: TCP transport, tokio time, tokio tasks.
#[derive(Clone)]
pub struct TcpProviders<C: MessageCodec = JsonCodec> {
    rpc: TcpRpcProvider<C>,
    time: TokioTimeProvider,
    task: TokioTaskProvider,
}

impl<C: MessageCodec> TcpProviders<C> {
    /// Create a production bundle around the given RPC provider.
    pub fn new(rpc: TcpRpcProvider<C>) -> Self {
        Self {
            rpc,
            time: TokioTimeProvider::new(),
            task: TokioTaskProvider,
        }
    }
}

impl Default for TcpProviders<JsonCodec> {
    fn default() -> Self {
        Self::new(TcpRpcProvider::default())
    }
}

impl<C: MessageCodec> Providers for TcpProviders<C> {
    type Rpc = TcpRpcProvider<C>;
    type Time = TokioTimeProvider;
    type Task = TokioTaskProvider;

    fn rpc(&self) -> &Self::Rpc {
        &self.rpc
    }

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }
}
