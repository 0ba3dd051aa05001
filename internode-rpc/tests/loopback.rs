//! Integration tests for the TCP transport: client and server over real
//! loopback sockets, single-threaded.

use std::cell::RefCell;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use internode_core::{
    ClientOptions, HandlerTable, JsonCodec, KeepaliveParams, MessageCodec, ResourceLimits,
    RpcClient, RpcError, RpcProvider, RpcServer, ServerOptions, SourceInfo, Verb, VerbHandler,
};
use internode_rpc::TcpRpcProvider;

/// Run a future on a current-thread runtime with a LocalSet, so
/// `spawn_local` works.
fn run_local<F: std::future::Future>(future: F) -> F::Output {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("build runtime");
    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(future))
}

fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn identity() -> SourceInfo {
    SourceInfo {
        broadcast_address: localhost(),
        src_cpu_id: 0,
        max_result_size: None,
    }
}

fn client_options(remote: SocketAddr) -> ClientOptions {
    ClientOptions {
        remote,
        local_ip: None,
        keepalive: None,
        compress: false,
        tls: false,
        identity: identity(),
    }
}

fn server_options() -> ServerOptions {
    ServerOptions {
        bind: SocketAddr::new(localhost(), 0),
        compress: false,
        tls: false,
        limits: ResourceLimits {
            basic_request_size: 1000,
            bloat_factor: 3,
            max_memory: 1_000_000,
        },
    }
}

/// Handler echoing the request payload back.
fn echo_handler() -> VerbHandler {
    Rc::new(|_info, payload| Box::pin(async move { Ok(Some(payload)) }))
}

#[test]
fn test_request_response_roundtrip() {
    run_local(async {
        let provider = TcpRpcProvider::default();
        let handlers = Rc::new(HandlerTable::new());
        handlers.register(Verb::ReadData, echo_handler());

        let server = provider
            .listen(server_options(), handlers)
            .await
            .expect("listen");
        let addr = server.local_addr().expect("bound");

        let client = provider.connect(client_options(addr));
        let reply = client
            .call(Verb::ReadData, b"row key".to_vec(), None)
            .await
            .expect("call should succeed");
        assert_eq!(reply, b"row key");

        let stats = client.stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.replies_received, 1);
        assert!(stats.bytes_sent > 0);

        client.stop().await;
        server.stop().await;
    });
}

#[test]
fn test_concurrent_calls_multiplex() {
    run_local(async {
        let provider = TcpRpcProvider::default();
        let handlers = Rc::new(HandlerTable::new());
        handlers.register(Verb::ReadData, echo_handler());

        let server = provider
            .listen(server_options(), handlers)
            .await
            .expect("listen");
        let addr = server.local_addr().expect("bound");
        let client = Rc::new(provider.connect(client_options(addr)));

        let mut replies = Vec::new();
        for i in 0..10u8 {
            let client = client.clone();
            replies.push(tokio::task::spawn_local(async move {
                client.call(Verb::ReadData, vec![i], None).await
            }));
        }
        for (i, handle) in replies.into_iter().enumerate() {
            let reply = handle.await.expect("task").expect("call");
            assert_eq!(reply, vec![i as u8]);
        }

        client.stop().await;
        server.stop().await;
    });
}

#[test]
fn test_oneway_reaches_handler() {
    run_local(async {
        let provider = TcpRpcProvider::default();
        let handlers = Rc::new(HandlerTable::new());

        let seen: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        handlers.register(
            Verb::GossipShutdown,
            Rc::new(move |_info, payload| {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.borrow_mut().push(payload);
                    Ok(None)
                })
            }),
        );

        let server = provider
            .listen(server_options(), handlers)
            .await
            .expect("listen");
        let addr = server.local_addr().expect("bound");
        let client = provider.connect(client_options(addr));

        client
            .notify(Verb::GossipShutdown, b"10.0.0.9".to_vec())
            .await
            .expect("notify");

        // give the message time to cross the loopback
        for _ in 0..200 {
            if !seen.borrow().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.borrow().as_slice(), &[b"10.0.0.9".to_vec()]);

        client.stop().await;
        server.stop().await;
    });
}

#[test]
fn test_client_id_announce_attaches_source() {
    run_local(async {
        let provider = TcpRpcProvider::default();
        let handlers = Rc::new(HandlerTable::new());

        // a CLIENT_ID handler the way the messaging service installs one
        let codec = JsonCodec;
        handlers.register(
            Verb::ClientId,
            Rc::new(move |info, payload| {
                let codec = codec;
                Box::pin(async move {
                    let source: SourceInfo = codec.decode(&payload).map_err(RpcError::from)?;
                    info.attach_source(source);
                    Ok(None)
                })
            }),
        );
        handlers.register(Verb::GossipEcho, echo_handler());

        let server = provider
            .listen(server_options(), handlers)
            .await
            .expect("listen");
        let addr = server.local_addr().expect("bound");

        let mut opts = client_options(addr);
        opts.identity.src_cpu_id = 5;
        let client = provider.connect(opts);

        client
            .call(Verb::GossipEcho, Vec::new(), None)
            .await
            .expect("echo");

        let mut sources = Vec::new();
        server.foreach_connection(&mut |info, _stats| {
            sources.push(info.source());
        });
        assert_eq!(sources.len(), 1);
        let source = sources[0].expect("CLIENT_ID must arrive before the echo");
        assert_eq!(source.src_cpu_id, 5);
        assert_eq!(source.broadcast_address, localhost());

        client.stop().await;
        server.stop().await;
    });
}

#[test]
fn test_remote_handler_error_propagates() {
    run_local(async {
        let provider = TcpRpcProvider::default();
        let handlers = Rc::new(HandlerTable::new());
        handlers.register(
            Verb::Truncate,
            Rc::new(|_info, _payload| {
                Box::pin(async {
                    Err(RpcError::Remote {
                        message: "table is locked".to_string(),
                    })
                })
            }),
        );

        let server = provider
            .listen(server_options(), handlers)
            .await
            .expect("listen");
        let addr = server.local_addr().expect("bound");
        let client = provider.connect(client_options(addr));

        let err = client
            .call(Verb::Truncate, Vec::new(), None)
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, RpcError::Remote { .. }));
        assert!(err.to_string().contains("table is locked"));
        // an application error does not poison the connection
        assert!(!client.is_error());

        client.stop().await;
        server.stop().await;
    });
}

#[test]
fn test_unregistered_verb_is_remote_error() {
    run_local(async {
        let provider = TcpRpcProvider::default();
        let server = provider
            .listen(server_options(), Rc::new(HandlerTable::new()))
            .await
            .expect("listen");
        let addr = server.local_addr().expect("bound");
        let client = provider.connect(client_options(addr));

        let err = client
            .call(Verb::Mutation, Vec::new(), None)
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, RpcError::Remote { .. }));

        client.stop().await;
        server.stop().await;
    });
}

#[test]
fn test_call_timeout() {
    run_local(async {
        let provider = TcpRpcProvider::default();
        let handlers = Rc::new(HandlerTable::new());
        handlers.register(
            Verb::GetSchemaVersion,
            Rc::new(|_info, _payload| Box::pin(std::future::pending())),
        );

        let server = provider
            .listen(server_options(), handlers)
            .await
            .expect("listen");
        let addr = server.local_addr().expect("bound");
        let client = provider.connect(client_options(addr));

        let err = client
            .call(
                Verb::GetSchemaVersion,
                Vec::new(),
                Some(Duration::from_millis(100)),
            )
            .await
            .err()
            .expect("must time out");
        assert!(matches!(err, RpcError::Timeout));

        client.stop().await;
        server.stop().await;
    });
}

#[test]
fn test_server_gone_fails_calls_closed() {
    run_local(async {
        let provider = TcpRpcProvider::default();
        let handlers = Rc::new(HandlerTable::new());
        handlers.register(Verb::ReadData, echo_handler());

        let server = provider
            .listen(server_options(), handlers)
            .await
            .expect("listen");
        let addr = server.local_addr().expect("bound");
        let client = provider.connect(client_options(addr));

        client
            .call(Verb::ReadData, vec![1], None)
            .await
            .expect("warm-up call");

        server.stop().await;

        // the next call either fails in flight or after the error latches
        let mut last = Ok(Vec::new());
        for _ in 0..50 {
            last = client.call(Verb::ReadData, vec![2], None).await;
            if last.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(last, Err(RpcError::Closed)));
        assert!(client.is_error());

        client.stop().await;
    });
}

#[test]
fn test_compression_negotiated_roundtrip() {
    run_local(async {
        let provider = TcpRpcProvider::default();
        let handlers = Rc::new(HandlerTable::new());
        handlers.register(Verb::StreamMutation, echo_handler());

        let mut opts = server_options();
        opts.compress = true;
        let server = provider.listen(opts, handlers).await.expect("listen");
        let addr = server.local_addr().expect("bound");

        let mut copts = client_options(addr);
        copts.compress = true;
        let client = provider.connect(copts);

        // highly repetitive payload, far larger than the frame header
        let payload = b"mutation batch ".repeat(4096);
        let reply = client
            .call(Verb::StreamMutation, payload.clone(), None)
            .await
            .expect("call");
        assert_eq!(reply, payload);

        // the compressed frame must have been much smaller than the payload
        let stats = client.stats();
        assert!(
            stats.bytes_sent < payload.len() as u64 / 2,
            "expected compressed traffic, sent {} bytes for a {} byte payload",
            stats.bytes_sent,
            payload.len()
        );

        client.stop().await;
        server.stop().await;
    });
}

#[test]
fn test_keepalive_tears_down_silent_connection() {
    run_local(async {
        // raw listener that accepts and then never answers anything
        let listener = tokio::net::TcpListener::bind(SocketAddr::new(localhost(), 0))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::task::spawn_local(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            // hold the socket open, reading nothing, answering nothing
            std::future::pending::<()>().await;
            drop(stream);
        });

        let provider = TcpRpcProvider::default();
        let mut opts = client_options(addr);
        opts.keepalive = Some(KeepaliveParams {
            idle: Duration::from_millis(50),
            interval: Duration::from_millis(50),
            max_failures: 3,
        });
        let client = provider.connect(opts);

        for _ in 0..100 {
            if client.is_error() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client.is_error(), "keepalive should have latched the error");

        client.stop().await;
    });
}
