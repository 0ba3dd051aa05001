//! End-to-end tests: two messaging services talking over real loopback
//! TCP through the production transport.
//!
//! The nodes listen on distinct loopback addresses (127.0.0.1 and
//! 127.0.0.2) sharing one port, the way cluster nodes share a configured
//! port in production.

use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::rc::Rc;
use std::time::Duration;

use internode::{MessagingConfig, TcpMessagingService, start_messaging};
use internode_core::{PeerAddr, RpcClient, RpcError, Verb};

fn run_local<F: std::future::Future>(future: F) -> F::Output {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("build runtime");
    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(future))
}

fn node_a_ip() -> IpAddr {
    "127.0.0.1".parse().expect("ip")
}

fn node_b_ip() -> IpAddr {
    "127.0.0.2".parse().expect("ip")
}

fn free_port() -> u16 {
    let listener = TcpListener::bind(SocketAddr::new(node_a_ip(), 0)).expect("probe bind");
    listener.local_addr().expect("probe addr").port()
}

fn node_config(ip: IpAddr, port: u16) -> MessagingConfig {
    MessagingConfig {
        listen_address: ip,
        port,
        listen_now: true,
        ..MessagingConfig::default()
    }
}

/// Start node A (listening) and node B on a shared port.
async fn start_two_nodes() -> (Rc<TcpMessagingService>, Rc<TcpMessagingService>) {
    let mut last_err = None;
    for _ in 0..5 {
        let port = free_port();
        let a = match start_messaging(node_config(node_a_ip(), port)).await {
            Ok(service) => service,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        match start_messaging(node_config(node_b_ip(), port)).await {
            Ok(b) => return (a, b),
            Err(e) => {
                a.stop().await;
                last_err = Some(e);
            }
        }
    }
    panic!("could not bind a shared port: {:?}", last_err);
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[test]
fn test_gossip_echo_roundtrip() {
    run_local(async {
        let (a, b) = start_two_nodes().await;

        let echoes = Rc::new(RefCell::new(0u32));
        let counter = echoes.clone();
        a.register_gossip_echo(move |_info| {
            let counter = counter.clone();
            async move {
                *counter.borrow_mut() += 1;
                Ok(())
            }
        });

        b.send_gossip_echo(PeerAddr::from_ip(node_a_ip()))
            .await
            .expect("echo should resolve");
        assert_eq!(*echoes.borrow(), 1);

        a.stop().await;
        b.stop().await;
    });
}

#[test]
fn test_gossip_shutdown_oneway_with_source() {
    run_local(async {
        let (a, b) = start_two_nodes().await;

        type Seen = Rc<RefCell<Vec<(String, Option<PeerAddr>)>>>;
        let seen: Seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        a.register_gossip_shutdown(move |info, from: String| {
            let sink = sink.clone();
            async move {
                sink.borrow_mut()
                    .push((from, TcpMessagingService::get_source(&info)));
            }
        });

        b.send_gossip_shutdown(PeerAddr::from_ip(node_a_ip()), &node_b_ip().to_string())
            .await
            .expect("oneway resolves immediately");

        wait_until(|| !seen.borrow().is_empty()).await;
        let (from, source) = seen.borrow()[0].clone();
        assert_eq!(from, node_b_ip().to_string());
        // the CLIENT_ID handshake preceded the shutdown message
        let source = source.expect("caller identity must be attached");
        assert_eq!(source.ip, node_b_ip());
        assert_eq!(source.cpu_id, 0);

        a.stop().await;
        b.stop().await;
    });
}

#[test]
fn test_typed_request_response() {
    run_local(async {
        let (a, b) = start_two_nodes().await;

        a.register_handler(Verb::ReadData, |_info, key: u64| async move {
            Ok(format!("row-{key}"))
        });

        let row: String = b
            .send(Verb::ReadData, PeerAddr::from_ip(node_a_ip()), &42u64)
            .await
            .expect("request");
        assert_eq!(row, "row-42");

        // remote handler errors come back verbatim
        a.register_handler(Verb::Truncate, |_info, (): ()| async move {
            Err::<(), _>(RpcError::Remote {
                message: "table is locked".to_string(),
            })
        });
        let err = b
            .send::<(), ()>(Verb::Truncate, PeerAddr::from_ip(node_a_ip()), &())
            .await
            .err()
            .expect("must fail");
        assert!(err.to_string().contains("table is locked"));

        a.stop().await;
        b.stop().await;
    });
}

#[test]
fn test_control_and_data_use_distinct_connections() {
    run_local(async {
        let (a, b) = start_two_nodes().await;
        let a_addr = PeerAddr::from_ip(node_a_ip());

        let syns = Rc::new(RefCell::new(0u32));
        let counter = syns.clone();
        a.register_gossip_digest_syn(move |_info, _digest: Vec<u32>| {
            let counter = counter.clone();
            async move {
                *counter.borrow_mut() += 1;
            }
        });
        a.register_handler(Verb::ReadData, |_info, key: u64| async move { Ok(key + 1) });
        a.register_gossip_echo(|_info| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        });

        // one data-path request, one control message
        let reply: u64 = b.send(Verb::ReadData, a_addr, &10u64).await.expect("read");
        assert_eq!(reply, 11);
        b.send_gossip_digest_syn(a_addr, &vec![1u32, 2, 3])
            .await
            .expect("syn");
        wait_until(|| *syns.borrow() > 0).await;

        // two cached clients on B, two inbound connections on A
        let mut cached = 0;
        b.foreach_client(|_id, _stats| cached += 1);
        assert_eq!(cached, 2);
        let mut inbound = 0;
        a.foreach_server_connection_stats(|_info, _stats| inbound += 1);
        assert_eq!(inbound, 2);

        // stopping the data-path connection must not disturb a control
        // call in flight
        let echo = tokio::task::spawn_local({
            let b = b.clone();
            async move { b.send_gossip_echo(a_addr).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let data_client = b.get_rpc_client(Verb::ReadData, a_addr).expect("cached");
        data_client.stop().await;

        echo.await
            .expect("task")
            .expect("control call must survive the data pool teardown");

        a.stop().await;
        b.stop().await;
    });
}

#[test]
fn test_server_side_stats_accumulate() {
    run_local(async {
        let (a, b) = start_two_nodes().await;

        a.register_handler(Verb::GetSchemaVersion, |_info, (): ()| async {
            Ok("a8cfe1d2".to_string())
        });
        for _ in 0..3 {
            let _: String = b
                .send(Verb::GetSchemaVersion, PeerAddr::from_ip(node_a_ip()), &())
                .await
                .expect("request");
        }

        let mut bytes = 0;
        a.foreach_server_connection_stats(|_info, stats| bytes += stats.bytes_received);
        assert!(bytes > 0, "inbound connection stats must accumulate");

        // client-side view of the same traffic
        let mut requests = 0;
        b.foreach_client(|_id, stats| requests += stats.requests_sent);
        assert!(requests >= 3);

        a.stop().await;
        b.stop().await;
    });
}
