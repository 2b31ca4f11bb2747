//! Integration tests for discovery and the multi-server client.
//!
//! Servers run on loopback; the registry is a small axum app that counts how
//! often it is asked for the server list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use simplerpc::{Context, MethodResult, Options, RpcError, Server, ServerHandle, Service};
use simplerpc_xclient::{Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode, XClient};

struct Foo {
    id: u32,
    fail: bool,
}

async fn start_foo(id: u32, fail: bool) -> ServerHandle {
    let service = Service::builder(Foo { id, fail })
        .method("Id", |foo: Arc<Foo>, _: ()| async move { MethodResult::Ok(foo.id) })
        .method("Answer", |foo: Arc<Foo>, fail_delay_ms: u64| async move {
            if foo.fail {
                tokio::time::sleep(Duration::from_millis(fail_delay_ms)).await;
                return Err(format!("server {} refuses", foo.id).into());
            }
            MethodResult::Ok(42u32)
        })
        .method("Slow", |foo: Arc<Foo>, delay_ms: u64| async move {
            if foo.fail {
                return Err(format!("server {} refuses", foo.id).into());
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            MethodResult::Ok(42u32)
        })
        .build()
        .unwrap();

    let server = Arc::new(Server::new());
    server.register(service).unwrap();
    server.start("127.0.0.1:0").await.unwrap()
}

fn tcp_addr(handle: &ServerHandle) -> String {
    format!("tcp@{}", handle.addr())
}

/// A registry stand-in that answers with `servers` and counts lookups.
async fn start_fake_registry(servers: String, hits: Arc<AtomicUsize>) -> String {
    let app = Router::new().route(
        "/_simplerpc_/registry",
        get(move || {
            let servers = servers.clone();
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                [("X-Simplerpc-Servers", servers)]
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/_simplerpc_/registry", addr)
}

#[tokio::test]
async fn test_round_robin_call_visits_each_server() {
    let servers = [start_foo(1, false).await, start_foo(2, false).await, start_foo(3, false).await];
    let addrs = servers.iter().map(tcp_addr).collect();
    let xc = XClient::new(
        Arc::new(MultiServersDiscovery::new(addrs)),
        SelectMode::RoundRobin,
        Options::default(),
    );

    let mut ids = Vec::new();
    for _ in 0..6 {
        let id: u32 = xc.call(&Context::background(), "Foo.Id", &()).await.unwrap();
        ids.push(id);
    }
    assert_eq!(ids, vec![1, 2, 3, 1, 2, 3]);
    assert_eq!(xc.pool_size().await, 3);
}

#[tokio::test]
async fn test_call_without_servers_fails() {
    let xc = XClient::new(
        Arc::new(MultiServersDiscovery::new(Vec::new())),
        SelectMode::Random,
        Options::default(),
    );
    let err = xc
        .call::<_, u32>(&Context::background(), "Foo.Id", &())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::NoAvailableServers));
}

#[tokio::test]
async fn test_broadcast_all_succeed_fills_reply() {
    let servers = [start_foo(1, false).await, start_foo(2, false).await];
    let xc = XClient::new(
        Arc::new(MultiServersDiscovery::new(servers.iter().map(tcp_addr).collect())),
        SelectMode::Random,
        Options::default(),
    );

    let mut reply = 0u32;
    xc.broadcast(&Context::background(), "Foo.Answer", &0u64, Some(&mut reply))
        .await
        .unwrap();
    assert_eq!(reply, 42);
}

#[tokio::test]
async fn test_broadcast_returns_error_but_keeps_first_reply() {
    let servers = [
        start_foo(1, false).await,
        start_foo(2, true).await,
        start_foo(3, false).await,
    ];
    let xc = XClient::new(
        Arc::new(MultiServersDiscovery::new(servers.iter().map(tcp_addr).collect())),
        SelectMode::Random,
        Options::default(),
    );

    let mut reply = 0u32;
    let err = xc
        .broadcast(&Context::background(), "Foo.Answer", &200u64, Some(&mut reply))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("server 2 refuses"));
    assert_eq!(reply, 42);
}

#[tokio::test]
async fn test_broadcast_error_cancels_slow_calls() {
    let slow = start_foo(1, false).await;
    let failing = start_foo(2, true).await;
    let xc = XClient::new(
        Arc::new(MultiServersDiscovery::new(vec![tcp_addr(&slow), tcp_addr(&failing)])),
        SelectMode::Random,
        Options::default(),
    );

    let started = tokio::time::Instant::now();
    let mut reply = 0u32;
    let err = xc
        .broadcast(&Context::background(), "Foo.Slow", &2_000u64, Some(&mut reply))
        .await
        .unwrap_err();

    assert!(err.to_string().contains("refuses"));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(reply, 0);
}

#[tokio::test]
async fn test_broadcast_without_reply_buffer() {
    let servers = [start_foo(1, false).await, start_foo(2, false).await];
    let xc = XClient::new(
        Arc::new(MultiServersDiscovery::new(servers.iter().map(tcp_addr).collect())),
        SelectMode::Random,
        Options::default(),
    );

    xc.broadcast::<_, u32>(&Context::background(), "Foo.Answer", &0u64, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_closed_pool_redials() {
    let server = start_foo(7, false).await;
    let xc = XClient::new(
        Arc::new(MultiServersDiscovery::new(vec![tcp_addr(&server)])),
        SelectMode::Random,
        Options::default(),
    );

    let id: u32 = xc.call(&Context::background(), "Foo.Id", &()).await.unwrap();
    assert_eq!(id, 7);
    xc.close().await.unwrap();
    assert_eq!(xc.pool_size().await, 0);

    let id: u32 = xc.call(&Context::background(), "Foo.Id", &()).await.unwrap();
    assert_eq!(id, 7);
}

#[tokio::test]
async fn test_unavailable_client_is_evicted() {
    let mut server = start_foo(7, false).await;
    let xc = XClient::new(
        Arc::new(MultiServersDiscovery::new(vec![tcp_addr(&server)])),
        SelectMode::Random,
        Options::default(),
    );

    let id: u32 = xc.call(&Context::background(), "Foo.Id", &()).await.unwrap();
    assert_eq!(id, 7);
    assert_eq!(xc.pool_size().await, 1);

    server.shutdown();

    // Once the pooled client sees the closed connection, the next call
    // evicts it and the redial is refused.
    let mut evicted = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Err(e) = xc.call::<_, u32>(&Context::background(), "Foo.Id", &()).await {
            if xc.pool_size().await == 0 {
                evicted = Some(e);
                break;
            }
        }
    }

    let err = evicted.expect("dead client was never evicted");
    assert!(matches!(err, RpcError::Io { .. }));
    assert_eq!(xc.pool_size().await, 0);
}

#[tokio::test]
async fn test_registry_discovery_rate_limits_lookups() {
    let hits = Arc::new(AtomicUsize::new(0));
    let registry = start_fake_registry("tcp@a:1,tcp@b:2".to_string(), Arc::clone(&hits)).await;
    let discovery = Arc::new(RegistryDiscovery::new(registry, Duration::from_millis(300)).unwrap());

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let discovery = Arc::clone(&discovery);
        tasks.push(tokio::spawn(async move { discovery.get_all().await.unwrap() }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), vec!["tcp@a:1", "tcp@b:2"]);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    discovery.get(SelectMode::Random).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(350)).await;
    discovery.get(SelectMode::RoundRobin).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_xclient_over_registry_discovery() {
    let servers = [start_foo(1, false).await, start_foo(2, false).await];
    let list = servers.iter().map(tcp_addr).collect::<Vec<_>>().join(",");
    let hits = Arc::new(AtomicUsize::new(0));
    let registry = start_fake_registry(list, Arc::clone(&hits)).await;

    let discovery = RegistryDiscovery::new(registry, Duration::from_secs(60)).unwrap();
    let xc = XClient::new(Arc::new(discovery), SelectMode::RoundRobin, Options::default());

    let first: u32 = xc.call(&Context::background(), "Foo.Id", &()).await.unwrap();
    let second: u32 = xc.call(&Context::background(), "Foo.Id", &()).await.unwrap();
    assert_eq!((first, second), (1, 2));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
