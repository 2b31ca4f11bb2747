//! Integration tests for the registry over HTTP.

use std::sync::Arc;
use std::time::Duration;

use simplerpc::{Context, MethodResult, Options, RegistryConfig, Server, Service};
use simplerpc_registry::{send_heartbeat, spawn_heartbeat, Registry};
use simplerpc_xclient::{Discovery, RegistryDiscovery, SelectMode, XClient};

struct Foo(u32);

#[tokio::test]
async fn test_get_lists_heartbeats() {
    let registry = Arc::new(Registry::new(Duration::from_secs(60)));
    let handle = Arc::clone(&registry).start("127.0.0.1:0").await.unwrap();
    let http = reqwest::Client::new();

    send_heartbeat(&http, &handle.url(), "tcp@127.0.0.1:2").await.unwrap();
    send_heartbeat(&http, &handle.url(), "tcp@127.0.0.1:1").await.unwrap();

    let response = http.get(handle.url()).send().await.unwrap();
    assert!(response.status().is_success());
    let servers = response
        .headers()
        .get(RegistryConfig::SERVERS_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(servers, "tcp@127.0.0.1:1,tcp@127.0.0.1:2");
}

#[tokio::test]
async fn test_post_without_server_header_fails() {
    let registry = Arc::new(Registry::default());
    let handle = registry.start("127.0.0.1:0").await.unwrap();

    let response = reqwest::Client::new()
        .post(handle.url())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_other_methods_not_allowed() {
    let registry = Arc::new(Registry::default());
    let handle = registry.start("127.0.0.1:0").await.unwrap();

    let response = reqwest::Client::new()
        .delete(handle.url())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_heartbeat_to_missing_registry_fails() {
    let http = reqwest::Client::new();
    let err = send_heartbeat(&http, "http://127.0.0.1:1/_simplerpc_/registry", "tcp@x:1")
        .await
        .unwrap_err();
    assert!(matches!(err, simplerpc::RpcError::Registry { .. }));
}

#[tokio::test]
async fn test_servers_discovered_through_heartbeats() {
    let registry = Arc::new(Registry::new(Duration::from_secs(60)));
    let registry_handle = Arc::clone(&registry).start("127.0.0.1:0").await.unwrap();

    let mut servers = Vec::new();
    let mut heartbeats = Vec::new();
    for id in [1u32, 2] {
        let server = Arc::new(Server::new());
        server
            .register(
                Service::builder(Foo(id))
                    .method("Id", |foo: Arc<Foo>, _: ()| async move { MethodResult::Ok(foo.0) })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let handle = server.start("127.0.0.1:0").await.unwrap();
        heartbeats.push(spawn_heartbeat(
            registry_handle.url(),
            format!("tcp@{}", handle.addr()),
            Duration::from_secs(30),
        ));
        servers.push(handle);
    }

    // Wait for the first heartbeats to land.
    for _ in 0..50 {
        if registry.alive_servers().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(registry.alive_servers().len(), 2);

    let discovery = Arc::new(RegistryDiscovery::new(registry_handle.url(), Duration::ZERO).unwrap());
    assert_eq!(discovery.get_all().await.unwrap().len(), 2);

    let xc = XClient::new(discovery, SelectMode::RoundRobin, Options::default());
    let mut ids = Vec::new();
    for _ in 0..2 {
        let id: u32 = xc.call(&Context::background(), "Foo.Id", &()).await.unwrap();
        ids.push(id);
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);

    for heartbeat in heartbeats {
        heartbeat.abort();
    }
}
