//! Live mapping updates on a running relay

use super::{
    client_config, get_free_port, http_get, single_mapping, start_client, start_http_backend,
    wait_until, RawPeer, TestRelay, HTTP_RESPONSE,
};
use lanbridge_common::MappingStore;
use lanbridge_protocol::Frame;
use std::time::Duration;
use tokio::net::TcpStream;

#[tokio::test]
async fn test_new_port_is_bound_and_old_released() {
    let backend = start_http_backend().await;
    let old_port = get_free_port();
    let relay = TestRelay::start(single_mapping("k1", old_port, &backend.to_string())).await;
    let client = start_client(client_config(relay.addr, "k1"));
    relay.wait_online("k1").await;
    assert_eq!(http_get(old_port).await, HTTP_RESPONSE);

    let new_port = get_free_port();
    relay
        .mappings
        .update(single_mapping("k1", new_port, &backend.to_string()))
        .unwrap();

    let registry = relay.registry.clone();
    assert!(
        wait_until(Duration::from_secs(2), || registry.ports_of("k1") == vec![new_port]).await
    );
    assert!(super::wait_for_server(
        format!("127.0.0.1:{new_port}").parse().unwrap(),
        Duration::from_secs(2)
    )
    .await);
    assert_eq!(http_get(new_port).await, HTTP_RESPONSE);

    let mut released = false;
    for _ in 0..100 {
        if TcpStream::connect(("127.0.0.1", old_port)).await.is_err() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "old port still accepting");
    client.cancel();
}

#[tokio::test]
async fn test_removed_key_is_disconnected() {
    let relay = TestRelay::start(single_mapping("k1", get_free_port(), "127.0.0.1:80")).await;
    let mut control = RawPeer::connect(relay.addr).await;
    control.send(Frame::auth("k1")).await;
    relay.wait_online("k1").await;

    relay
        .mappings
        .update(single_mapping("k2", get_free_port(), "127.0.0.1:80"))
        .unwrap();

    assert!(control.recv().await.is_none());
    let registry = relay.registry.clone();
    assert!(wait_until(Duration::from_secs(2), || !registry.is_online("k1")).await);
}

#[tokio::test]
async fn test_store_persists_updates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lanbridge.json");

    let store = MappingStore::load(&path).unwrap();
    assert!(store.current().clients().is_empty());
    store
        .update(single_mapping("k1", 18443, "192.168.1.10:443"))
        .unwrap();

    let reloaded = MappingStore::load(&path).unwrap();
    assert_eq!(reloaded.current().lan_target(18443), Some("192.168.1.10:443"));
    assert_eq!(reloaded.current().client_key_for_port(18443), Some("k1"));
}
