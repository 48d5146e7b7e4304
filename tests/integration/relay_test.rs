//! End-to-end sessions through a relay and a client

use super::{
    client_config, dead_address, get_free_port, http_get, single_mapping, start_client,
    start_echo_backend, start_http_backend, wait_until, TestRelay, HTTP_RESPONSE,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn test_http_request_is_byte_identical() {
    let backend = start_http_backend().await;
    let port = get_free_port();
    let relay = TestRelay::start(single_mapping("k1", port, &backend.to_string())).await;
    let client = start_client(client_config(relay.addr, "k1"));
    relay.wait_online("k1").await;

    let response = http_get(port).await;
    assert_eq!(response, HTTP_RESPONSE);

    // a second request reuses the pooled tunnel
    let response = http_get(port).await;
    assert_eq!(response, HTTP_RESPONSE);

    let registry = relay.registry.clone();
    assert!(wait_until(Duration::from_secs(2), || registry.user_count("k1") == 0).await);
    client.cancel();
}

#[tokio::test]
async fn test_large_transfer_survives_backpressure() {
    let backend = start_echo_backend().await;
    let port = get_free_port();
    let relay = TestRelay::start(single_mapping("k1", port, &backend.to_string())).await;
    let client = start_client(client_config(relay.addr, "k1"));
    relay.wait_online("k1").await;

    let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let expected = payload.clone();
    let writer_task = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut echoed = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(20), reader.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert!(echoed == expected, "echoed bytes differ");
    drop(writer_task.await.unwrap());
    client.cancel();
}

#[tokio::test]
async fn test_backend_dial_failure_closes_user() {
    let lan = dead_address().await;
    let port = get_free_port();
    let relay = TestRelay::start(single_mapping("k1", port, &lan)).await;
    let client = start_client(client_config(relay.addr, "k1"));
    relay.wait_online("k1").await;

    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), user.read_to_end(&mut received))
        .await
        .expect("user was not closed")
        .unwrap();
    assert!(received.is_empty());

    let registry = relay.registry.clone();
    assert!(wait_until(Duration::from_secs(2), || registry.user_count("k1") == 0).await);
    client.cancel();
}

#[tokio::test]
async fn test_backend_close_tears_down_user() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let lan = backend.local_addr().unwrap().to_string();
    let port = get_free_port();
    let relay = TestRelay::start(single_mapping("k1", port, &lan)).await;
    let client = start_client(client_config(relay.addr, "k1"));
    relay.wait_online("k1").await;

    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut accepted, _) = backend.accept().await.unwrap();
    accepted.write_all(b"bye").await.unwrap();
    drop(accepted);

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), user.read_to_end(&mut received))
        .await
        .expect("user was not closed")
        .unwrap();
    assert_eq!(received, b"bye");
    client.cancel();
}

#[tokio::test]
async fn test_user_close_closes_backend() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let lan = backend.local_addr().unwrap().to_string();
    let port = get_free_port();
    let relay = TestRelay::start(single_mapping("k1", port, &lan)).await;
    let client = start_client(client_config(relay.addr, "k1"));
    relay.wait_online("k1").await;

    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut accepted, _) = backend.accept().await.unwrap();
    user.write_all(b"hello").await.unwrap();
    let mut hello = [0u8; 5];
    accepted.read_exact(&mut hello).await.unwrap();
    assert_eq!(&hello, b"hello");

    drop(user);
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), accepted.read_to_end(&mut rest))
        .await
        .expect("backend was not closed")
        .unwrap();
    assert!(rest.is_empty());
    client.cancel();
}

#[tokio::test]
async fn test_client_loss_closes_users() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let lan = backend.local_addr().unwrap().to_string();
    let port = get_free_port();
    let relay = TestRelay::start(single_mapping("k1", port, &lan)).await;
    let client = start_client(client_config(relay.addr, "k1"));
    relay.wait_online("k1").await;

    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let _accepted = backend.accept().await.unwrap();

    client.cancel();
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), user.read_to_end(&mut received))
        .await
        .expect("user survived client loss")
        .unwrap();

    let registry = relay.registry.clone();
    assert!(wait_until(Duration::from_secs(2), || !registry.is_online("k1")).await);
}

#[tokio::test]
async fn test_client_retries_until_relay_is_up() {
    let backend = start_http_backend().await;
    let port = get_free_port();
    let relay_port = get_free_port();
    let relay_addr: SocketAddr = format!("127.0.0.1:{relay_port}").parse().unwrap();

    // client first: initial attempts fail and back off
    let client = start_client(client_config(relay_addr, "k1"));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let relay = TestRelay::start_with(single_mapping("k1", port, &backend.to_string()), |c| {
        c.bind_addr = relay_addr;
    })
    .await;
    relay.wait_online("k1").await;
    assert_eq!(http_get(port).await, HTTP_RESPONSE);
    client.cancel();
}

#[tokio::test]
async fn test_tunnel_loss_closes_user_and_backend() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let lan = backend.local_addr().unwrap().to_string();
    let port = get_free_port();
    let relay = TestRelay::start(single_mapping("k1", port, &lan)).await;
    let client = start_client(client_config(relay.addr, "k1"));
    relay.wait_online("k1").await;

    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut accepted, _) = backend.accept().await.unwrap();
    user.write_all(b"hello").await.unwrap();
    let mut hello = [0u8; 5];
    accepted.read_exact(&mut hello).await.unwrap();

    let sessions = relay.registry.user_sessions("k1");
    assert_eq!(sessions.len(), 1);
    let tunnel = sessions[0].peer().expect("user not bound to a tunnel");
    tunnel.abort();

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), user.read_to_end(&mut rest))
        .await
        .expect("user survived tunnel loss")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), accepted.read_to_end(&mut rest))
        .await
        .expect("backend survived tunnel loss")
        .unwrap();
    let registry = relay.registry.clone();
    assert!(wait_until(Duration::from_secs(2), || registry.user_count("k1") == 0).await);

    // the dead tunnel is gone from the pool, so the next session works
    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (mut accepted, _) = backend.accept().await.unwrap();
    user.write_all(b"again").await.unwrap();
    let mut again = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), accepted.read_exact(&mut again))
        .await
        .expect("second session stalled")
        .unwrap();
    assert_eq!(&again, b"again");
    client.cancel();
}

/// First connection floods until closed, later ones echo.
async fn start_flood_then_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let nth = accepted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if nth == 0 {
                    let chunk = vec![7u8; 64 * 1024];
                    while socket.write_all(&chunk).await.is_ok() {}
                } else {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_tunnel_reused_after_stalled_user_leaves() {
    let backend = start_flood_then_echo_backend().await;
    let port = get_free_port();
    let relay = TestRelay::start(single_mapping("k1", port, &backend.to_string())).await;
    let client = start_client(client_config(relay.addr, "k1"));
    relay.wait_online("k1").await;

    // never reads, so the relay stops reading its tunnel
    let stalled = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let registry = relay.registry.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            registry
                .user_sessions("k1")
                .iter()
                .any(|user| !user.is_writable())
        })
        .await,
        "stalled user never became unwritable"
    );

    drop(stalled);
    assert!(wait_until(Duration::from_secs(5), || registry.user_count("k1") == 0).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    user.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(10), user.read_exact(&mut pong))
        .await
        .expect("session on the reused tunnel stalled")
        .unwrap();
    assert_eq!(&pong, b"ping");
    client.cancel();
}
