//! Control-channel and tunnel handshakes against a live relay, driven
//! over the raw wire protocol.

use super::{get_free_port, single_mapping, wait_until, RawPeer, TestRelay};
use bytes::Bytes;
use lanbridge_protocol::{Frame, FrameType};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_unknown_key_is_closed() {
    let relay = TestRelay::start(single_mapping("k1", get_free_port(), "127.0.0.1:80")).await;

    let mut peer = RawPeer::connect(relay.addr).await;
    peer.send(Frame::auth("intruder")).await;
    assert!(peer.recv().await.is_none());
    assert_eq!(relay.registry.client_count(), 0);
}

#[tokio::test]
async fn test_heartbeat_is_answered() {
    let relay = TestRelay::start(single_mapping("k1", get_free_port(), "127.0.0.1:80")).await;

    let mut peer = RawPeer::connect(relay.addr).await;
    peer.send(Frame::auth("k1")).await;
    peer.send(Frame::heartbeat().with_serial_number(7)).await;

    let reply = peer.recv().await.unwrap();
    assert_eq!(reply.frame_type, FrameType::Heartbeat);
    assert_eq!(reply.serial_number, 7);
}

#[tokio::test]
async fn test_duplicate_auth_keeps_original() {
    let port = get_free_port();
    let relay = TestRelay::start(single_mapping("k1", port, "127.0.0.1:80")).await;

    let mut first = RawPeer::connect(relay.addr).await;
    first.send(Frame::auth("k1")).await;
    relay.wait_online("k1").await;

    let mut second = RawPeer::connect(relay.addr).await;
    second.send(Frame::auth("k1")).await;
    assert!(second.recv().await.is_none());

    // the original still receives CONNECT requests for its port
    let _user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let connect = first.recv().await.unwrap();
    assert_eq!(connect.frame_type, FrameType::Connect);
    assert_eq!(&connect.payload[..], b"127.0.0.1:80");
}

#[tokio::test]
async fn test_orphan_tunnel_connect_is_closed() {
    let relay = TestRelay::start(single_mapping("k1", get_free_port(), "127.0.0.1:80")).await;
    let mut control = RawPeer::connect(relay.addr).await;
    control.send(Frame::auth("k1")).await;
    relay.wait_online("k1").await;

    let mut tunnel = RawPeer::connect(relay.addr).await;
    tunnel.send(Frame::connect_tunnel("12345", "k1")).await;
    assert!(tunnel.recv().await.is_none());

    let mut malformed = RawPeer::connect(relay.addr).await;
    malformed
        .send(Frame::new(FrameType::Connect).with_uri("no-separator"))
        .await;
    assert!(malformed.recv().await.is_none());
    assert_eq!(relay.registry.user_count("k1"), 0);
}

#[tokio::test]
async fn test_manual_session_and_stale_frames() {
    let port = get_free_port();
    let relay = TestRelay::start(single_mapping("k1", port, "10.0.0.9:22")).await;
    let mut control = RawPeer::connect(relay.addr).await;
    control.send(Frame::auth("k1")).await;
    relay.wait_online("k1").await;

    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let connect = control.recv().await.unwrap();
    assert_eq!(connect.frame_type, FrameType::Connect);
    let user_id = connect.uri().to_string();

    let mut tunnel = RawPeer::connect(relay.addr).await;
    tunnel.send(Frame::connect_tunnel(&user_id, "k1")).await;

    // a frame naming another session is dropped, the bound one is delivered
    tunnel
        .send(Frame::transfer("999999", Bytes::from_static(b"stale")))
        .await;
    tunnel
        .send(Frame::transfer(user_id.as_str(), Bytes::from_static(b"fresh")))
        .await;
    let mut got = [0u8; 5];
    user.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"fresh");

    user.write_all(b"ack").await.unwrap();
    let frame = tunnel.recv().await.unwrap();
    assert_eq!(frame, Frame::transfer(user_id.as_str(), Bytes::from_static(b"ack")));

    // a stale DISCONNECT leaves the session up
    tunnel.send(Frame::disconnect("999999")).await;
    tunnel
        .send(Frame::transfer(user_id.as_str(), Bytes::from_static(b"still")))
        .await;
    user.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"still");

    tunnel.send(Frame::disconnect(user_id.as_str())).await;
    let mut rest = Vec::new();
    user.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let registry = relay.registry.clone();
    assert!(wait_until(Duration::from_secs(2), || registry.user_count("k1") == 0).await);
}
