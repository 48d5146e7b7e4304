#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for `LanBridge`
//!
//! These tests run a real relay and client on loopback and drive user
//! connections through them.

mod control_test;
mod mapping_test;
mod relay_test;
mod tls_test;

use bytes::BytesMut;
use lanbridge_common::{ClientConfig, MappingStore, MappingTable, RelayConfig, ResilienceConfig};
use lanbridge_core::{ClientRegistry, RelayServer, TunnelClient};
use lanbridge_protocol::{Frame, ProxyCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;

pub const HTTP_RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\n\
Content-Type: text/plain\r\n\
Content-Length: 13\r\n\
\r\n\
Hello, World!";

static NEXT_PORT: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(30000);

pub fn get_free_port() -> u16 {
    use std::sync::atomic::Ordering;
    loop {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
}

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Mapping document with one client key owning one public port.
pub fn single_mapping(client_key: &str, port: u16, lan: &str) -> MappingTable {
    MappingTable::parse(&format!(
        r#"[{{"name": "test", "clientKey": "{client_key}", "proxyMappings": [{{"inetPort": {port}, "lan": "{lan}"}}]}}]"#
    ))
    .unwrap()
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// A relay running in the background on loopback.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub registry: Arc<ClientRegistry>,
    pub mappings: Arc<MappingStore>,
    pub shutdown: CancellationToken,
}

impl TestRelay {
    pub async fn start(table: MappingTable) -> Self {
        Self::start_with(table, |_| {}).await
    }

    pub async fn start_with(table: MappingTable, configure: impl FnOnce(&mut RelayConfig)) -> Self {
        init_test_logging();
        let addr: SocketAddr = format!("127.0.0.1:{}", get_free_port()).parse().unwrap();
        let mut config = RelayConfig {
            bind_addr: addr,
            user_bind_host: "127.0.0.1".to_string(),
            ..RelayConfig::default()
        };
        configure(&mut config);
        let addr = config.bind_addr;

        let mappings = Arc::new(MappingStore::new(table));
        let shutdown = CancellationToken::new();
        let server = RelayServer::new(config, mappings.clone()).with_shutdown(shutdown.clone());
        let registry = server.registry();
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("test relay failed: {}", e);
            }
        });
        assert!(wait_for_server(addr, Duration::from_secs(5)).await);

        Self {
            addr,
            registry,
            mappings,
            shutdown,
        }
    }

    pub async fn wait_online(&self, client_key: &str) {
        let registry = self.registry.clone();
        assert!(
            wait_until(Duration::from_secs(5), || registry.is_online(client_key)).await,
            "client {client_key} never came online"
        );
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn client_config(server_addr: SocketAddr, client_key: &str) -> ClientConfig {
    ClientConfig {
        server_addr: server_addr.to_string(),
        client_key: client_key.to_string(),
        resilience: ResilienceConfig {
            reconnect_base: Duration::from_millis(50),
            reconnect_max: Duration::from_secs(1),
        },
        ..ClientConfig::default()
    }
}

/// Runs a client in the background; cancelling the token stops it.
pub fn start_client(config: ClientConfig) -> CancellationToken {
    let shutdown = CancellationToken::new();
    let client = TunnelClient::new(config).with_shutdown(shutdown.clone());
    tokio::spawn(async move {
        if let Err(e) = client.run().await {
            tracing::error!("test client failed: {}", e);
        }
    });
    shutdown
}

/// Wait for a server to start listening
pub async fn wait_for_server(addr: SocketAddr, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

/// HTTP/1.0 backend: reads one request head, answers [`HTTP_RESPONSE`]
/// and closes.
pub async fn start_http_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = socket.write_all(HTTP_RESPONSE).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Echoes every byte back until the peer closes.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

/// Sends one HTTP/1.0 request through `port` and returns every byte
/// received until the relay closes the connection.
pub async fn http_get(port: u16) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.0\r\nHost: lan.test\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    response
}

/// Speaks the wire protocol directly, standing in for a client.
pub struct RawPeer {
    stream: TcpStream,
    codec: ProxyCodec,
    buf: BytesMut,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            codec: ProxyCodec::new(),
            buf: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        let mut out = BytesMut::new();
        self.codec.encode(frame, &mut out).unwrap();
        self.stream.write_all(&out).await.unwrap();
    }

    /// Next frame, or `None` once the relay closed the connection.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(frame) = self.codec.decode(&mut self.buf).unwrap() {
                    return Some(frame);
                }
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        })
        .await
        .expect("no frame or close within timeout")
    }
}
