//! Transport layer for control channels and tunnels: plain TCP or TLS.
//!
//! User and backend connections are always plain TCP and use
//! [`tcp::TcpTransport`] directly.

use lanbridge_common::{Result, TlsConfig};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

pub mod socket_tuning;
pub mod tcp;
pub mod tls;

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport selection for the client's outbound connections.
#[derive(Clone, Default)]
pub enum TransportConfig {
    #[default]
    Tcp,
    Tls(tls::TlsClientTransport),
}

impl TransportConfig {
    pub fn from_tls_config(config: &TlsConfig) -> Result<Self> {
        if config.enabled {
            Ok(Self::Tls(tls::TlsClientTransport::new(config)?))
        } else {
            Ok(Self::Tcp)
        }
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => f.write_str("Tcp"),
            Self::Tls(_) => f.write_str("Tls"),
        }
    }
}

pub async fn connect(config: &TransportConfig, addr: &str) -> io::Result<BoxedStream> {
    match config {
        TransportConfig::Tcp => tcp::connect(addr).await,
        TransportConfig::Tls(transport) => tls::connect(addr, transport).await,
    }
}

/// Accepts one TCP connection and applies socket tuning.
pub async fn accept_tcp(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept().await?;
    socket_tuning::configure_socket_silent(&stream);
    Ok((stream, addr))
}

/// Completes the server side of a connection, running the TLS handshake
/// when an acceptor is given.
pub async fn upgrade(stream: TcpStream, acceptor: Option<&TlsAcceptor>) -> io::Result<BoxedStream> {
    match acceptor {
        None => Ok(Box::pin(stream)),
        Some(acceptor) => {
            let tls_stream = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;
            Ok(Box::pin(tls_stream))
        }
    }
}
