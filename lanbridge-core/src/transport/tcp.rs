//! Plain TCP transport

use super::socket_tuning::configure_socket_silent;
use super::BoxedStream;
use lanbridge_common::{Result, TunnelError};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

pub struct TcpTransport;

impl TcpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr).await?;
        Ok(listener)
    }

    /// Binds `host:port`, used for public user ports.
    pub async fn bind_host(host: &str, port: u16) -> Result<TcpListener> {
        TcpListener::bind((host, port))
            .await
            .map_err(|e| TunnelError::Connection(format!("bind {host}:{port}: {e}")))
    }

    /// Dials a backend (`host:port`) inside the client's network.
    pub async fn connect(addr: &str) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TunnelError::Dial(format!("{addr}: {e}")))?;
        configure_socket_silent(&stream);
        Ok(stream)
    }
}

pub async fn connect(addr: &str) -> io::Result<BoxedStream> {
    let stream = TcpStream::connect(addr).await?;
    configure_socket_silent(&stream);
    Ok(Box::pin(stream))
}
