//! Client side of the tunnel: the control channel, backend dials and the
//! pooled tunnels that carry each session to the relay.

use crate::auth::validate_client_key;
use crate::connection::{ConnKind, ConnState, Connection};
use crate::pool::{TunnelDialer, TunnelPool};
use crate::pump::{self, FrameHandler, StreamHandler};
use crate::reconnect::ReconnectManager;
use crate::transport::tcp::TcpTransport;
use crate::transport::{self, TransportConfig};
use crate::tunnel::BackendSessions;
use async_trait::async_trait;
use bytes::Bytes;
use lanbridge_common::{ClientConfig, IdleConfig, Result, TunnelError};
use lanbridge_protocol::{Frame, FrameType, ProxyCodec};
use std::ops::Deref;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Client daemon: keeps a control channel to the relay alive and opens
/// backend sessions on request.
pub struct TunnelClient {
    config: ClientConfig,
    shutdown: CancellationToken,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Connects, authenticates and reconnects with backoff until shutdown.
    ///
    /// Only configuration errors are returned; a lost or refused control
    /// channel is retried.
    pub async fn run(self) -> Result<()> {
        self.config.validate()?;
        validate_client_key(&self.config.client_key)?;
        let transport = TransportConfig::from_tls_config(&self.config.tls)?;

        let client = ClientHandle(Arc::new(ClientInner {
            client_key: self.config.client_key.clone(),
            server_addr: self.config.server_addr.clone(),
            transport,
            codec: ProxyCodec::with_max_frame_size(self.config.max_frame_size),
            idle: self.config.idle,
            pool: TunnelPool::new(self.config.pool_capacity),
            sessions: BackendSessions::new(),
            shutdown: self.shutdown.clone(),
        }));
        let mut manager = ReconnectManager::new(self.config.resilience.clone().into());

        while !self.shutdown.is_cancelled() {
            match client.connect_control().await {
                Ok(control) => {
                    manager.on_connected();
                    info!(server = %client.server_addr, "Control channel established");
                    tokio::select! {
                        () = control.closed() => warn!("Control channel lost"),
                        () = self.shutdown.cancelled() => break,
                    }
                }
                Err(e) => warn!(server = %client.server_addr, "Failed to connect to relay: {}", e),
            }

            let delay = manager.on_disconnected();
            info!(
                attempt = manager.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );
            if !manager.wait(delay, &self.shutdown).await {
                break;
            }
        }

        client.sessions.clear_all();
        client.pool.clear();
        info!("Client stopped");
        Ok(())
    }
}

struct ClientInner {
    client_key: String,
    server_addr: String,
    transport: TransportConfig,
    codec: ProxyCodec,
    idle: IdleConfig,
    pool: TunnelPool,
    sessions: BackendSessions,
    shutdown: CancellationToken,
}

#[derive(Clone)]
struct ClientHandle(Arc<ClientInner>);

impl Deref for ClientHandle {
    type Target = ClientInner;

    fn deref(&self) -> &ClientInner {
        &self.0
    }
}

impl ClientHandle {
    async fn connect_control(&self) -> Result<Arc<Connection>> {
        let stream = transport::connect(&self.transport, &self.server_addr).await?;
        let (control, outbound) =
            Connection::new(ConnKind::Control, None, &self.idle, &self.shutdown, true);
        control.set_client_key(self.client_key.as_str());
        control.set_state(ConnState::AuthPending);
        pump::spawn_framed(
            control.clone(),
            outbound,
            stream,
            self.codec,
            self.idle,
            Arc::new(self.clone()),
        );

        if !control.send_frame(Frame::auth(self.client_key.as_str())) {
            return Err(TunnelError::TransportLoss(
                "control channel closed before AUTH".into(),
            ));
        }
        control.set_state(ConnState::Authenticated);
        Ok(control)
    }

    fn on_connect_request(&self, control: &Arc<Connection>, frame: &Frame) {
        let user_id = frame.uri().to_string();
        if user_id.is_empty() {
            warn!("CONNECT without a user id, ignored");
            return;
        }
        let lan = match std::str::from_utf8(&frame.payload) {
            Ok(lan) if !lan.is_empty() => lan.to_string(),
            _ => {
                warn!(user_id = %user_id, "CONNECT without a usable LAN target");
                control.send_frame(Frame::disconnect(user_id));
                return;
            }
        };

        let client = self.clone();
        let control = control.clone();
        tokio::spawn(async move {
            if let Err(e) = client.open_session(&control, &user_id, &lan).await {
                warn!(user_id = %user_id, lan = %lan, "Failed to open session: {}", e);
                control.send_frame(Frame::disconnect(user_id));
            }
        });
    }

    /// Dials the backend, binds it to a pooled tunnel and announces the
    /// binding to the relay.
    async fn open_session(&self, control: &Connection, user_id: &str, lan: &str) -> Result<()> {
        let stream = tokio::select! {
            () = self.shutdown.cancelled() => {
                return Err(TunnelError::Connection("shutting down".into()));
            }
            stream = TcpTransport::connect(lan) => stream?,
        };
        let (backend, outbound) = Connection::new(
            ConnKind::Backend,
            stream.peer_addr().ok(),
            &self.idle,
            &self.shutdown,
            false,
        );
        backend.set_user_id(user_id);
        backend.set_state(ConnState::ConnectPending);
        pump::spawn_raw(backend.clone(), outbound, stream, Arc::new(self.clone()));

        let tunnel = match self.pool.borrow(self).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                backend.abort();
                return Err(e);
            }
        };

        tunnel.set_user_id(user_id);
        if !Connection::try_bind(&tunnel, &backend) {
            self.pool.give_back(tunnel);
            backend.abort();
            return Err(TunnelError::InvalidState(format!(
                "backend for user {user_id} closed before binding"
            )));
        }
        self.sessions.add(user_id, backend.clone());

        if !tunnel.send_frame(Frame::connect_tunnel(user_id, &self.client_key)) {
            let _ = tunnel.unbind();
            let _ = backend.unbind();
            self.sessions.remove(user_id, &backend);
            backend.abort();
            return Err(TunnelError::TransportLoss(format!(
                "tunnel for user {user_id} closed before CONNECT"
            )));
        }
        backend.set_auto_read(true);

        // the control channel may have been lost while dialing
        if control.is_closed() {
            self.end_backend_session(&backend);
            return Ok(());
        }
        debug!(user_id, lan, tunnel_id = tunnel.id(), "Session opened");
        Ok(())
    }

    /// Closes a backend after flushing and releases its tunnel to the pool.
    fn end_backend_session(&self, backend: &Connection) {
        if let Some(user_id) = backend.user_id() {
            self.sessions.remove(&user_id, backend);
        }
        if let Some(tunnel) = backend.unbind() {
            let _ = tunnel.unbind();
            self.pool.give_back(tunnel);
        }
        backend.close();
    }

    fn on_tunnel_frame(&self, tunnel: &Arc<Connection>, frame: Frame) {
        match frame.frame_type {
            FrameType::Transfer => {
                if !tunnel.is_bound_to(frame.uri.as_deref()) {
                    debug!(tunnel_id = tunnel.id(), uri = frame.uri(), "Stale TRANSFER ignored");
                    return;
                }
                if let Some(backend) = tunnel.peer() {
                    backend.send_bytes(frame.payload);
                }
            }
            FrameType::Disconnect => {
                if !tunnel.is_bound_to(frame.uri.as_deref()) {
                    debug!(tunnel_id = tunnel.id(), uri = frame.uri(), "Stale DISCONNECT ignored");
                    return;
                }
                let backend = tunnel.unbind();
                self.pool.give_back(tunnel.clone());
                if let Some(backend) = backend {
                    let _ = backend.unbind();
                    if let Some(user_id) = backend.user_id() {
                        self.sessions.remove(&user_id, &backend);
                    }
                    backend.close();
                }
            }
            FrameType::Heartbeat => {}
            other => debug!(tunnel_id = tunnel.id(), frame_type = %other, "Unexpected frame on tunnel"),
        }
    }
}

#[async_trait]
impl TunnelDialer for ClientHandle {
    async fn dial_tunnel(&self) -> Result<Arc<Connection>> {
        let stream = transport::connect(&self.transport, &self.server_addr)
            .await
            .map_err(|e| TunnelError::Dial(format!("tunnel to {}: {e}", self.server_addr)))?;
        let (tunnel, outbound) =
            Connection::new(ConnKind::Tunnel, None, &self.idle, &self.shutdown, true);
        tunnel.set_client_key(self.client_key.as_str());
        pump::spawn_framed(
            tunnel.clone(),
            outbound,
            stream,
            self.codec,
            self.idle,
            Arc::new(self.clone()),
        );
        debug!(tunnel_id = tunnel.id(), "Tunnel dialed");
        Ok(tunnel)
    }
}

impl FrameHandler for ClientHandle {
    fn on_frame(&self, conn: &Arc<Connection>, frame: Frame) {
        match conn.kind() {
            ConnKind::Control => match frame.frame_type {
                FrameType::Connect => self.on_connect_request(conn, &frame),
                FrameType::Heartbeat => {}
                other => debug!(frame_type = %other, "Unexpected frame on control channel"),
            },
            ConnKind::Tunnel => self.on_tunnel_frame(conn, frame),
            _ => {}
        }
    }

    fn on_closed(&self, conn: &Arc<Connection>) {
        match conn.kind() {
            ConnKind::Control => {
                let closed = self.sessions.clear_all();
                self.pool.clear();
                info!(sessions = closed, "Control channel closed, sessions torn down");
            }
            ConnKind::Tunnel => {
                self.pool.remove(conn);
                if let Some(backend) = conn.unbind() {
                    let _ = backend.unbind();
                    if let Some(user_id) = backend.user_id() {
                        self.sessions.remove(&user_id, &backend);
                    }
                    backend.close();
                }
            }
            _ => {}
        }
    }
}

impl StreamHandler for ClientHandle {
    fn on_data(&self, backend: &Arc<Connection>, data: Bytes) {
        let (Some(tunnel), Some(user_id)) = (backend.peer(), backend.user_id()) else {
            debug!(conn_id = backend.id(), "Backend data with no tunnel, closing");
            backend.close();
            return;
        };
        tunnel.send_frame(Frame::transfer(user_id, data));
    }

    fn on_closed(&self, backend: &Arc<Connection>) {
        let Some(user_id) = backend.user_id() else {
            return;
        };
        self.sessions.remove(&user_id, backend);
        if let Some(tunnel) = backend.unbind() {
            let _ = tunnel.unbind();
            tunnel.send_frame(Frame::disconnect(user_id.as_str()));
            self.pool.give_back(tunnel);
        }
        debug!(user_id = %user_id, "Backend closed");
    }
}
