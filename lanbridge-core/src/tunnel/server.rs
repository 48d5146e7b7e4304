//! Relay side of the tunnel: client listeners, public user ports and the
//! session binder that pairs user connections with client tunnels.

use crate::auth::validate_client_key;
use crate::connection::{ConnKind, ConnState, Connection};
use crate::pump::{self, FrameHandler, StreamHandler};
use crate::registry::ClientRegistry;
use crate::transport::tcp::TcpTransport;
use crate::transport::{self, tls, BoxedStream};
use crate::tunnel::stats;
use bytes::Bytes;
use dashmap::DashMap;
use lanbridge_common::{IdleConfig, MappingStore, MappingTable, RelayConfig, Result};
use lanbridge_protocol::{Frame, FrameType, ProxyCodec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Back-off after a failed accept so a full fd table does not spin the loop.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Public relay: accepts control channels and tunnels from clients and
/// user connections on the mapped public ports.
pub struct RelayServer {
    config: RelayConfig,
    mappings: Arc<MappingStore>,
    registry: Arc<ClientRegistry>,
    shutdown: CancellationToken,
}

impl RelayServer {
    pub fn new(config: RelayConfig, mappings: Arc<MappingStore>) -> Self {
        Self {
            config,
            mappings,
            registry: Arc::new(ClientRegistry::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop the relay and every connection when `token` is cancelled.
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    pub fn mappings(&self) -> Arc<MappingStore> {
        self.mappings.clone()
    }

    /// Binds every listener, then serves until shutdown.
    ///
    /// Failing to bind the client listeners or any initially mapped public
    /// port is returned as an error before anything is served.
    pub async fn run(self) -> Result<()> {
        self.config.validate()?;

        let listener = TcpTransport::bind(self.config.bind_addr).await?;
        info!("Relay listening on {}", self.config.bind_addr);

        let tls_listener = match self.config.tls_bind_addr {
            Some(addr) => {
                let acceptor = tls::create_acceptor(&self.config.tls)?;
                let listener = TcpTransport::bind(addr).await?;
                info!("Relay TLS listening on {}", addr);
                Some((listener, acceptor))
            }
            None => None,
        };

        let shared = Arc::new(RelayShared {
            registry: self.registry.clone(),
            mappings: self.mappings.clone(),
            idle: self.config.idle,
            codec: ProxyCodec::with_max_frame_size(self.config.max_frame_size),
            shutdown: self.shutdown.clone(),
        });
        let user_ports = Arc::new(UserPorts::new(
            shared.clone(),
            self.config.user_bind_host.clone(),
        ));

        let mut updates = self.mappings.subscribe();
        let initial = updates.borrow_and_update().clone();
        user_ports.sync(&initial).await?;

        tokio::spawn(watch_mappings(
            shared.clone(),
            user_ports.clone(),
            updates,
            self.shutdown.clone(),
        ));
        tokio::spawn(serve_clients(
            shared.clone(),
            listener,
            None,
            self.shutdown.clone(),
        ));
        if let Some((listener, acceptor)) = tls_listener {
            tokio::spawn(serve_clients(
                shared,
                listener,
                Some(acceptor),
                self.shutdown.clone(),
            ));
        }

        self.shutdown.cancelled().await;
        user_ports.release_all();
        info!("Relay stopped");
        Ok(())
    }
}

async fn serve_clients(
    shared: Arc<RelayShared>,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = transport::accept_tcp(&listener) => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                let shared = shared.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match transport::upgrade(stream, acceptor.as_ref()).await {
                        Ok(stream) => shared.accept_client(stream, addr),
                        Err(e) => warn!("TLS handshake with {} failed: {}", addr, e),
                    }
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }
}

async fn watch_mappings(
    shared: Arc<RelayShared>,
    user_ports: Arc<UserPorts>,
    mut updates: watch::Receiver<Arc<MappingTable>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let table = updates.borrow_and_update().clone();
        shared.registry.apply_mappings(&table);
        if let Err(e) = user_ports.sync(&table).await {
            error!("Failed to apply mapping update: {}", e);
        }
    }
}

/// Listeners for the public user ports, kept in step with the mapping table.
struct UserPorts {
    shared: Arc<RelayShared>,
    host: String,
    active: DashMap<u16, CancellationToken>,
}

impl UserPorts {
    fn new(shared: Arc<RelayShared>, host: String) -> Self {
        Self {
            shared,
            host,
            active: DashMap::new(),
        }
    }

    /// Binds ports new to `table` and releases ports it no longer lists.
    /// Every port is attempted; the first bind failure is returned.
    async fn sync(&self, table: &MappingTable) -> Result<()> {
        let wanted = table.user_ports();

        let stale: Vec<u16> = self
            .active
            .iter()
            .map(|e| *e.key())
            .filter(|port| !wanted.contains(port))
            .collect();
        for port in stale {
            if let Some((_, token)) = self.active.remove(&port) {
                token.cancel();
            }
        }

        let mut first_error = None;
        for port in wanted {
            if self.active.contains_key(&port) {
                continue;
            }
            match TcpTransport::bind_host(&self.host, port).await {
                Ok(listener) => {
                    let token = self.shared.shutdown.child_token();
                    self.active.insert(port, token.clone());
                    tokio::spawn(serve_user_port(self.shared.clone(), listener, port, token));
                }
                Err(e) => {
                    error!(port, "Failed to bind user port: {}", e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release_all(&self) {
        for entry in &self.active {
            entry.value().cancel();
        }
        self.active.clear();
    }
}

async fn serve_user_port(
    shared: Arc<RelayShared>,
    listener: TcpListener,
    port: u16,
    token: CancellationToken,
) {
    info!(port, "User port listening");
    loop {
        let accepted = tokio::select! {
            () = token.cancelled() => break,
            accepted = transport::accept_tcp(&listener) => accepted,
        };

        match accepted {
            Ok((stream, addr)) => shared.accept_user(stream, addr, port),
            Err(e) => {
                error!(port, "Accept error: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
            }
        }
    }
    info!(port, "User port released");
}

struct RelayShared {
    registry: Arc<ClientRegistry>,
    mappings: Arc<MappingStore>,
    idle: IdleConfig,
    codec: ProxyCodec,
    shutdown: CancellationToken,
}

impl RelayShared {
    /// New connection on the client listener; its role is decided by the
    /// first frame (AUTH for a control channel, CONNECT for a tunnel).
    fn accept_client(self: &Arc<Self>, stream: BoxedStream, addr: SocketAddr) {
        let (conn, outbound) =
            Connection::new(ConnKind::Inbound, Some(addr), &self.idle, &self.shutdown, true);
        debug!(conn_id = conn.id(), %addr, "Client connection accepted");
        pump::spawn_framed(conn, outbound, stream, self.codec, self.idle, self.clone());
    }

    fn accept_user(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, port: u16) {
        let Some((client_key, control)) = self.registry.lookup_by_port(port) else {
            info!(port, %addr, "No client online for port, closing user connection");
            return;
        };
        let table = self.mappings.current();
        let Some(lan) = table.lan_target(port).map(str::to_string) else {
            warn!(port, %addr, "Port has no LAN mapping, closing user connection");
            return;
        };

        let (user, outbound) =
            Connection::new(ConnKind::User, Some(addr), &self.idle, &self.shutdown, false);
        let user_id = self.registry.next_user_id().to_string();
        user.set_client_key(&client_key);
        user.set_user_id(&user_id);
        user.set_local_port(port);
        user.set_state(ConnState::ConnectPending);

        if let Err(e) = self
            .registry
            .bind_user_session(&client_key, &user_id, user.clone())
        {
            warn!(port, %addr, "Dropping user connection: {}", e);
            return;
        }
        stats::user_connected(Some(port));
        pump::spawn_raw(user.clone(), outbound, stream, self.clone());

        if control.send_frame(Frame::connect_request(user_id.as_str(), &lan)) {
            info!(port, user_id = %user_id, client_key = %client_key, %addr, "User connected");
        } else {
            warn!(port, user_id = %user_id, "Control channel gone, closing user connection");
            user.abort();
        }
    }

    fn handle_auth(&self, conn: &Arc<Connection>, frame: &Frame) {
        if conn.kind() != ConnKind::Inbound {
            warn!(conn_id = conn.id(), kind = ?conn.kind(), "Unexpected AUTH, closing");
            conn.close();
            return;
        }

        let client_key = frame.uri();
        if let Err(e) = validate_client_key(client_key) {
            warn!(conn_id = conn.id(), "Rejected AUTH: {}", e);
            conn.close();
            return;
        }

        let table = self.mappings.current();
        if !table.contains_client(client_key) {
            warn!(conn_id = conn.id(), client_key, "Unknown client key, closing");
            conn.close();
            return;
        }

        conn.set_client_key(client_key);
        let ports = table.client_inet_ports(client_key);
        match self
            .registry
            .register_control_channel(client_key, ports.clone(), conn.clone())
        {
            Ok(()) => {
                conn.set_kind(ConnKind::Control);
                conn.set_state(ConnState::Authenticated);
                stats::control_opened();
                info!(conn_id = conn.id(), client_key, ?ports, "Client authenticated");
            }
            Err(e) => {
                warn!(conn_id = conn.id(), "{}, closing new connection", e);
                conn.close();
            }
        }
    }

    fn handle_tunnel_connect(&self, conn: &Arc<Connection>, frame: &Frame) {
        match conn.kind() {
            ConnKind::Inbound | ConnKind::Tunnel => {}
            kind => {
                warn!(conn_id = conn.id(), ?kind, "CONNECT on a non-tunnel connection, ignored");
                return;
            }
        }
        if conn.state() == ConnState::Bound {
            warn!(conn_id = conn.id(), "CONNECT on a bound tunnel, closing");
            conn.close();
            return;
        }

        let Some((user_id, client_key)) = frame.split_tunnel_uri() else {
            warn!(conn_id = conn.id(), uri = frame.uri(), "Malformed tunnel CONNECT, closing");
            conn.close();
            return;
        };
        let Some(user) = self.registry.resolve_user_session(client_key, user_id) else {
            warn!(conn_id = conn.id(), client_key, user_id, "Unknown user session, closing tunnel");
            conn.close();
            return;
        };

        conn.set_kind(ConnKind::Tunnel);
        conn.set_client_key(client_key);
        conn.set_user_id(user_id);
        if !Connection::try_bind(conn, &user) {
            warn!(conn_id = conn.id(), user_id, "User session already bound or closing, closing tunnel");
            conn.close();
            return;
        }
        user.set_auto_read(true);
        debug!(conn_id = conn.id(), user_id, client_key, "Tunnel bound");
    }

    fn handle_disconnect(&self, conn: &Arc<Connection>, frame: &Frame) {
        match conn.kind() {
            ConnKind::Control => {
                let Some(client_key) = conn.client_key() else {
                    return;
                };
                if let Some(user) = self.registry.remove_user_session(&client_key, frame.uri()) {
                    if let Some(tunnel) = user.unbind() {
                        detach_tunnel(&tunnel);
                    }
                    debug!(user_id = frame.uri(), "Client could not reach backend, closing user");
                    user.close();
                }
            }
            ConnKind::Tunnel => {
                if conn.is_bound_to(frame.uri.as_deref()) {
                    self.release_tunnel(conn);
                } else {
                    debug!(conn_id = conn.id(), uri = frame.uri(), "Stale DISCONNECT ignored");
                }
            }
            _ => {
                warn!(conn_id = conn.id(), "DISCONNECT before AUTH or CONNECT, closing");
                conn.close();
            }
        }
    }

    fn handle_transfer(&self, conn: &Arc<Connection>, frame: Frame) {
        if conn.kind() != ConnKind::Tunnel || !conn.is_bound_to(frame.uri.as_deref()) {
            debug!(conn_id = conn.id(), uri = frame.uri(), "TRANSFER for no live session, dropped");
            return;
        }
        if let Some(user) = conn.peer() {
            let len = frame.payload.len();
            if user.send_bytes(frame.payload) {
                stats::user_written(user.local_port(), len);
            }
        }
    }

    /// Ends the session carried by a tunnel. The user is closed after its
    /// queued bytes are flushed; the tunnel itself stays open.
    fn release_tunnel(&self, tunnel: &Connection) {
        let Some(user) = tunnel.unbind() else {
            return;
        };
        tunnel.set_auto_read(true);
        let _ = user.unbind();
        if let (Some(client_key), Some(user_id)) = (user.client_key(), user.user_id()) {
            self.registry.remove_user_session(&client_key, &user_id);
        }
        user.close();
    }
}

/// Frees a tunnel for its next session. Reads may have been paused by the
/// departed user's backpressure and nothing else would resume them.
fn detach_tunnel(tunnel: &Connection) {
    let _ = tunnel.unbind();
    tunnel.set_auto_read(true);
}

impl FrameHandler for RelayShared {
    fn on_frame(&self, conn: &Arc<Connection>, frame: Frame) {
        match frame.frame_type {
            FrameType::Heartbeat => {
                conn.send_frame(Frame::heartbeat().with_serial_number(frame.serial_number));
            }
            FrameType::Auth => self.handle_auth(conn, &frame),
            FrameType::Connect => self.handle_tunnel_connect(conn, &frame),
            FrameType::Disconnect => self.handle_disconnect(conn, &frame),
            FrameType::Transfer => self.handle_transfer(conn, frame),
        }
    }

    fn on_closed(&self, conn: &Arc<Connection>) {
        match conn.kind() {
            ConnKind::Control => {
                if self.registry.unregister(conn) {
                    stats::control_closed();
                }
            }
            ConnKind::Tunnel => self.release_tunnel(conn),
            _ => {}
        }
        debug!(conn_id = conn.id(), kind = ?conn.kind(), "Client connection closed");
    }
}

impl StreamHandler for RelayShared {
    fn on_data(&self, user: &Arc<Connection>, data: Bytes) {
        let (Some(tunnel), Some(user_id)) = (user.peer(), user.user_id()) else {
            warn!(conn_id = user.id(), "Data on unbound user connection, closing");
            user.close();
            return;
        };
        stats::user_read(user.local_port(), data.len());
        tunnel.send_frame(Frame::transfer(user_id, data));
    }

    fn on_closed(&self, user: &Arc<Connection>) {
        stats::user_disconnected(user.local_port());
        let (Some(client_key), Some(user_id)) = (user.client_key(), user.user_id()) else {
            return;
        };
        self.registry.remove_user_session(&client_key, &user_id);
        if let Some(tunnel) = user.unbind() {
            detach_tunnel(&tunnel);
            tunnel.send_frame(Frame::disconnect(user_id.as_str()));
        }
        debug!(conn_id = user.id(), user_id = %user_id, "User connection closed");
    }
}
