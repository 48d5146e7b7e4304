//! Typed per-connection state shared by the I/O tasks and the session binder.
//!
//! Every socket the relay or client touches is represented by one
//! [`Connection`]. Handlers never write to sockets directly: they enqueue
//! [`Outbound`] items that the connection's writer task drains in order.

use bytes::Bytes;
use kanal::{AsyncReceiver, AsyncSender};
use lanbridge_common::IdleConfig;
use lanbridge_protocol::constants::LENGTH_FIELD_SIZE;
use lanbridge_protocol::Frame;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// What a connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// Accepted on the relay's client port, role not yet known
    Inbound,
    /// Client ⇄ relay control channel
    Control,
    /// Client ⇄ relay connection carrying one session at a time
    Tunnel,
    /// Public connection accepted by the relay
    User,
    /// Client's connection to the real server
    Backend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    AuthPending,
    Authenticated,
    ConnectPending,
    Bound,
    Closing,
    Closed,
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Frame),
    Bytes(Bytes),
    /// Flush everything queued before this item, then close
    Close,
}

impl Outbound {
    pub(crate) fn wire_len(&self) -> usize {
        match self {
            Outbound::Frame(frame) => LENGTH_FIELD_SIZE + frame.encoded_len(),
            Outbound::Bytes(bytes) => bytes.len(),
            Outbound::Close => 0,
        }
    }
}

#[derive(Debug)]
struct Meta {
    kind: ConnKind,
    state: ConnState,
    peer: Weak<Connection>,
    client_key: Option<String>,
    user_id: Option<String>,
    local_port: Option<u16>,
}

pub struct Connection {
    id: u64,
    remote_addr: Option<SocketAddr>,
    meta: Mutex<Meta>,
    read_gate: watch::Sender<bool>,
    writable: AtomicBool,
    pending_bytes: AtomicUsize,
    high_watermark: usize,
    low_watermark: usize,
    outbound: AsyncSender<Outbound>,
    cancel: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.meta();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &meta.kind)
            .field("state", &meta.state)
            .field("user_id", &meta.user_id)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a connection whose lifetime is bounded by `parent`.
    ///
    /// The returned receiver must be handed to one of the pumps in
    /// [`crate::pump`]; until then nothing is written to the socket.
    pub(crate) fn new(
        kind: ConnKind,
        remote_addr: Option<SocketAddr>,
        idle: &IdleConfig,
        parent: &CancellationToken,
        auto_read: bool,
    ) -> (Arc<Self>, AsyncReceiver<Outbound>) {
        let (outbound, rx) = kanal::unbounded_async();
        let (read_gate, _) = watch::channel(auto_read);
        let conn = Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            meta: Mutex::new(Meta {
                kind,
                state: ConnState::Idle,
                peer: Weak::new(),
                client_key: None,
                user_id: None,
                local_port: None,
            }),
            read_gate,
            writable: AtomicBool::new(true),
            pending_bytes: AtomicUsize::new(0),
            high_watermark: idle.high_watermark,
            low_watermark: idle.low_watermark,
            outbound,
            cancel: parent.child_token(),
        });
        (conn, rx)
    }

    fn meta(&self) -> MutexGuard<'_, Meta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn kind(&self) -> ConnKind {
        self.meta().kind
    }

    pub fn set_kind(&self, kind: ConnKind) {
        self.meta().kind = kind;
    }

    pub fn state(&self) -> ConnState {
        self.meta().state
    }

    /// Moves to `state` unless the connection is already shutting down.
    pub fn set_state(&self, state: ConnState) {
        let mut meta = self.meta();
        if !matches!(meta.state, ConnState::Closing | ConnState::Closed) {
            meta.state = state;
        }
    }

    pub fn client_key(&self) -> Option<String> {
        self.meta().client_key.clone()
    }

    pub fn set_client_key(&self, client_key: impl Into<String>) {
        self.meta().client_key = Some(client_key.into());
    }

    pub fn user_id(&self) -> Option<String> {
        self.meta().user_id.clone()
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.meta().user_id = Some(user_id.into());
    }

    /// True when `uri` names the session currently bound here.
    ///
    /// Frames for a session that already ended on this connection are
    /// rejected. A frame without a uri is accepted.
    pub fn is_bound_to(&self, uri: Option<&str>) -> bool {
        let meta = self.meta();
        if meta.state != ConnState::Bound {
            return false;
        }
        match (uri, meta.user_id.as_deref()) {
            (None | Some(""), _) => true,
            (Some(uri), Some(user_id)) => uri == user_id,
            (Some(_), None) => false,
        }
    }

    pub fn local_port(&self) -> Option<u16> {
        self.meta().local_port
    }

    pub fn set_local_port(&self, port: u16) {
        self.meta().local_port = Some(port);
    }

    pub fn peer(&self) -> Option<Arc<Connection>> {
        self.meta().peer.upgrade()
    }

    /// Links two connections into one session. Fails if `b` is already
    /// bound or no longer waiting for a peer.
    pub fn try_bind(a: &Arc<Connection>, b: &Arc<Connection>) -> bool {
        {
            let mut meta = b.meta();
            if meta.peer.upgrade().is_some()
                || matches!(meta.state, ConnState::Closing | ConnState::Closed)
            {
                return false;
            }
            meta.peer = Arc::downgrade(a);
            meta.state = ConnState::Bound;
        }
        let mut meta = a.meta();
        meta.peer = Arc::downgrade(b);
        if !matches!(meta.state, ConnState::Closing | ConnState::Closed) {
            meta.state = ConnState::Bound;
        }
        true
    }

    /// Detaches this side of a session and returns the former peer.
    ///
    /// A tunnel also forgets its user id so late frames for the old session
    /// are recognised as stale; user and backend connections keep theirs.
    pub fn unbind(&self) -> Option<Arc<Connection>> {
        let mut meta = self.meta();
        let peer = std::mem::take(&mut meta.peer).upgrade();
        if meta.state == ConnState::Bound || meta.state == ConnState::ConnectPending {
            meta.state = ConnState::Idle;
        }
        if meta.kind == ConnKind::Tunnel {
            meta.user_id = None;
        }
        peer
    }

    pub fn send_frame(&self, frame: Frame) -> bool {
        self.enqueue(Outbound::Frame(frame))
    }

    pub fn send_bytes(&self, bytes: Bytes) -> bool {
        if bytes.is_empty() {
            return true;
        }
        self.enqueue(Outbound::Bytes(bytes))
    }

    fn enqueue(&self, item: Outbound) -> bool {
        if self.cancel.is_cancelled() || self.state() == ConnState::Closing {
            return false;
        }
        // counted before the writer can see the item, so a flush never
        // subtracts bytes that were not yet added
        let len = item.wire_len();
        self.on_enqueued(len);
        if !matches!(self.outbound.try_send(item), Ok(true)) {
            self.on_flushed(len);
            return false;
        }
        true
    }

    /// Closes after everything already queued has been written.
    pub fn close(&self) {
        {
            let mut meta = self.meta();
            if matches!(meta.state, ConnState::Closing | ConnState::Closed) {
                return;
            }
            meta.state = ConnState::Closing;
        }
        if !matches!(self.outbound.try_send(Outbound::Close), Ok(true)) {
            self.abort();
        }
    }

    /// Closes immediately, dropping queued data.
    pub fn abort(&self) {
        self.meta().state = ConnState::Closed;
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection has been closed or aborted.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_auto_read(&self, enabled: bool) {
        let changed = self.read_gate.send_if_modified(|open| {
            let changed = *open != enabled;
            *open = enabled;
            changed
        });
        if changed {
            trace!(conn_id = self.id, enabled, "read gate changed");
        }
    }

    pub fn is_auto_read(&self) -> bool {
        *self.read_gate.borrow()
    }

    pub(crate) fn read_gate(&self) -> watch::Receiver<bool> {
        self.read_gate.subscribe()
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    fn on_enqueued(&self, len: usize) {
        let pending = self
            .pending_bytes
            .fetch_add(len, Ordering::AcqRel)
            .saturating_add(len);
        if pending > self.high_watermark
            && self
                .writable
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.writability_changed(false);
        }
    }

    /// Called by the writer once `len` queued bytes reached the socket.
    pub(crate) fn on_flushed(&self, len: usize) {
        let previous = self
            .pending_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
                Some(p.saturating_sub(len))
            })
            .unwrap_or_else(|p| p);
        let pending = previous.saturating_sub(len);
        if pending <= self.low_watermark
            && self
                .writable
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.writability_changed(true);
        }
    }

    /// Writability of one side drives read-enablement of the other.
    fn writability_changed(&self, writable: bool) {
        trace!(conn_id = self.id, writable, "writability changed");
        if let Some(peer) = self.peer() {
            peer.set_auto_read(writable);
        }
    }
}
