//! Protocol frame definitions

use crate::constants::{HEADER_SIZE, URI_SEPARATOR};
use bytes::Bytes;
use std::fmt;

/// Message type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Keepalive, answered by the relay
    Heartbeat = 0x01,
    /// Client authentication on the control channel (uri = client key)
    Auth = 0x02,
    /// Session setup. Relay→client: uri = user id, payload = lan target.
    /// Client→relay on a tunnel: uri = `userId@clientKey`.
    Connect = 0x03,
    /// Session teardown (uri = user id)
    Disconnect = 0x04,
    /// Proxied payload (uri = user id)
    Transfer = 0x05,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Heartbeat),
            0x02 => Ok(Self::Auth),
            0x03 => Ok(Self::Connect),
            0x04 => Ok(Self::Disconnect),
            0x05 => Ok(Self::Transfer),
            other => Err(other),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Heartbeat => "HEARTBEAT",
            Self::Auth => "AUTH",
            Self::Connect => "CONNECT",
            Self::Disconnect => "DISCONNECT",
            Self::Transfer => "TRANSFER",
        };
        f.write_str(name)
    }
}

/// Wire protocol frame
///
/// `serial_number` is carried verbatim and never interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub serial_number: u64,
    /// Decodes as `None` when empty
    pub uri: Option<String>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            serial_number: 0,
            uri: None,
            payload: Bytes::new(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat)
    }

    pub fn auth(client_key: impl Into<String>) -> Self {
        Self::new(FrameType::Auth).with_uri(client_key)
    }

    /// CONNECT sent by the relay on a control channel.
    pub fn connect_request(user_id: impl Into<String>, lan_target: &str) -> Self {
        Self::new(FrameType::Connect)
            .with_uri(user_id)
            .with_payload(Bytes::copy_from_slice(lan_target.as_bytes()))
    }

    /// CONNECT sent by the client on a freshly bound tunnel.
    pub fn connect_tunnel(user_id: &str, client_key: &str) -> Self {
        Self::new(FrameType::Connect).with_uri(format!("{user_id}{URI_SEPARATOR}{client_key}"))
    }

    pub fn disconnect(user_id: impl Into<String>) -> Self {
        Self::new(FrameType::Disconnect).with_uri(user_id)
    }

    pub fn transfer(user_id: impl Into<String>, payload: Bytes) -> Self {
        Self::new(FrameType::Transfer)
            .with_uri(user_id)
            .with_payload(payload)
    }

    /// An empty uri is stored as `None`; the wire has no way to tell them apart.
    #[must_use]
    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        let uri = uri.into();
        self.uri = (!uri.is_empty()).then_some(uri);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_serial_number(mut self, serial_number: u64) -> Self {
        self.serial_number = serial_number;
        self
    }

    pub fn uri(&self) -> &str {
        self.uri.as_deref().unwrap_or("")
    }

    /// Value of the length prefix for this frame.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.uri.as_ref().map_or(0, String::len) + self.payload.len()
    }

    /// Splits a tunnel CONNECT uri into `(user_id, client_key)`.
    ///
    /// Returns `None` unless the uri has exactly two non-empty parts.
    pub fn split_tunnel_uri(&self) -> Option<(&str, &str)> {
        let mut parts = self.uri().split(URI_SEPARATOR);
        let user_id = parts.next().filter(|s| !s.is_empty())?;
        let client_key = parts.next().filter(|s| !s.is_empty())?;
        if parts.next().is_some() {
            return None;
        }
        Some((user_id, client_key))
    }
}
