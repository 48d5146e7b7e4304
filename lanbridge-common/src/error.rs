//! Error types for `LanBridge`

use lanbridge_protocol::CodecError;
use thiserror::Error;

/// Main error type for `LanBridge` operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed, oversized or unexpected frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unknown client key
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A control channel is already registered for this key
    #[error("Client key already connected: {0}")]
    DuplicateClientKey(String),

    /// Backend or relay tunnel port unreachable
    #[error("Dial failed: {0}")]
    Dial(String),

    /// Handshake named a user id or client key the registry does not know
    #[error("Registry inconsistency: {0}")]
    Registry(String),

    /// Unexpected close of an established connection
    #[error("Transport lost: {0}")]
    TransportLoss(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection error
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        TunnelError::Serialization(err.to_string())
    }
}

impl From<CodecError> for TunnelError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => TunnelError::Io(e),
            other => TunnelError::Protocol(other.to_string()),
        }
    }
}

impl TunnelError {
    /// Whether the client should retry after this error.
    ///
    /// Protocol violations are permanent for the connection that produced
    /// them; everything else is worth another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TunnelError::Protocol(_) | TunnelError::Config(_))
    }
}
