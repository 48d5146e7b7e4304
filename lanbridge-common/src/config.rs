//! Configuration types for the LanBridge relay and client

use crate::constants::{
    CLIENT_WRITE_IDLE_TIMEOUT, DEFAULT_MAPPING_FILE, DEFAULT_POOL_CAPACITY, DEFAULT_RELAY_PORT,
    READ_IDLE_TIMEOUT, RELAY_WRITE_IDLE_TIMEOUT, WRITE_HIGH_WATERMARK, WRITE_LOW_WATERMARK,
};
use crate::error::{Result, TunnelError};
use lanbridge_protocol::constants::{CLIENT_MAX_FRAME_SIZE, RELAY_MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    /// Enable TLS
    pub enabled: bool,
    /// Path to CA certificate (client trust anchor, or relay client-auth root)
    pub ca_cert_path: Option<PathBuf>,
    /// Path to certificate file
    pub cert_path: Option<PathBuf>,
    /// Path to private key file
    pub key_path: Option<PathBuf>,
    /// Server name for SNI (client-side)
    pub server_name: Option<String>,
    /// Require client certificate authentication
    pub client_auth: bool,
}

impl TlsConfig {
    pub fn validate_server(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.cert_path.is_none() || self.key_path.is_none() {
            return Err(TunnelError::Config(
                "TLS requires both a certificate and a private key".into(),
            ));
        }
        if self.client_auth && self.ca_cert_path.is_none() {
            return Err(TunnelError::Config(
                "client authentication requires a CA certificate".into(),
            ));
        }
        Ok(())
    }

    pub fn validate_client(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.ca_cert_path.is_none() {
            return Err(TunnelError::Config(
                "TLS client requires a CA certificate to verify the relay".into(),
            ));
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(TunnelError::Config(
                "client certificate and key must be given together".into(),
            ));
        }
        Ok(())
    }
}

/// Read/write idle thresholds for framed connections, plus the
/// write-buffer watermarks that drive backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleConfig {
    /// Close the connection after this much read silence
    pub read_idle: Duration,
    /// Emit a heartbeat after this much write silence
    pub write_idle: Duration,
    pub high_watermark: usize,
    pub low_watermark: usize,
}

impl IdleConfig {
    pub fn relay() -> Self {
        Self {
            read_idle: READ_IDLE_TIMEOUT,
            write_idle: RELAY_WRITE_IDLE_TIMEOUT,
            high_watermark: WRITE_HIGH_WATERMARK,
            low_watermark: WRITE_LOW_WATERMARK,
        }
    }

    pub fn client() -> Self {
        Self {
            write_idle: CLIENT_WRITE_IDLE_TIMEOUT,
            ..Self::relay()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_idle >= self.read_idle {
            return Err(TunnelError::Config(
                "write idle must be shorter than read idle".into(),
            ));
        }
        if self.low_watermark > self.high_watermark {
            return Err(TunnelError::Config(
                "low watermark must not exceed high watermark".into(),
            ));
        }
        Ok(())
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self::relay()
    }
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Starting delay, also the value restored after a successful connect
    pub reconnect_base: Duration,
    /// Once the delay grows past this it starts over from the base
    pub reconnect_max: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
        }
    }
}

/// Configuration for the relay daemon.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Plain listener for control channels and tunnel connections
    pub bind_addr: SocketAddr,
    /// Optional TLS listener serving the same protocol
    pub tls_bind_addr: Option<SocketAddr>,
    pub tls: TlsConfig,
    /// Host the public user ports bind on
    pub user_bind_host: String,
    pub max_frame_size: usize,
    pub idle: IdleConfig,
    /// Mapping document location
    pub mapping_path: PathBuf,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            return Err(TunnelError::Config("max_frame_size must be positive".into()));
        }
        if self.tls_bind_addr.is_some() && !self.tls.enabled {
            return Err(TunnelError::Config(
                "tls_bind_addr set but TLS is not enabled".into(),
            ));
        }
        if self.tls.enabled && self.tls_bind_addr.is_none() {
            return Err(TunnelError::Config(
                "TLS enabled but no tls_bind_addr given".into(),
            ));
        }
        self.tls.validate_server()?;
        self.idle.validate()
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], DEFAULT_RELAY_PORT).into(),
            tls_bind_addr: None,
            tls: TlsConfig::default(),
            user_bind_host: "0.0.0.0".to_string(),
            max_frame_size: RELAY_MAX_FRAME_SIZE,
            idle: IdleConfig::relay(),
            mapping_path: PathBuf::from(DEFAULT_MAPPING_FILE),
        }
    }
}

/// Configuration for the client daemon.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay address (host:port)
    pub server_addr: String,
    /// Shared secret identifying this client to the relay
    pub client_key: String,
    pub tls: TlsConfig,
    pub max_frame_size: usize,
    /// Idle tunnel connections retained for reuse
    pub pool_capacity: usize,
    pub idle: IdleConfig,
    pub resilience: ResilienceConfig,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(TunnelError::Config("server_addr is required".into()));
        }
        if self.client_key.is_empty() {
            return Err(TunnelError::Config("client_key is required".into()));
        }
        if self.max_frame_size == 0 {
            return Err(TunnelError::Config("max_frame_size must be positive".into()));
        }
        if self.resilience.reconnect_base.is_zero() {
            return Err(TunnelError::Config("reconnect_base must be positive".into()));
        }
        self.tls.validate_client()?;
        self.idle.validate()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{DEFAULT_RELAY_PORT}"),
            client_key: String::new(),
            tls: TlsConfig::default(),
            max_frame_size: CLIENT_MAX_FRAME_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            idle: IdleConfig::client(),
            resilience: ResilienceConfig::default(),
        }
    }
}
