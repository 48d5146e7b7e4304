//! Tunnel engine for `LanBridge`.
//!
//! The relay side ([`RelayServer`]) accepts control channels and tunnel
//! connections from clients plus public user connections on mapped ports.
//! The client side ([`TunnelClient`]) keeps one control channel alive,
//! dials backends on demand and carries their bytes over pooled tunnels.

pub mod auth;
pub mod connection;
pub mod pool;
pub mod pump;
pub mod reconnect;
pub mod registry;
pub mod transport;
pub mod tunnel;

pub use connection::{ConnKind, ConnState, Connection};
pub use pool::{TunnelDialer, TunnelPool};
pub use registry::ClientRegistry;
pub use tunnel::client::TunnelClient;
pub use tunnel::server::RelayServer;
