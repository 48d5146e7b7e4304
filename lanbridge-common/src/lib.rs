//! Common utilities and types for `LanBridge`

pub mod config;
pub mod constants;
pub mod error;
pub mod mapping;

pub use config::{ClientConfig, IdleConfig, RelayConfig, ResilienceConfig, TlsConfig};
pub use constants::{
    DEFAULT_ADMIN_BIND, DEFAULT_MAPPING_FILE, DEFAULT_POOL_CAPACITY, DEFAULT_RELAY_BIND,
    DEFAULT_RELAY_PORT, DEFAULT_RELAY_TLS_BIND, DEFAULT_RELAY_TLS_PORT,
};
pub use error::{Result, TunnelError};
pub use mapping::{ClientMapping, MappingStore, MappingTable, ProxyMapping};
