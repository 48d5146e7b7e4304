//! Default ports, addresses and limits for LanBridge services.

use std::time::Duration;

/// Default port for the relay's plain control/tunnel listener.
pub const DEFAULT_RELAY_PORT: u16 = 4900;

/// Default port for the relay's TLS control/tunnel listener.
pub const DEFAULT_RELAY_TLS_PORT: u16 = 4993;

/// Default bind address for the plain listener (`0.0.0.0:4900`).
pub const DEFAULT_RELAY_BIND: &str = "0.0.0.0:4900";

/// Default bind address for the TLS listener (`0.0.0.0:4993`).
pub const DEFAULT_RELAY_TLS_BIND: &str = "0.0.0.0:4993";

/// Default bind address for the relay admin HTTP surface.
pub const DEFAULT_ADMIN_BIND: &str = "127.0.0.1:8090";

/// Default location of the relay mapping document.
pub const DEFAULT_MAPPING_FILE: &str = "lanbridge.json";

/// Idle tunnel connections kept by a client.
pub const DEFAULT_POOL_CAPACITY: usize = 100;

/// Silence on a framed connection after which it is considered dead.
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Relay emits a heartbeat after this much write silence.
pub const RELAY_WRITE_IDLE_TIMEOUT: Duration = Duration::from_secs(40);

/// Client emits a heartbeat after this much write silence.
pub const CLIENT_WRITE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Queued outbound bytes above which a connection stops being writable.
pub const WRITE_HIGH_WATERMARK: usize = 64 * 1024;

/// Queued outbound bytes below which a connection becomes writable again.
pub const WRITE_LOW_WATERMARK: usize = 32 * 1024;
