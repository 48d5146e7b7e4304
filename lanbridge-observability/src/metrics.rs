//! Prometheus metrics for the relay and client.
//!
//! All collectors live in a dedicated [`REGISTRY`] so the admin surface can
//! render and reset exactly what LanBridge owns.

use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> =
    LazyLock::new(|| Registry::new_custom(Some("lanbridge".to_string()), None).unwrap());

static ENABLED: AtomicBool = AtomicBool::new(false);

static RELAY_METRICS: LazyLock<RelayMetrics> = LazyLock::new(RelayMetrics::register);

pub struct RelayMetrics {
    /// Bytes read from public user connections, by relay port
    pub user_bytes_read: IntCounterVec,
    /// Bytes written to public user connections, by relay port
    pub user_bytes_written: IntCounterVec,
    /// Open user connections, by relay port
    pub user_connections: IntGaugeVec,
    /// Authenticated control channels
    pub control_channels: IntGauge,
    /// Idle tunnel connections held by the client pool
    pub tunnel_pool_idle: IntGauge,
}

impl RelayMetrics {
    fn register() -> Self {
        let user_bytes_read = IntCounterVec::new(
            Opts::new("user_bytes_read_total", "Bytes read from user connections"),
            &["port"],
        )
        .unwrap();
        let user_bytes_written = IntCounterVec::new(
            Opts::new("user_bytes_written_total", "Bytes written to user connections"),
            &["port"],
        )
        .unwrap();
        let user_connections = IntGaugeVec::new(
            Opts::new("user_connections", "Open user connections"),
            &["port"],
        )
        .unwrap();
        let control_channels =
            IntGauge::new("control_channels", "Authenticated control channels").unwrap();
        let tunnel_pool_idle =
            IntGauge::new("tunnel_pool_idle", "Idle pooled tunnel connections").unwrap();

        REGISTRY.register(Box::new(user_bytes_read.clone())).unwrap();
        REGISTRY
            .register(Box::new(user_bytes_written.clone()))
            .unwrap();
        REGISTRY.register(Box::new(user_connections.clone())).unwrap();
        REGISTRY.register(Box::new(control_channels.clone())).unwrap();
        REGISTRY.register(Box::new(tunnel_pool_idle.clone())).unwrap();

        Self {
            user_bytes_read,
            user_bytes_written,
            user_connections,
            control_channels,
            tunnel_pool_idle,
        }
    }

    pub fn record_user_read(&self, port: u16, bytes: usize) {
        self.user_bytes_read
            .with_label_values(&[port.to_string().as_str()])
            .inc_by(bytes as u64);
    }

    pub fn record_user_written(&self, port: u16, bytes: usize) {
        self.user_bytes_written
            .with_label_values(&[port.to_string().as_str()])
            .inc_by(bytes as u64);
    }

    pub fn user_connected(&self, port: u16) {
        self.user_connections
            .with_label_values(&[port.to_string().as_str()])
            .inc();
    }

    pub fn user_disconnected(&self, port: u16) {
        self.user_connections
            .with_label_values(&[port.to_string().as_str()])
            .dec();
    }
}

pub fn relay_metrics() -> &'static RelayMetrics {
    &RELAY_METRICS
}

/// Registers the collectors and marks metrics as enabled.
pub fn init_metrics() {
    if ENABLED.swap(true, Ordering::SeqCst) {
        return;
    }
    LazyLock::force(&RELAY_METRICS);

    #[cfg(target_os = "linux")]
    {
        let collector = prometheus::process_collector::ProcessCollector::for_self();
        let _ = REGISTRY.register(Box::new(collector));
    }
}

pub fn metrics_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Renders every registered metric in the Prometheus text format.
pub fn gather_metrics() -> String {
    let families = REGISTRY.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .unwrap_or_else(|e| format!("# failed to encode metrics: {e}\n"))
}

/// Zeroes the traffic counters. Gauges describe live state and are kept.
pub fn reset_metrics() {
    let metrics = relay_metrics();
    metrics.user_bytes_read.reset();
    metrics.user_bytes_written.reset();
}
