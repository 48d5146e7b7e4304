pub mod client;
pub mod server;
pub mod session;

pub use session::BackendSessions;

/// Metric hooks, compiled to no-ops without the `metrics` feature.
#[cfg(feature = "metrics")]
pub(crate) mod stats {
    use lanbridge_observability::relay_metrics;

    pub fn user_connected(port: Option<u16>) {
        if let Some(port) = port {
            relay_metrics().user_connected(port);
        }
    }

    pub fn user_disconnected(port: Option<u16>) {
        if let Some(port) = port {
            relay_metrics().user_disconnected(port);
        }
    }

    pub fn user_read(port: Option<u16>, bytes: usize) {
        if let Some(port) = port {
            relay_metrics().record_user_read(port, bytes);
        }
    }

    pub fn user_written(port: Option<u16>, bytes: usize) {
        if let Some(port) = port {
            relay_metrics().record_user_written(port, bytes);
        }
    }

    pub fn control_opened() {
        relay_metrics().control_channels.inc();
    }

    pub fn control_closed() {
        relay_metrics().control_channels.dec();
    }
}

#[cfg(not(feature = "metrics"))]
pub(crate) mod stats {
    pub fn user_connected(_port: Option<u16>) {}
    pub fn user_disconnected(_port: Option<u16>) {}
    pub fn user_read(_port: Option<u16>, _bytes: usize) {}
    pub fn user_written(_port: Option<u16>, _bytes: usize) {}
    pub fn control_opened() {}
    pub fn control_closed() {}
}
