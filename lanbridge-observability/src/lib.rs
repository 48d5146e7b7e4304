//! Logging, tracing export and Prometheus metrics for `LanBridge`.

pub mod metrics;
pub mod tracing;

pub use metrics::{
    gather_metrics, init_metrics, metrics_enabled, relay_metrics, reset_metrics, RelayMetrics,
    REGISTRY,
};
pub use self::tracing::{init_tracing, shutdown_tracing, LogFormat, TracingConfig, LOG_FORMAT_ENV};

/// Sets up logging for one of the binaries.
///
/// With `enable_tracing` the OTLP pipeline from `OTEL_EXPORTER_OTLP_ENDPOINT`
/// is wired in; otherwise only log lines are emitted. Metrics are registered
/// when `enable_metrics` is set.
pub fn init_basic_observability(service_name: &str, enable_tracing: bool, enable_metrics: bool) {
    if enable_metrics {
        init_metrics();
    }

    if enable_tracing {
        if let Err(e) = init_tracing(TracingConfig::from_env(service_name)) {
            init_minimal_logging();
            ::tracing::warn!("OTLP tracing unavailable, logging only: {}", e);
        }
    } else {
        init_minimal_logging();
    }
}

/// Log lines only, in the format chosen by `LANBRIDGE_LOG_FORMAT`.
pub fn init_minimal_logging() {
    use tracing_subscriber::prelude::*;

    let _ = tracing_subscriber::registry()
        .with(crate::tracing::env_filter())
        .with(LogFormat::from_env().layer())
        .try_init();
}
