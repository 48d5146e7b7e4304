use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::sync::OnceLock;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the log line format (`text` or `json`).
pub const LOG_FORMAT_ENV: &str = "LANBRIDGE_LOG_FORMAT";

const DEFAULT_FILTER: &str = "info";

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// Reads [`LOG_FORMAT_ENV`]; anything but `json` means text.
    pub fn from_env() -> Self {
        match std::env::var(LOG_FORMAT_ENV) {
            Ok(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }

    pub(crate) fn layer<S>(self) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
    {
        match self {
            Self::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .boxed(),
            Self::Text => tracing_subscriber::fmt::layer().with_target(false).boxed(),
        }
    }
}

/// `RUST_LOG` if set, `info` otherwise.
pub(crate) fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

pub struct TracingConfig {
    pub service_name: String,
    /// OTLP gRPC endpoint; spans are only exported when set
    pub otlp_endpoint: Option<String>,
    pub format: LogFormat,
}

impl TracingConfig {
    /// Endpoint from `OTEL_EXPORTER_OTLP_ENDPOINT`, format from
    /// [`LOG_FORMAT_ENV`].
    pub fn from_env(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            format: LogFormat::from_env(),
        }
    }
}

fn tracer_provider(service_name: String, endpoint: String) -> anyhow::Result<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_resource(Resource::builder().with_service_name(service_name).build())
        .with_batch_exporter(exporter)
        .build())
}

/// Installs the global subscriber: env filter, formatted log lines and,
/// with an endpoint, an OpenTelemetry layer.
pub fn init_tracing(config: TracingConfig) -> anyhow::Result<()> {
    let otel_layer = match config.otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let provider = tracer_provider(config.service_name, endpoint)?;
            let tracer = provider.tracer("lanbridge");
            let _ = TRACER_PROVIDER.set(provider.clone());
            global::set_tracer_provider(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    Registry::default()
        .with(env_filter())
        .with(config.format.layer())
        .with(otel_layer)
        .try_init()?;

    tracing::info!(
        otlp = TRACER_PROVIDER.get().is_some(),
        "Tracing initialized"
    );
    Ok(())
}

/// Flushes pending spans. A no-op when OTLP export was never enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::error!("Failed to shut down tracer provider: {}", e);
        }
    }
}
