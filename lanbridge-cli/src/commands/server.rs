//! Server subcommand implementation

use crate::admin::{self, AdminState};
use anyhow::{bail, Context, Result};
use clap::Args;
use lanbridge_common::{
    MappingStore, RelayConfig, TlsConfig, DEFAULT_MAPPING_FILE, DEFAULT_RELAY_BIND,
    DEFAULT_RELAY_TLS_BIND,
};
use lanbridge_core::RelayServer;
use lanbridge_observability::{init_basic_observability, shutdown_tracing};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Args, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct ServerArgs {
    /// Address for client control channels and tunnels
    #[arg(long, default_value = DEFAULT_RELAY_BIND, env = "LANBRIDGE_BIND")]
    bind: SocketAddr,

    /// Address for TLS control channels and tunnels (requires --tls-cert/--tls-key)
    #[arg(long, env = "LANBRIDGE_TLS_BIND")]
    tls_bind: Option<SocketAddr>,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, env = "LANBRIDGE_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, env = "LANBRIDGE_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Path to CA certificate for client authentication (PEM format)
    #[arg(long, env = "LANBRIDGE_TLS_CA")]
    tls_ca: Option<PathBuf>,

    /// Require client certificate authentication
    #[arg(long, env = "LANBRIDGE_TLS_CLIENT_AUTH")]
    tls_client_auth: bool,

    /// Client/port mapping document (JSON)
    #[arg(long, default_value = DEFAULT_MAPPING_FILE, env = "LANBRIDGE_CONFIG")]
    config: PathBuf,

    /// Host the public user ports bind on
    #[arg(long, default_value = "0.0.0.0", env = "LANBRIDGE_USER_HOST")]
    user_host: String,

    /// Admin API bind address (disabled when omitted)
    #[arg(long, env = "LANBRIDGE_ADMIN_BIND")]
    admin_bind: Option<SocketAddr>,

    /// Bearer token required by the admin API
    #[arg(long, env = "LANBRIDGE_ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Enable OpenTelemetry tracing
    #[arg(long, env = "LANBRIDGE_OBSERVABILITY")]
    observability: bool,

    /// Enable Prometheus metrics
    #[arg(long, env = "LANBRIDGE_METRICS")]
    metrics: bool,
}

impl ServerArgs {
    fn relay_config(&self) -> Result<RelayConfig> {
        if self.tls_client_auth && self.tls_ca.is_none() {
            bail!("--tls-client-auth requires --tls-ca to be provided");
        }
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => TlsConfig {
                enabled: true,
                cert_path: Some(cert.clone()),
                key_path: Some(key.clone()),
                ca_cert_path: self.tls_ca.clone(),
                client_auth: self.tls_client_auth,
                server_name: None,
            },
            (None, None) => TlsConfig::default(),
            _ => bail!("--tls-cert and --tls-key must be given together"),
        };

        let tls_bind_addr = match (tls.enabled, self.tls_bind) {
            (true, Some(addr)) => Some(addr),
            (true, None) => Some(
                DEFAULT_RELAY_TLS_BIND
                    .parse()
                    .context("invalid default TLS bind address")?,
            ),
            (false, Some(_)) => bail!("--tls-bind requires --tls-cert and --tls-key"),
            (false, None) => None,
        };

        let config = RelayConfig {
            bind_addr: self.bind,
            tls_bind_addr,
            tls,
            user_bind_host: self.user_host.clone(),
            mapping_path: self.config.clone(),
            ..RelayConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

pub async fn run(args: ServerArgs, shutdown: CancellationToken) -> Result<()> {
    init_basic_observability("lanbridge-server", args.observability, args.metrics);

    info!("Starting LanBridge relay v{}", env!("CARGO_PKG_VERSION"));
    let config = args.relay_config()?;

    let mappings = Arc::new(
        MappingStore::load(&config.mapping_path).with_context(|| {
            format!("failed to load mapping file {}", config.mapping_path.display())
        })?,
    );
    let current = mappings.current();
    info!(
        path = %config.mapping_path.display(),
        clients = current.clients().len(),
        ports = current.user_ports().len(),
        "Mapping table loaded"
    );

    let server = RelayServer::new(config, mappings.clone()).with_shutdown(shutdown.clone());

    if let Some(addr) = args.admin_bind {
        let state = AdminState {
            mappings,
            registry: server.registry(),
            token: args.admin_token.clone(),
        };
        let admin_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(addr, state, admin_shutdown).await {
                error!("Admin API error: {:#}", e);
            }
        });
    }

    let result = server.run().await.context("relay failed");
    shutdown.cancel();
    if args.observability {
        shutdown_tracing();
    }
    result
}
