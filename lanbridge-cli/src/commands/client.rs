//! Client subcommand implementation

use anyhow::{bail, Context, Result};
use clap::Args;
use lanbridge_common::{ClientConfig, TlsConfig};
use lanbridge_core::TunnelClient;
use lanbridge_observability::{init_basic_observability, shutdown_tracing};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Relay address (host:port)
    #[arg(long, env = "LANBRIDGE_SERVER")]
    server: String,

    /// Client key. If omitted, uses LANBRIDGE_CLIENT_KEY env var, or prompts securely.
    #[arg(long, env = "LANBRIDGE_CLIENT_KEY")]
    key: Option<String>,

    /// Idle tunnels kept for reuse
    #[arg(long, default_value_t = lanbridge_common::DEFAULT_POOL_CAPACITY, env = "LANBRIDGE_POOL_CAPACITY")]
    pool_capacity: usize,

    /// Connect to the relay over TLS
    #[arg(long, env = "LANBRIDGE_TLS")]
    tls: bool,

    /// Path to CA certificate for TLS verification
    #[arg(long, env = "LANBRIDGE_TLS_CA")]
    tls_ca: Option<PathBuf>,

    /// Server name (SNI) for TLS verification
    #[arg(long, env = "LANBRIDGE_TLS_SERVER_NAME")]
    tls_server_name: Option<String>,

    /// Path to client certificate file (PEM format) for mutual TLS
    #[arg(long, env = "LANBRIDGE_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// Path to client private key file (PEM format) for mutual TLS
    #[arg(long, env = "LANBRIDGE_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Enable OpenTelemetry tracing
    #[arg(long, env = "LANBRIDGE_OBSERVABILITY")]
    observability: bool,
}

impl ClientArgs {
    fn client_config(&self, client_key: String) -> Result<ClientConfig> {
        let tls_requested = self.tls || self.tls_ca.is_some();
        if !tls_requested && (self.tls_cert.is_some() || self.tls_key.is_some()) {
            bail!("--tls-cert/--tls-key require --tls");
        }
        let tls = TlsConfig {
            enabled: tls_requested,
            ca_cert_path: self.tls_ca.clone(),
            cert_path: self.tls_cert.clone(),
            key_path: self.tls_key.clone(),
            server_name: self.tls_server_name.clone(),
            client_auth: false,
        };

        let config = ClientConfig {
            server_addr: self.server.clone(),
            client_key,
            tls,
            pool_capacity: self.pool_capacity,
            ..ClientConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

/// Resolve the client key from args/env, then a secure prompt.
fn resolve_key(args: &ClientArgs) -> Result<String> {
    if let Some(ref key) = args.key {
        return Ok(key.clone());
    }
    rpassword::prompt_password("Client key: ").context(
        "Could not read client key from terminal (is stdin a TTY?). Set LANBRIDGE_CLIENT_KEY or pass --key",
    )
}

pub async fn run(args: ClientArgs, shutdown: CancellationToken) -> Result<()> {
    init_basic_observability("lanbridge-client", args.observability, false);

    info!("Starting LanBridge client v{}", env!("CARGO_PKG_VERSION"));

    let key = resolve_key(&args)?;
    let config = args.client_config(key)?;
    info!(server = %config.server_addr, tls = config.tls.enabled, "Connecting to relay");

    let result = TunnelClient::new(config)
        .with_shutdown(shutdown)
        .run()
        .await
        .context("client failed");
    if args.observability {
        shutdown_tracing();
    }
    result
}
