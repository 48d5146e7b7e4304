//! LanBridge Unified CLI
//!
//! Runs either side of the tunnel: the public relay or the LAN client.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod admin;
mod commands;
mod middleware;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "lanbridge",
    author,
    version,
    about = "Expose services inside a private network through a public relay",
    long_about = "LanBridge forwards TCP connections arriving on public relay ports to \
                  services inside a private network, through a client that dials out \
                  to the relay.",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public relay
    Server(commands::server::ServerArgs),

    /// Run the LAN-side client
    Client(commands::client::ClientArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // rustls needs a process-wide provider before any config is built
    let _ = rustls::crypto::ring::default_provider().install_default();

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            on_signal.cancel();
        }
    });

    match cli.command {
        Commands::Server(args) => commands::server::run(args, shutdown).await,
        Commands::Client(args) => commands::client::run(args, shutdown).await,
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
    }
}
