//! wsmesh-server: a bare fleet node.
//!
//! Boots a message server from the per-process fleet environment
//! (`APP_*` variables), terminates TLS when `APP_SSLS` is present, links
//! to the peer groups named in `APP_LINKS`, and runs until SIGINT/SIGTERM.
//! Applications embed `wsmesh-server` as a library to register routes;
//! this binary runs an empty node.

use clap::Parser;
use tracing::{error, info};
use wsmesh_core::fleet::FleetEnv;
use wsmesh_server::{MessageServer, ServerConfig};

/// wsmesh-server: clustered WebSocket messaging node
#[derive(Parser, Debug)]
#[command(name = "wsmesh-server", version, about = "Clustered WebSocket messaging node")]
struct Cli {
    /// Listen port (overrides APP_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Codec password; omit for plaintext frames
    #[arg(long)]
    password: Option<String>,

    /// Cluster-signing secret; required for cluster traffic
    #[arg(long)]
    secret: Option<String>,

    /// Emit binary frames instead of Base64 text
    #[arg(long)]
    binary: bool,

    /// Supervisor period in milliseconds
    #[arg(long)]
    cycle: Option<u64>,

    /// Heartbeat timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Header consulted before the TCP peer for client addresses
    #[arg(long)]
    forwarded_header: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let fleet = match FleetEnv::from_env() {
        Ok(fleet) => fleet,
        Err(e) => {
            error!(error = %e, "failed to read fleet environment");
            std::process::exit(1);
        }
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        name = %fleet.name,
        env = %fleet.env,
        "starting wsmesh-server"
    );

    let mut config = ServerConfig::from_fleet(&fleet);
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.password = cli.password;
    config.secret = cli.secret;
    config.binary = cli.binary;
    if let Some(cycle) = cli.cycle {
        config.cycle_ms = cycle;
    }
    if let Some(timeout) = cli.timeout {
        config.timeout_ms = timeout;
    }
    config.forwarded_header = cli.forwarded_header;

    let server = match MessageServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.start().await {
        error!(error = %e, "failed to start");
        std::process::exit(1);
    }

    shutdown_signal().await;
    info!("received shutdown signal");
    server.close().await;
    info!("wsmesh-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
