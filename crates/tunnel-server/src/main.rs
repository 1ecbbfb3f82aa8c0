//! tunnel-server: admits tunneled clients and relays overlay traffic.
//!
//! Accepts a WebSocket upgrade at `/tun?token=...`, verifies the single-use
//! admission token against the gateway it was issued for, then relays
//! frames between that socket and the gateway's listening port.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tunnel_server::{ServerConfig, TunnelServer};

/// tunnel-server — NAT-traversal tunnel admission point
#[derive(Parser, Debug)]
#[command(name = "tunnel-server", version, about = "Tunnel server")]
struct Cli {
    /// Listen port for tunneled client WebSocket connections
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "tunnel-server.toml")]
    config: String,

    /// Maximum concurrent gateways
    #[arg(long)]
    max_tunnels: Option<usize>,

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

    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), cli.port, cli.max_tunnels) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = server_config.server_port,
        max_tunnels = server_config.max_tunnels,
        "starting tunnel-server"
    );

    let server = Arc::new(TunnelServer::new(server_config));

    tokio::select! {
        result = server.clone().run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("tunnel-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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
