//! tunnel-client: connects outbound to a tunnel server and bridges traffic
//! to a local RPC endpoint and loopback data-channel target.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tunnel_client::{ClientConfig, ClientEvent, TunnelClient};

/// tunnel-client — NAT-traversal tunnel client
#[derive(Parser, Debug)]
#[command(name = "tunnel-client", version, about = "Tunnel client")]
struct Cli {
    /// `ws://host:port/tun?token=...`
    #[arg(long)]
    tunnel_uri: String,

    /// HTTP endpoint receiving forwarded RPC envelopes
    #[arg(long)]
    target_rpc_uri: String,

    /// Host that loopback data-channel sockets connect to
    #[arg(long, default_value = "127.0.0.1")]
    target_host: String,

    /// Port that loopback data-channel sockets connect to
    #[arg(long)]
    target_port: u16,

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

    let config = ClientConfig::new(
        cli.tunnel_uri,
        cli.target_rpc_uri,
        cli.target_host,
        cli.target_port,
    );

    let client = TunnelClient::new(config);
    let mut events = client
        .take_events()
        .await
        .expect("events receiver is available immediately after construction");

    if let Err(e) = client.open().await {
        error!(error = %e, "failed to open tunnel");
        std::process::exit(1);
    }

    let client_for_signal = client.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        client_for_signal.close().await;
    });

    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Open => info!("tunnel open"),
            ClientEvent::Close => {
                info!("tunnel closed");
                break;
            }
            ClientEvent::Error(e) => warn!(error = %e, "tunnel error"),
        }
    }
}

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
