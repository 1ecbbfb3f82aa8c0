//! Exercises gateway admission, the `/tun` handshake, and cleanup without
//! going through the full tunnel client — a bare WebSocket connection is
//! enough to probe the handshake and session-teardown behavior.

use std::sync::Arc;
use std::time::Duration;
use tunnel_server::{ServerConfig, ServerEvent, TunnelServer};

fn single_port_config() -> ServerConfig {
    ServerConfig {
        server_port: 0,
        auto_bind_server: true,
        max_tunnels: 1,
        port_range_min: Some(41000),
        port_range_max: 41000,
        max_channels_per_tunnel: 256,
    }
}

#[tokio::test]
async fn gateway_cap_locks_and_unlocks() {
    let server = Arc::new(TunnelServer::new(single_port_config()));
    let mut events = server.subscribe();
    let (addr, _accept_handle) = server.bind().await.unwrap();

    let created = server.create_gateway().await.unwrap();
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap(),
        ServerEvent::Locked
    );

    let exhausted = server.create_gateway().await;
    assert!(matches!(
        exhausted,
        Err(tunnel_core::TunnelError::TunnelsExhausted(1, 1))
    ));

    // Redeem the token and then drop the connection immediately — this
    // should tear the session down and free the slot.
    let url = format!("ws://127.0.0.1:{}/tun?token={}", addr.port(), created.token);
    let (ws, _response) = tokio_tungstenite::connect_async(&url).await.unwrap();
    drop(ws);

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap(),
        ServerEvent::Unlocked
    );

    // The port should now be available for a fresh gateway.
    let second = server.create_gateway().await.unwrap();
    assert_eq!(second.port, created.port);
}

#[tokio::test]
async fn unknown_token_gets_401() {
    let server = Arc::new(TunnelServer::new(single_port_config()));
    let (addr, _accept_handle) = server.bind().await.unwrap();

    let url = format!("ws://127.0.0.1:{}/tun?token=bogus", addr.port());
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn token_is_single_use() {
    let server = Arc::new(TunnelServer::new(single_port_config()));
    let (addr, _accept_handle) = server.bind().await.unwrap();
    let created = server.create_gateway().await.unwrap();

    let url = format!("ws://127.0.0.1:{}/tun?token={}", addr.port(), created.token);
    let (first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let second = tokio_tungstenite::connect_async(&url).await;
    assert!(second.is_err());
    drop(first);
}
