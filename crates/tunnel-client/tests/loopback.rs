//! End-to-end loopback scenario: a tunnel server and client wired together,
//! with a stand-in RPC target and a stand-in WebSocket target standing in
//! for the services an overlay peer actually wants to reach.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tunnel_client::{ClientConfig, TunnelClient};
use tunnel_server::{ServerConfig, TunnelServer};

const KIND_RPC: u8 = 0x01;
const KIND_DATACHANNEL: u8 = 0x02;

fn test_server_config(server_port: u16) -> ServerConfig {
    ServerConfig {
        server_port,
        auto_bind_server: true,
        max_tunnels: 3,
        port_range_min: None,
        port_range_max: 0,
        max_channels_per_tunnel: 256,
    }
}

/// A one-shot raw HTTP/1.1 responder standing in for the tunneled client's
/// `target_rpc_uri`. Reads one request, echoes the body back uppercased.
async fn spawn_rpc_target() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut total = Vec::new();
        let body = loop {
            let n = stream.read(&mut buf).await.unwrap();
            total.extend_from_slice(&buf[..n]);
            if let Some(header_end) = find_subslice(&total, b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&total[..header_end]);
                let content_length: usize = headers
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length").then(|| value.trim())
                    })
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                let body_start = header_end + 4;
                if total.len() >= body_start + content_length {
                    break total[body_start..body_start + content_length].to_vec();
                }
            }
        };
        let response_body = String::from_utf8_lossy(&body).to_uppercase();
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            response_body.len(),
            response_body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
    });
    addr
}

/// A one-shot raw HTTP/1.1 responder that always answers with a 500,
/// standing in for an RPC target the tunneled process can't reach.
async fn spawn_failing_rpc_target() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if find_subslice(&buf[..n], b"\r\n\r\n").is_some() || n == 0 {
                break;
            }
        }
        let body = "boom";
        let response = format!(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await.unwrap();
    });
    addr
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A WebSocket echo server standing in for the tunneled client's data
/// channel target.
async fn spawn_ws_echo_target() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut sink, mut stream) = futures_util::StreamExt::split(ws);
                while let Some(Ok(msg)) = futures_util::StreamExt::next(&mut stream).await {
                    if msg.is_close() {
                        break;
                    }
                    if futures_util::SinkExt::send(&mut sink, msg).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

async fn read_u32_len_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

#[tokio::test]
async fn rpc_round_trip_through_the_tunnel() {
    let rpc_target = spawn_rpc_target().await;
    let server = Arc::new(TunnelServer::new(test_server_config(0)));
    let (server_addr, _accept_handle) = server.bind().await.unwrap();
    let created = server.create_gateway().await.unwrap();

    let client_config = ClientConfig::new(
        format!(
            "ws://127.0.0.1:{}/tun?token={}",
            server_addr.port(),
            created.token
        ),
        format!("http://{rpc_target}"),
        "127.0.0.1",
        1,
    );
    let client = TunnelClient::new(client_config);
    client.open().await.unwrap();

    // give the server a moment to register the session before the overlay
    // peer connects to the gateway's port
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut overlay_peer = TcpStream::connect(("127.0.0.1", created.port)).await.unwrap();
    overlay_peer.write_all(&[KIND_RPC]).await.unwrap();
    let body = b"hello";
    let mut request = Vec::new();
    request.extend_from_slice(&(body.len() as u32).to_be_bytes());
    request.extend_from_slice(body);
    overlay_peer.write_all(&request).await.unwrap();

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        read_u32_len_frame(&mut overlay_peer),
    )
    .await
    .expect("rpc response timed out");

    assert_eq!(response, b"HELLO");

    client.close().await;
}

#[tokio::test]
async fn rpc_error_status_surfaces_as_error_event_without_forwarding() {
    let rpc_target = spawn_failing_rpc_target().await;
    let server = Arc::new(TunnelServer::new(test_server_config(0)));
    let (server_addr, _accept_handle) = server.bind().await.unwrap();
    let created = server.create_gateway().await.unwrap();

    let client_config = ClientConfig::new(
        format!(
            "ws://127.0.0.1:{}/tun?token={}",
            server_addr.port(),
            created.token
        ),
        format!("http://{rpc_target}"),
        "127.0.0.1",
        1,
    );
    let client = TunnelClient::new(client_config);
    let mut events = client.take_events().await.unwrap();
    client.open().await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), tunnel_client::ClientEvent::Open));

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut overlay_peer = TcpStream::connect(("127.0.0.1", created.port)).await.unwrap();
    overlay_peer.write_all(&[KIND_RPC]).await.unwrap();
    let body = b"hello";
    let mut request = Vec::new();
    request.extend_from_slice(&(body.len() as u32).to_be_bytes());
    request.extend_from_slice(body);
    overlay_peer.write_all(&request).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("expected an error event")
        .unwrap();
    assert!(matches!(event, tunnel_client::ClientEvent::Error(_)));

    // No rpc response frame should ever reach the overlay peer for the
    // failed request.
    let mut buf = [0u8; 4];
    let read = tokio::time::timeout(Duration::from_millis(200), overlay_peer.read(&mut buf)).await;
    assert!(read.is_err(), "no response should be forwarded on HTTP error");

    client.close().await;
}

#[tokio::test]
async fn datachannel_round_trip_through_the_tunnel() {
    let ws_target = spawn_ws_echo_target().await;
    let server = Arc::new(TunnelServer::new(test_server_config(0)));
    let (server_addr, _accept_handle) = server.bind().await.unwrap();
    let created = server.create_gateway().await.unwrap();

    let client_config = ClientConfig::new(
        format!(
            "ws://127.0.0.1:{}/tun?token={}",
            server_addr.port(),
            created.token
        ),
        "http://127.0.0.1:1",
        "127.0.0.1",
        ws_target.port(),
    );
    let client = TunnelClient::new(client_config);
    client.open().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut overlay_peer = TcpStream::connect(("127.0.0.1", created.port)).await.unwrap();
    overlay_peer.write_all(&[KIND_DATACHANNEL]).await.unwrap();
    overlay_peer.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), overlay_peer.read(&mut buf))
        .await
        .expect("datachannel echo timed out")
        .unwrap();

    assert_eq!(&buf[..n], b"ping");

    client.close().await;
}

#[tokio::test]
async fn unauthorized_token_is_rejected_with_401() {
    let server = Arc::new(TunnelServer::new(test_server_config(0)));
    let (server_addr, _accept_handle) = server.bind().await.unwrap();

    let url = format!("ws://127.0.0.1:{}/tun?token=not-a-real-token", server_addr.port());
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn tunnels_exhausted_once_at_cap() {
    let mut config = test_server_config(0);
    config.max_tunnels = 1;
    let server = Arc::new(TunnelServer::new(config));

    let _first = server.create_gateway().await.unwrap();
    let second = server.create_gateway().await;
    assert!(matches!(
        second,
        Err(tunnel_core::TunnelError::TunnelsExhausted(1, 1))
    ));
}
