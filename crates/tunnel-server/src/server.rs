//! Core server: admits tunneled clients, owns the gateway registry, and
//! routes frames between overlay peers (via their gateway) and the
//! tunneled client's socket.
//!
//! Shared mutable server state — the `gateways` map, the authorized token
//! set, and the leased port set — is owned exclusively here, behind locks,
//! per the single-owner-registry design note. No other component reads or
//! writes them.

use crate::allocator::{PortAllocator, TokenAllocator};
use crate::config::ServerConfig;
use crate::gateway::{Gateway, GatewayEvent};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use tunnel_core::{close_codes, Demuxer, Frame, Muxer, TunnelError, TunnelResult};

/// Events surfaced to embedders of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Ready,
    Locked,
    Unlocked,
}

/// Result of a successful `create_gateway()` call.
#[derive(Debug, Clone)]
pub struct CreatedGateway {
    pub token: String,
    pub port: u16,
}

struct GatewayRecord {
    gateway: Arc<Gateway>,
    port: u16,
    leased: bool,
}

pub struct TunnelServer {
    config: ServerConfig,
    tokens: TokenAllocator,
    ports: PortAllocator,
    gateways: RwLock<HashMap<String, GatewayRecord>>,
    next_gateway_id: AtomicU32,
    events: broadcast::Sender<ServerEvent>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Self {
        let (min, max) = (
            config.port_range_min.unwrap_or(0),
            config.port_range_max,
        );
        Self {
            ports: PortAllocator::new(min, max),
            tokens: TokenAllocator::new(),
            gateways: RwLock::new(HashMap::new()),
            next_gateway_id: AtomicU32::new(1),
            events: broadcast::channel(16).0,
            config,
        }
    }

    /// Subscribe to `ready`/`locked`/`unlocked` server events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Out-of-band admission operation: leases a port, opens a gateway, and
    /// mints its admission token. Invoked by the overlay's own RPC surface,
    /// never directly over the tunnel socket.
    pub async fn create_gateway(&self) -> TunnelResult<CreatedGateway> {
        let mut gateways = self.gateways.write().await;
        if gateways.len() >= self.config.max_tunnels {
            return Err(TunnelError::TunnelsExhausted(
                gateways.len(),
                self.config.max_tunnels,
            ));
        }

        let leased = self.config.port_range_min.is_some();
        let requested_port = if leased { self.ports.lease().await? } else { 0 };

        let id = self.next_gateway_id.fetch_add(1, Ordering::SeqCst);
        let gateway = Gateway::new(id, self.config.max_channels_per_tunnel);
        let actual_port = match gateway.open("0.0.0.0", requested_port).await {
            Ok(p) => p,
            Err(e) => {
                if leased {
                    self.ports.release(requested_port).await;
                }
                return Err(e);
            }
        };

        let token = self.tokens.issue();
        gateways.insert(
            token.clone(),
            GatewayRecord {
                gateway,
                port: actual_port,
                leased,
            },
        );

        if gateways.len() >= self.config.max_tunnels {
            let _ = self.events.send(ServerEvent::Locked);
        }

        info!(token = %token, port = actual_port, "gateway created");
        Ok(CreatedGateway {
            token,
            port: actual_port,
        })
    }

    /// Bind the server's own listener and serve upgrade requests at `/tun`
    /// until the process is told to stop.
    pub async fn run(self: Arc<Self>) -> TunnelResult<()> {
        let (_, handle) = self.bind().await?;
        handle
            .await
            .map_err(|e| TunnelError::Transport(format!("accept loop panicked: {e}")))?
    }

    /// Bind the listener and spawn the accept loop in the background,
    /// returning the bound address immediately. Lets callers (tests, or an
    /// embedder binding on an ephemeral port) learn the actual address
    /// without waiting for the server to stop.
    pub async fn bind(
        self: &Arc<Self>,
    ) -> TunnelResult<(SocketAddr, tokio::task::JoinHandle<TunnelResult<()>>)> {
        let addr = format!("0.0.0.0:{}", self.config.server_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TunnelError::Transport(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TunnelError::Transport(e.to_string()))?;
        info!(addr = %local_addr, "tunnel server listening");
        let _ = self.events.send(ServerEvent::Ready);

        let server = self.clone();
        let handle = tokio::spawn(async move { server.accept_loop(listener).await });
        Ok((local_addr, handle))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> TunnelResult<()> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| TunnelError::Transport(e.to_string()))?;
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, peer).await;
            });
        }
    }

    /// Accept a single inbound connection: perform the `/tun` upgrade
    /// handshake (verifying and consuming the admission token), then wire
    /// the session if the referenced gateway still exists.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let token_slot: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));
        let token_slot_cb = token_slot.clone();
        let tokens = &self.tokens;

        let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() != "/tun" {
                return Err(error_response(StatusCode::NOT_FOUND, "not found"));
            }
            let token = request.uri().query().and_then(extract_token);
            match token {
                Some(t) if tokens.consume(&t) => {
                    *token_slot_cb.lock().unwrap() = Some(t);
                    Ok(response)
                }
                _ => Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized")),
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(peer = %peer, error = %e, "upgrade rejected");
                return;
            }
        };

        let token = token_slot
            .lock()
            .unwrap()
            .clone()
            .expect("token set by the callback on the success path");

        let record = {
            let gateways = self.gateways.read().await;
            gateways.get(&token).map(|r| r.gateway.clone())
        };

        let Some(gateway) = record else {
            close_with_code(ws_stream, close_codes::GATEWAY_CLOSED, "gateway closed").await;
            return;
        };

        self.run_session(ws_stream, gateway, token).await;
    }

    /// Drive one tunnel session to completion: decode inbound frames and
    /// dispatch them to the gateway, encode the gateway's outgoing frames
    /// and write them to the socket, until either side closes.
    async fn run_session(
        &self,
        mut ws_stream: WebSocketStream<TcpStream>,
        gateway: Arc<Gateway>,
        token: String,
    ) {
        let mut demuxer = Demuxer::new();
        let mut events = match gateway.take_events().await {
            Some(rx) => rx,
            None => {
                warn!("gateway events already taken by another session");
                return;
            }
        };

        let mut close_reason: Option<(u16, String)> = None;

        loop {
            tokio::select! {
                msg = ws_stream.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            match demuxer.feed(&data) {
                                Ok(frames) => {
                                    for frame in frames {
                                        self.dispatch_inbound_frame(&gateway, frame).await;
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "demuxer rejected frame");
                                    close_reason = Some((close_codes::INVALID_FRAME_TYPE, e.to_string()));
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "tunnel socket error");
                            break;
                        }
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(GatewayEvent::Frame(frame)) => {
                            match Muxer::encode(&frame) {
                                Ok(bytes) => {
                                    if ws_stream.send(Message::Binary(bytes)).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => warn!(error = %e, "failed to encode outgoing frame"),
                            }
                        }
                        Some(GatewayEvent::Error(e)) => warn!(error = %e, "gateway error"),
                        None => break,
                    }
                }
            }
        }

        if let Some((code, reason)) = close_reason {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            };
            let _ = ws_stream.close(Some(frame)).await;
        }

        self.cleanup(&token).await;
    }

    async fn dispatch_inbound_frame(&self, gateway: &Arc<Gateway>, frame: Frame) {
        match frame {
            Frame::Rpc { payload } => {
                if let Err(e) = gateway.respond(payload).await {
                    warn!(error = %e, "gateway respond failed");
                }
            }
            Frame::DataChannel { quid, payload, .. } => {
                if let Err(e) = gateway.transfer(&quid, payload).await {
                    warn!(error = %e, "gateway transfer failed");
                }
            }
        }
    }

    /// Close the gateway, release its port, and drop it from the registry.
    /// Emits `unlocked` if this frees a slot below the cap.
    async fn cleanup(&self, token: &str) {
        let mut gateways = self.gateways.write().await;
        if let Some(record) = gateways.remove(token) {
            let was_full = gateways.len() + 1 >= self.config.max_tunnels;
            drop(gateways);

            record.gateway.close().await;
            if record.leased {
                self.ports.release(record.port).await;
            }
            self.tokens.revoke(token);

            if was_full {
                let _ = self.events.send(ServerEvent::Unlocked);
            }
            info!(token = %token, "tunnel session cleaned up");
        }
    }
}

async fn close_with_code(mut ws: WebSocketStream<TcpStream>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    let _ = ws.close(Some(frame)).await;
}

fn error_response(status: StatusCode, message: &str) -> ErrorResponse {
    Response::builder()
        .status(status)
        .body(Some(message.to_string()))
        .unwrap()
}

/// Extract the `token` parameter from a URL query string.
fn extract_token(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token").then(|| value.to_string())
    })
}
