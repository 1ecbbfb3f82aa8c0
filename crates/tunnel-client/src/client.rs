//! Outbound tunnel client.
//!
//! Connects to a tunnel server, then bridges decoded frames to two local
//! surfaces: `rpc` frames become HTTP POSTs to `target_rpc_uri`, and
//! `datachannel` frames become per-`quid` loopback WebSocket connections.
//! Inbound `rpc` frames are handed to a single sequential worker rather than
//! one task per frame, so responses reach the tunnel in the same order the
//! gateway's FIFO request queue expects them.
//!
//! Grounded on `wsh-client/src/transport/websocket.rs`'s dispatch-loop shape
//! (split sink/stream, `mpsc` fan-out per logical stream), generalized from
//! its integer `stream_id` virtual channels to the tunnel's `quid`-keyed
//! loopback socket map.

use crate::config::ClientConfig;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tunnel_core::{close_codes, terminal_payload, Demuxer, Frame, Muxer, TunnelError, TunnelResult};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Closed,
    Open,
}

/// Events surfaced to embedders of the client.
#[derive(Debug)]
pub enum ClientEvent {
    Open,
    Close,
    Error(String),
}

enum ChannelState {
    Connecting { queued: Vec<(bool, Vec<u8>)> },
    Open { tx: mpsc::Sender<(bool, Vec<u8>)> },
}

#[derive(Default)]
struct ClientState {
    channels: HashMap<String, ChannelState>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

pub struct TunnelClient {
    config: ClientConfig,
    http: reqwest::Client,
    ready_state: Mutex<ReadyState>,
    closing: AtomicBool,
    ws_sink: Mutex<Option<Arc<Mutex<WsSink>>>>,
    dispatch_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    rpc_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rpc_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    state: Mutex<ClientState>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(64);
        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            ready_state: Mutex::new(ReadyState::Closed),
            closing: AtomicBool::new(false),
            ws_sink: Mutex::new(None),
            dispatch_handle: Mutex::new(None),
            rpc_tx: Mutex::new(None),
            rpc_handle: Mutex::new(None),
            state: Mutex::new(ClientState::default()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    /// Take ownership of this client's event stream. Consumed once by the
    /// embedder driving it.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.lock().await.take()
    }

    pub async fn ready_state(&self) -> ReadyState {
        *self.ready_state.lock().await
    }

    /// Connect outbound to `tunnel_uri` and begin relaying frames.
    /// Transitions `ready_state` from `Closed` to `Open` only once the
    /// transport is actually connected.
    pub async fn open(self: &Arc<Self>) -> TunnelResult<()> {
        let mut ready = self.ready_state.lock().await;
        if *ready == ReadyState::Open {
            return Ok(());
        }

        let (ws_stream, _response) = connect_async(&self.config.tunnel_uri)
            .await
            .map_err(|e| TunnelError::Transport(format!("tunnel connect error: {e}")))?;

        let (sink, stream) = ws_stream.split();
        *self.ws_sink.lock().await = Some(Arc::new(Mutex::new(sink)));
        *ready = ReadyState::Open;
        self.closing.store(false, Ordering::SeqCst);
        drop(ready);

        // Inbound `rpc` frames are handed to a single worker that awaits each
        // HTTP round trip in turn, rather than spawning one task per frame —
        // the gateway matches responses to requests strictly FIFO
        // (`gateway.respond` pops the oldest outstanding request), so the
        // client must preserve that order rather than let concurrent HTTP
        // responses race each other back through the tunnel.
        let (rpc_tx, mut rpc_rx) = mpsc::channel::<Vec<u8>>(64);
        *self.rpc_tx.lock().await = Some(rpc_tx);
        let rpc_client = self.clone();
        let rpc_handle = tokio::spawn(async move {
            while let Some(payload) = rpc_rx.recv().await {
                rpc_client.clone().handle_rpc_frame(payload).await;
            }
        });
        *self.rpc_handle.lock().await = Some(rpc_handle);

        let dispatch_client = self.clone();
        let handle = tokio::spawn(async move {
            dispatch_client.dispatch_loop(stream).await;
        });
        *self.dispatch_handle.lock().await = Some(handle);

        info!(tunnel_uri = %self.config.tunnel_uri, "tunnel opened");
        self.emit(ClientEvent::Open).await;
        Ok(())
    }

    /// Idempotent close. Returns `true` if a tunnel was actually torn down,
    /// `false` if none was active.
    pub async fn close(self: &Arc<Self>) -> bool {
        let was_open = *self.ready_state.lock().await == ReadyState::Open;
        if !was_open {
            return false;
        }
        self.teardown().await;
        true
    }

    async fn dispatch_loop(self: Arc<Self>, mut stream: WsStream) {
        let mut demuxer = Demuxer::new();
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => match demuxer.feed(&data) {
                    Ok(frames) => {
                        for frame in frames {
                            self.handle_inbound_frame(frame).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "demuxer rejected frame");
                        self.emit(ClientEvent::Error(e.to_string())).await;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "tunnel socket error");
                    break;
                }
            }
        }
        debug!("tunnel dispatch loop ended");
        self.teardown().await;
    }

    async fn handle_inbound_frame(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Rpc { payload } => {
                let sender = self.rpc_tx.lock().await.clone();
                match sender {
                    Some(tx) => {
                        if tx.send(payload).await.is_err() {
                            warn!("rpc worker gone, dropping inbound rpc frame");
                        }
                    }
                    None => warn!("rpc frame received before tunnel was open"),
                }
            }
            Frame::DataChannel {
                quid,
                binary,
                payload,
            } => {
                self.handle_datachannel_frame(quid, binary, payload).await;
            }
        }
    }

    /// Forward an inbound `rpc` frame's envelope to `target_rpc_uri` and
    /// wrap the response back into an outbound `rpc` frame. Both transport
    /// failures and non-2xx HTTP statuses surface as `error` events without
    /// forwarding a frame or tearing the tunnel down.
    async fn handle_rpc_frame(self: Arc<Self>, payload: Vec<u8>) {
        let response = self
            .http
            .post(&self.config.target_rpc_uri)
            .body(payload)
            .send()
            .await;

        let resp = match response {
            Ok(resp) => resp,
            Err(e) => {
                self.emit(ClientEvent::Error(format!("rpc request failed: {e}")))
                    .await;
                return;
            }
        };

        if !resp.status().is_success() {
            self.emit(ClientEvent::Error(format!(
                "rpc request returned status {}",
                resp.status()
            )))
            .await;
            return;
        }

        let body = resp.bytes().await;

        match body {
            Ok(bytes) => {
                if let Err(e) = self
                    .send_frame(Frame::Rpc {
                        payload: bytes.to_vec(),
                    })
                    .await
                {
                    warn!(error = %e, "failed to forward rpc response");
                }
            }
            Err(e) => {
                self.emit(ClientEvent::Error(format!("rpc response read failed: {e}")))
                    .await;
            }
        }
    }

    async fn handle_datachannel_frame(
        self: &Arc<Self>,
        quid: String,
        binary: bool,
        payload: Vec<u8>,
    ) {
        let mut state = self.state.lock().await;
        match state.channels.get_mut(&quid) {
            Some(ChannelState::Open { tx }) => {
                let tx = tx.clone();
                drop(state);
                let _ = tx.send((binary, payload)).await;
            }
            Some(ChannelState::Connecting { queued }) => {
                queued.push((binary, payload));
            }
            None => {
                state.channels.insert(
                    quid.clone(),
                    ChannelState::Connecting {
                        queued: vec![(binary, payload)],
                    },
                );
                drop(state);
                let client = self.clone();
                tokio::spawn(async move {
                    client.open_loopback(quid).await;
                });
            }
        }
    }

    /// Open a loopback `ws://` socket for `quid`, flush anything queued
    /// while it was connecting, then bridge it to the muxer until it
    /// closes or the connect attempt itself fails or times out.
    async fn open_loopback(self: Arc<Self>, quid: String) {
        let url = format!("ws://{}:{}", self.config.target_host, self.config.target_port);
        let attempt = tokio::time::timeout(
            self.config.loopback_connect_timeout,
            connect_async(&url),
        )
        .await;

        let ws_stream = match attempt {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                warn!(quid = %quid, error = %e, "loopback connect failed");
                self.close_loopback(&quid, close_codes::UNEXPECTED, e.to_string())
                    .await;
                return;
            }
            Err(_) => {
                warn!(quid = %quid, "loopback connect timed out");
                self.close_loopback(
                    &quid,
                    close_codes::UNEXPECTED,
                    "loopback connect timed out".to_string(),
                )
                .await;
                return;
            }
        };

        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut write_rx) = mpsc::channel::<(bool, Vec<u8>)>(64);

        let queued = {
            let mut state = self.state.lock().await;
            match state
                .channels
                .insert(quid.clone(), ChannelState::Open { tx })
            {
                Some(ChannelState::Connecting { queued }) => queued,
                _ => Vec::new(),
            }
        };
        for (binary, payload) in queued {
            if sink.send(to_ws_message(binary, payload)).await.is_err() {
                break;
            }
        }

        let writer_quid = quid.clone();
        let writer_handle = tokio::spawn(async move {
            while let Some((binary, payload)) = write_rx.recv().await {
                if sink.send(to_ws_message(binary, payload)).await.is_err() {
                    break;
                }
            }
            debug!(quid = %writer_quid, "loopback writer ended");
        });
        self.state.lock().await.tasks.push(writer_handle);

        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let _ = self
                        .send_frame(Frame::DataChannel {
                            quid: quid.clone(),
                            binary: true,
                            payload: data,
                        })
                        .await;
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = self
                        .send_frame(Frame::DataChannel {
                            quid: quid.clone(),
                            binary: false,
                            payload: text.into_bytes(),
                        })
                        .await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((close_codes::NORMAL, "loopback closed".to_string()));
                    self.close_loopback(&quid, code, reason).await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.close_loopback(&quid, close_codes::UNEXPECTED, e.to_string())
                        .await;
                    return;
                }
                None => {
                    self.close_loopback(
                        &quid,
                        close_codes::NORMAL,
                        "loopback closed".to_string(),
                    )
                    .await;
                    return;
                }
            }
        }
    }

    /// Remove `quid` from the channel map and emit a terminal `datachannel`
    /// frame carrying the close reason as JSON.
    async fn close_loopback(&self, quid: &str, code: u16, message: String) {
        self.state.lock().await.channels.remove(quid);
        let _ = self
            .send_frame(Frame::DataChannel {
                quid: quid.to_string(),
                binary: false,
                payload: terminal_payload(code, &message),
            })
            .await;
        debug!(quid = %quid, code, "loopback channel closed");
    }

    async fn send_frame(&self, frame: Frame) -> TunnelResult<()> {
        let bytes = Muxer::encode(&frame)?;
        let sink = self.ws_sink.lock().await.clone();
        match sink {
            Some(sink) => sink
                .lock()
                .await
                .send(Message::Binary(bytes))
                .await
                .map_err(|e| TunnelError::Transport(format!("tunnel write error: {e}"))),
            None => Err(TunnelError::Transport("tunnel is not open".into())),
        }
    }

    async fn emit(&self, event: ClientEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Tear down the transport, abort all loopback and dispatch tasks, and
    /// emit `close`. Runs at most once per `open()` regardless of whether
    /// it was triggered by an explicit `close()` or the transport dying.
    async fn teardown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.ready_state.lock().await = ReadyState::Closed;

        if let Some(sink) = self.ws_sink.lock().await.take() {
            let _ = sink.lock().await.send(Message::Close(None)).await;
        }
        if let Some(handle) = self.dispatch_handle.lock().await.take() {
            handle.abort();
        }
        self.rpc_tx.lock().await.take();
        if let Some(handle) = self.rpc_handle.lock().await.take() {
            handle.abort();
        }

        let mut state = self.state.lock().await;
        state.channels.clear();
        for task in state.tasks.drain(..) {
            task.abort();
        }
        drop(state);

        info!("tunnel closed");
        self.emit(ClientEvent::Close).await;
    }
}

fn to_ws_message(binary: bool, payload: Vec<u8>) -> Message {
    if binary {
        Message::Binary(payload)
    } else {
        Message::Text(String::from_utf8_lossy(&payload).into_owned())
    }
}
