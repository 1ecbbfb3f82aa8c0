//! Accept loop and per-connection relay for a single gateway's listening
//! socket.
//!
//! Each accepted overlay-peer connection opens with a one-byte request
//! kind: `0x01` starts a single RPC round trip, `0x02` starts a long-lived
//! data-channel session. This tiny framing exists purely so one TCP
//! listener can carry both traffic kinds described by the tunnel's data
//! model; it is local to the gateway and never crosses the tunnel itself.

use super::GatewayEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use tunnel_core::{close_codes, terminal_payload, Frame, TunnelError, TunnelResult};

const KIND_RPC: u8 = 0x01;
const KIND_DATACHANNEL: u8 = 0x02;
const RPC_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
const DATACHANNEL_READ_BUF: usize = 64 * 1024;

#[derive(Default)]
struct GatewayState {
    pending_rpc: VecDeque<oneshot::Sender<Vec<u8>>>,
    channels: HashMap<String, mpsc::Sender<Vec<u8>>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Server-side ingress point for one tunneled client.
///
/// Lifecycle: constructed (`Created`), then [`Gateway::open`] binds the
/// listener (`Open` → `Bound`), then [`Gateway::close`] tears everything
/// down (`Closed`). Destroyed by the owning session either when the remote
/// tunneled client disconnects or the gateway is explicitly closed.
pub struct Gateway {
    id: u32,
    max_channels: usize,
    state: Mutex<GatewayState>,
    event_tx: mpsc::Sender<GatewayEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<GatewayEvent>>>,
    cancel_tx: Mutex<Option<mpsc::Sender<()>>>,
    actual_port: Mutex<Option<u16>>,
}

impl Gateway {
    /// Construct a new, unopened gateway.
    pub fn new(id: u32, max_channels: usize) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(256);
        Arc::new(Self {
            id,
            max_channels,
            state: Mutex::new(GatewayState::default()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            cancel_tx: Mutex::new(None),
            actual_port: Mutex::new(None),
        })
    }

    /// Bind the listener on `bind_addr:port` (`port == 0` for an ephemeral
    /// OS-assigned port) and start the accept loop.
    ///
    /// Fails with [`TunnelError::BindFailed`] if the bind fails.
    pub async fn open(self: &Arc<Self>, bind_addr: &str, port: u16) -> TunnelResult<u16> {
        let addr = format!("{bind_addr}:{port}");
        let tcp_listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TunnelError::BindFailed(format!("{addr}: {e}")))?;

        let actual_port = tcp_listener
            .local_addr()
            .map(|a| a.port())
            .unwrap_or(port);
        *self.actual_port.lock().await = Some(actual_port);

        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        *self.cancel_tx.lock().await = Some(cancel_tx);

        info!(gateway_id = self.id, addr = %addr, actual_port, "gateway bound");

        let gateway = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.recv() => {
                        debug!(gateway_id = gateway.id, "accept loop cancelled");
                        break;
                    }
                    result = tcp_listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                debug!(gateway_id = gateway.id, peer = %peer, "overlay peer connected");
                                let gw = gateway.clone();
                                let handle = tokio::spawn(async move {
                                    handle_connection(stream, gw).await;
                                });
                                gateway.state.lock().await.tasks.push(handle);
                            }
                            Err(e) => warn!(gateway_id = gateway.id, error = %e, "accept failed"),
                        }
                    }
                }
            }
        });

        Ok(actual_port)
    }

    /// Take ownership of this gateway's outgoing event stream. Consumed
    /// exactly once by the owning tunnel session's muxer loop.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<GatewayEvent>> {
        self.event_rx.lock().await.take()
    }

    /// Deliver an RPC response to the oldest outstanding RPC request.
    pub async fn respond(&self, payload: Vec<u8>) -> TunnelResult<()> {
        let sender = self.state.lock().await.pending_rpc.pop_front();
        match sender {
            Some(tx) => {
                let _ = tx.send(payload);
                Ok(())
            }
            None => Err(TunnelError::InvalidFrame(
                "rpc response with no outstanding request".into(),
            )),
        }
    }

    /// Deliver a data-channel payload to the peer identified by `quid`.
    pub async fn transfer(&self, quid: &str, payload: Vec<u8>) -> TunnelResult<()> {
        let sender = {
            let state = self.state.lock().await;
            state.channels.get(quid).cloned()
        };
        match sender {
            Some(tx) => tx
                .send(payload)
                .await
                .map_err(|_| TunnelError::Transport(format!("quid {quid} write channel closed"))),
            None => Err(TunnelError::Transport(format!("unknown quid {quid}"))),
        }
    }

    /// Release the port, abort all open RPC responses and data-channel
    /// sessions.
    pub async fn close(&self) {
        if let Some(cancel_tx) = self.cancel_tx.lock().await.take() {
            let _ = cancel_tx.send(()).await;
        }
        let mut state = self.state.lock().await;
        state.pending_rpc.clear();
        state.channels.clear();
        for task in state.tasks.drain(..) {
            task.abort();
        }
        info!(gateway_id = self.id, "gateway closed");
    }

    async fn emit(&self, event: GatewayEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

async fn handle_connection(stream: TcpStream, gateway: Arc<Gateway>) {
    let mut stream = stream;
    let mut kind = [0u8; 1];
    if stream.read_exact(&mut kind).await.is_err() {
        return;
    }
    match kind[0] {
        KIND_RPC => handle_rpc_connection(stream, gateway).await,
        KIND_DATACHANNEL => handle_datachannel_connection(stream, gateway).await,
        other => warn!(kind = other, "unknown gateway connection kind"),
    }
}

async fn handle_rpc_connection(mut stream: TcpStream, gateway: Arc<Gateway>) {
    let mut len_buf = [0u8; 4];
    if stream.read_exact(&mut len_buf).await.is_err() {
        return;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    if stream.read_exact(&mut payload).await.is_err() {
        return;
    }

    let (tx, rx) = oneshot::channel::<Vec<u8>>();
    gateway.state.lock().await.pending_rpc.push_back(tx);
    gateway.emit(GatewayEvent::Frame(Frame::Rpc { payload })).await;

    match tokio::time::timeout(RPC_RESPONSE_TIMEOUT, rx).await {
        Ok(Ok(response)) => {
            let mut out = Vec::with_capacity(4 + response.len());
            out.extend_from_slice(&(response.len() as u32).to_be_bytes());
            out.extend_from_slice(&response);
            let _ = stream.write_all(&out).await;
        }
        Ok(Err(_)) => {
            // Sender dropped — gateway was closed while we waited.
        }
        Err(_) => {
            warn!(gateway_id = gateway.id, "rpc response timed out");
        }
    }
}

async fn handle_datachannel_connection(stream: TcpStream, gateway: Arc<Gateway>) {
    let quid = tunnel_core::generate_quid();

    let mut state = gateway.state.lock().await;
    if state.channels.len() >= gateway.max_channels {
        warn!(gateway_id = gateway.id, "quid budget exhausted, refusing data channel");
        drop(state);
        gateway
            .emit(GatewayEvent::Frame(Frame::DataChannel {
                quid,
                binary: false,
                payload: terminal_payload(
                    close_codes::RESOURCE_EXHAUSTED,
                    "quid budget exhausted for this tunnel",
                ),
            }))
            .await;
        return;
    }
    let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(64);
    state.channels.insert(quid.clone(), write_tx);
    let (rd, wr) = tokio::io::split(stream);
    let writer_gateway = gateway.clone();
    let writer_quid = quid.clone();
    let writer_handle = tokio::spawn(async move {
        writer_loop(wr, write_rx, writer_gateway, writer_quid).await;
    });
    state.tasks.push(writer_handle);
    drop(state);

    reader_loop(rd, gateway.clone(), quid).await;
}

async fn writer_loop(
    mut wr: tokio::io::WriteHalf<TcpStream>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    gateway: Arc<Gateway>,
    quid: String,
) {
    while let Some(bytes) = write_rx.recv().await {
        if wr.write_all(&bytes).await.is_err() {
            break;
        }
    }
    debug!(gateway_id = gateway.id, quid = %quid, "data channel writer ended");
}

async fn reader_loop(mut rd: tokio::io::ReadHalf<TcpStream>, gateway: Arc<Gateway>, quid: String) {
    let mut buf = vec![0u8; DATACHANNEL_READ_BUF];
    let close_reason = loop {
        match rd.read(&mut buf).await {
            Ok(0) => break (close_codes::NORMAL, "peer closed connection".to_string()),
            Ok(n) => {
                gateway
                    .emit(GatewayEvent::Frame(Frame::DataChannel {
                        quid: quid.clone(),
                        binary: true,
                        payload: buf[..n].to_vec(),
                    }))
                    .await;
            }
            Err(e) => break (close_codes::UNEXPECTED, e.to_string()),
        }
    };

    gateway.state.lock().await.channels.remove(&quid);
    gateway
        .emit(GatewayEvent::Frame(Frame::DataChannel {
            quid: quid.clone(),
            binary: false,
            payload: terminal_payload(close_reason.0, &close_reason.1),
        }))
        .await;
    debug!(gateway_id = gateway.id, quid = %quid, "data channel reader ended");
}
