//! Native WebSocket transport — `tokio-tungstenite`.
//!
//! A background tokio task owns the connection: it serializes outbound
//! commands, matches acknowledgments to in-flight requests by id, replies to
//! protocol pings, forwards every other inbound frame to the dispatcher's
//! ingress, and reconnects with jittered exponential backoff, resubscribing
//! to the streams it was tracking before the drop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::WsError;
use crate::ws::{Transport, WsConfig};
use crate::wire::{CommandAck, CommandOut, Method};

use async_trait::async_trait;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Raw-frame sink for inbound traffic (the dispatcher's ingress).
pub type Ingress = Arc<dyn Fn(&str) + Send + Sync>;

// ─── Commands from public API to background task ─────────────────────────────

enum Command {
    Request {
        method: Method,
        params: Vec<String>,
        ack: oneshot::Sender<Result<(), WsError>>,
    },
    Close,
}

enum DisconnectReason {
    UserRequested,
    NormalClose,
    Error(String),
}

// ─── Background task state ───────────────────────────────────────────────────

struct TaskState {
    config: WsConfig,
    cmd_rx: mpsc::Receiver<Command>,
    ingress: Ingress,
    /// Streams to restore after a reconnect.
    active_streams: Vec<String>,
    /// In-flight request acknowledgments, keyed by command id.
    pending_acks: HashMap<u64, oneshot::Sender<Result<(), WsError>>>,
    next_id: u64,
    reconnect_attempts: u32,
}

impl TaskState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn track(&mut self, method: Method, params: &[String]) {
        match method {
            Method::Subscribe => {
                for stream in params {
                    if !self.active_streams.contains(stream) {
                        self.active_streams.push(stream.clone());
                    }
                }
            }
            Method::Unsubscribe => {
                self.active_streams.retain(|s| !params.contains(s));
            }
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        for (_, ack) in self.pending_acks.drain() {
            let _ = ack.send(Err(WsError::Closed {
                code: None,
                reason: reason.to_string(),
            }));
        }
    }

    fn should_reconnect(&self) -> bool {
        self.config.reconnect && self.reconnect_attempts < self.config.max_reconnect_attempts
    }
}

// ─── Public transport ────────────────────────────────────────────────────────

/// Production [`Transport`] over a persistent WebSocket connection.
pub struct WsTransport {
    config: WsConfig,
    cmd_tx: mpsc::Sender<Command>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Dial the stream endpoint and spawn the connection task. Inbound
    /// frames that are not command acknowledgments are handed to `ingress`.
    pub async fn connect(config: WsConfig, ingress: Ingress) -> Result<Self, WsError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        // Establish the first connection eagerly so connect() fails fast on
        // a bad endpoint; reconnects after drops happen inside the task.
        let stream = attempt_connect(&config.url)
            .await
            .map_err(WsError::ConnectionFailed)?;

        let state = TaskState {
            config: config.clone(),
            cmd_rx,
            ingress,
            active_streams: Vec::new(),
            pending_acks: HashMap::new(),
            next_id: 0,
            reconnect_attempts: 0,
        };

        let handle = tokio::spawn(run_task(state, Some(stream)));

        Ok(Self {
            config,
            cmd_tx,
            task_handle: Mutex::new(Some(handle)),
        })
    }

    async fn request(&self, method: Method, streams: &[String]) -> Result<(), WsError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                method,
                params: streams.to_vec(),
                ack: ack_tx,
            })
            .await
            .map_err(|_| WsError::NotConnected)?;

        let timeout = Duration::from_millis(self.config.ack_timeout_ms);
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WsError::NotConnected),
            Err(_) => Err(WsError::AckTimeout),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn subscribe(&self, streams: &[String]) -> Result<(), WsError> {
        self.request(Method::Subscribe, streams).await
    }

    async fn unsubscribe(&self, streams: &[String]) -> Result<(), WsError> {
        self.request(Method::Unsubscribe, streams).await
    }

    async fn close(&self) -> Result<(), WsError> {
        let _ = self.cmd_tx.send(Command::Close).await;
        if let Some(handle) = self.task_handle.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        Ok(())
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.task_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

// ─── Background task ─────────────────────────────────────────────────────────

async fn run_task(mut state: TaskState, mut first: Option<WsStream>) {
    loop {
        let stream = match first.take() {
            Some(s) => s,
            None => match attempt_connect(&state.config.url).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "WebSocket connection failed");
                    if state.should_reconnect() {
                        backoff_sleep(&mut state).await;
                        continue;
                    }
                    state.fail_pending("connection failed");
                    return;
                }
            },
        };

        state.reconnect_attempts = 0;
        let (mut sink, stream) = stream.split();
        resubscribe_all(&mut sink, &mut state).await;

        let reason = run_connected(&mut state, sink, stream).await;

        match reason {
            DisconnectReason::UserRequested | DisconnectReason::NormalClose => {
                state.fail_pending("connection closed");
                return;
            }
            DisconnectReason::Error(e) => {
                state.fail_pending(&e);
                if state.should_reconnect() {
                    backoff_sleep(&mut state).await;
                    continue;
                }
                tracing::error!(error = %e, "WebSocket closed, reconnect attempts exhausted");
                return;
            }
        }
    }
}

/// The inner connected loop — runs until the connection breaks.
async fn run_connected(
    state: &mut TaskState,
    mut sink: SplitSink<WsStream, Message>,
    mut stream: SplitStream<WsStream>,
) -> DisconnectReason {
    loop {
        tokio::select! {
            // ── a) Incoming WS message ───────────────────────────────────
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let raw: &str = text.as_ref();
                        if !consume_ack(state, raw) {
                            (state.ingress)(raw);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = extract_close(frame.as_ref());
                        tracing::info!(code, reason, "WebSocket closed by server");
                        return match code {
                            1000 => DisconnectReason::NormalClose,
                            _ => DisconnectReason::Error(reason),
                        };
                    }
                    Some(Ok(_)) => {} // Binary, Frame — ignore
                    Some(Err(e)) => {
                        let reason = e.to_string();
                        tracing::error!(error = %reason, "WebSocket error");
                        return DisconnectReason::Error(reason);
                    }
                    None => {
                        return DisconnectReason::Error("stream ended".into());
                    }
                }
            }

            // ── b) Command from public API ───────────────────────────────
            cmd = state.cmd_rx.recv() => {
                match cmd {
                    Some(Command::Request { method, params, ack }) => {
                        let id = state.next_id();
                        state.track(method, &params);
                        let frame = CommandOut { method, params, id };
                        match send_frame(&mut sink, &frame).await {
                            Ok(()) => {
                                state.pending_acks.insert(id, ack);
                            }
                            Err(e) => {
                                let _ = ack.send(Err(WsError::SendFailed(e)));
                            }
                        }
                    }
                    Some(Command::Close) => {
                        let _ = sink.send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client disconnect".into(),
                        }))).await;
                        return DisconnectReason::UserRequested;
                    }
                    None => {
                        // Transport dropped — clean exit.
                        return DisconnectReason::UserRequested;
                    }
                }
            }
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Resolve a pending request if `raw` is an acknowledgment for one.
/// Returns `true` when the frame was consumed.
fn consume_ack(state: &mut TaskState, raw: &str) -> bool {
    let Ok(ack) = serde_json::from_str::<CommandAck>(raw) else {
        return false;
    };
    let Some(waiter) = state.pending_acks.remove(&ack.id) else {
        return false;
    };
    let result = match ack.error {
        Some(e) => Err(WsError::Rejected(format!("{} (code {})", e.msg, e.code))),
        None => Ok(()),
    };
    let _ = waiter.send(result);
    true
}

async fn attempt_connect(url: &str) -> Result<WsStream, String> {
    let (ws_stream, _) = tokio::time::timeout(Duration::from_secs(30), connect_async(url))
        .await
        .map_err(|_| "connection timeout".to_string())?
        .map_err(|e| e.to_string())?;
    Ok(ws_stream)
}

async fn send_frame(
    sink: &mut SplitSink<WsStream, Message>,
    frame: &CommandOut,
) -> Result<(), String> {
    let json = serde_json::to_string(frame).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}

fn extract_close(frame: Option<&CloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (f.code.into(), f.reason.to_string()),
        None => (1006, "no close frame".into()),
    }
}

/// Restore tracked subscriptions after a reconnect. The server acks with a
/// fresh id nobody is waiting on, which `consume_ack` ignores.
async fn resubscribe_all(sink: &mut SplitSink<WsStream, Message>, state: &mut TaskState) {
    if state.active_streams.is_empty() {
        return;
    }
    tracing::info!(
        count = state.active_streams.len(),
        "resubscribing tracked streams"
    );
    let id = state.next_id();
    let frame = CommandOut {
        method: Method::Subscribe,
        params: state.active_streams.clone(),
        id,
    };
    if let Err(e) = send_frame(sink, &frame).await {
        tracing::warn!(error = %e, "failed to resubscribe after reconnect");
    }
}

async fn backoff_sleep(state: &mut TaskState) {
    state.reconnect_attempts += 1;

    let exp = (state.reconnect_attempts - 1).min(10);
    let base = state
        .config
        .base_reconnect_delay_ms
        .saturating_mul(1u32 << exp);
    let jitter = rand::random::<u32>() % 500;
    let delay = base.saturating_add(jitter).min(60_000);

    tracing::info!(
        attempt = state.reconnect_attempts,
        max = state.config.max_reconnect_attempts,
        delay_ms = delay,
        "reconnecting"
    );

    tokio::time::sleep(Duration::from_millis(delay as u64)).await;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
