//! The bridge client.
//!
//! `BridgeClient` hands all socket ownership to a manager task and talks to
//! it over a command channel. The manager drives a 1 Hz tick that sweeps
//! request deadlines, emits heartbeats while connected, and retries the
//! connection while disconnected. The client never gives up: retries
//! continue at `conntick` cadence until `disconnect` or `pause_reconnect`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use wsmesh_core::codec::{self, WireFrame};
use wsmesh_core::packet::{close, routes};
use wsmesh_core::{MeshError, MeshResult, Packet, Response};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for a bridge client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint URL. `http(s)://` prefixes are normalized to `ws(s)://`.
    pub host: String,
    /// Codec password; `None` means plaintext JSON frames.
    pub password: Option<String>,
    /// Emit binary frames instead of Base64 text.
    pub binary: bool,
    /// Per-request deadline in milliseconds.
    pub timeout_ms: u64,
    /// Heartbeat period in seconds.
    pub heartick_secs: u64,
    /// Reconnect attempt period in seconds.
    pub conntick_secs: u64,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            password: None,
            binary: false,
            timeout_ms: 8000,
            heartick_secs: 60,
            conntick_secs: 3,
        }
    }

    fn ws_url(&self) -> String {
        if let Some(rest) = self.host.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.host.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.host.clone()
        }
    }
}

/// Lifecycle events observable through [`BridgeClient::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The socket opened (initial connect or reconnect).
    Open,
    /// The socket closed; `code` is the peer's close code, or 4102 when the
    /// stream ended without one.
    Closed { code: u16 },
    /// A non-fatal error, e.g. a frame that failed to deserialize.
    Error(String),
    /// A reconnect attempt is starting; `count` grows until a successful open.
    Retry { count: u32 },
    /// The per-second tick, with the current net delay estimate.
    Tick { timer: u64, net_delay_ms: u64 },
}

enum Command {
    Request {
        packet: Packet,
        responder: Option<oneshot::Sender<Response>>,
    },
    On {
        route: String,
        tx: mpsc::UnboundedSender<Value>,
    },
    Once {
        route: String,
        tx: oneshot::Sender<Value>,
    },
    Events {
        tx: mpsc::UnboundedSender<ClientEvent>,
    },
    PauseReconnect,
    ResumeReconnect,
    Disconnect,
}

/// A resilient WebSocket client with request/response correlation,
/// heartbeat, timeout sweeping, and route listeners.
///
/// Handles are cheap to clone; all clones talk to the same manager task.
#[derive(Clone)]
pub struct BridgeClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    req_id: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
}

impl BridgeClient {
    /// Start the manager task and begin connecting. The first attempt is
    /// made immediately; afterwards the client retries every
    /// `conntick_secs` while disconnected.
    pub fn connect(config: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let req_id = Arc::new(AtomicU64::new(1));
        let connected = Arc::new(AtomicBool::new(false));

        let manager = Manager {
            config,
            pendings: HashMap::new(),
            listeners: HashMap::new(),
            event_subs: Vec::new(),
            timer_inc: 0,
            net_delay_ms: 0,
            retry_count: 0,
            paused: false,
            req_id: req_id.clone(),
            connected: connected.clone(),
        };
        tokio::spawn(manager.run(cmd_rx));

        Self {
            cmd_tx,
            req_id,
            connected,
        }
    }

    /// Whether the underlying socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Send a request and await the response envelope.
    ///
    /// The caller always receives the envelope; `code` distinguishes
    /// success from failure, including the synthesized
    /// `{504, "Gateway Timeout"}` when the deadline passes. A request
    /// issued while disconnected is dropped on the wire but still times
    /// out normally.
    pub async fn call(&self, route: impl Into<String>, message: Value) -> MeshResult<Response> {
        let (tx, rx) = oneshot::channel();
        let packet = self.next_packet(route, message);
        self.cmd_tx
            .send(Command::Request {
                packet,
                responder: Some(tx),
            })
            .map_err(|_| MeshError::Closed)?;
        rx.await.map_err(|_| MeshError::Closed)
    }

    /// Send a request without expecting a response. Dropped silently while
    /// disconnected.
    pub fn cast(&self, route: impl Into<String>, message: Value) -> MeshResult<()> {
        let packet = self.next_packet(route, message);
        self.cmd_tx
            .send(Command::Request {
                packet,
                responder: None,
            })
            .map_err(|_| MeshError::Closed)
    }

    /// Subscribe to every push on a route. The listener is removed when the
    /// receiver is dropped.
    pub fn on(&self, route: impl Into<String>) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.cmd_tx.send(Command::On {
            route: route.into(),
            tx,
        });
        rx
    }

    /// Subscribe to the next push on a route only.
    pub fn once(&self, route: impl Into<String>) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Once {
            route: route.into(),
            tx,
        });
        rx
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.cmd_tx.send(Command::Events { tx });
        rx
    }

    /// Suspend reconnect attempts without tearing the client down.
    pub fn pause_reconnect(&self) {
        let _ = self.cmd_tx.send(Command::PauseReconnect);
    }

    /// Resume reconnect attempts after [`pause_reconnect`].
    ///
    /// [`pause_reconnect`]: BridgeClient::pause_reconnect
    pub fn resume_reconnect(&self) {
        let _ = self.cmd_tx.send(Command::ResumeReconnect);
    }

    /// Tear the client down. Closes the socket with code 4104 and stops the
    /// manager; the instance is dead afterwards and further calls fail
    /// with [`MeshError::Closed`].
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    fn next_packet(&self, route: impl Into<String>, message: Value) -> Packet {
        let id = self.req_id.fetch_add(1, Ordering::Relaxed);
        Packet::new(route, id, message)
    }
}

struct Pending {
    at: Instant,
    responder: oneshot::Sender<Response>,
}

enum Listener {
    Every(mpsc::UnboundedSender<Value>),
    Once(oneshot::Sender<Value>),
}

struct Manager {
    config: ClientConfig,
    pendings: HashMap<u64, Pending>,
    listeners: HashMap<String, Vec<Listener>>,
    event_subs: Vec<mpsc::UnboundedSender<ClientEvent>>,
    timer_inc: u64,
    net_delay_ms: u64,
    retry_count: u32,
    paused: bool,
    req_id: Arc<AtomicU64>,
    connected: Arc<AtomicBool>,
}

impl Manager {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let mut socket: Option<WsStream> = None;
        self.try_open(&mut socket).await;

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.on_tick(&mut socket).await;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Disconnect) | None => {
                            self.shutdown(&mut socket).await;
                            break;
                        }
                        Some(cmd) => self.on_command(cmd, &mut socket).await,
                    }
                }
                frame = next_frame(&mut socket), if socket.is_some() => {
                    self.on_frame(frame, &mut socket).await;
                }
            }
        }
        debug!("bridge client manager ended");
    }

    async fn shutdown(&mut self, socket: &mut Option<WsStream>) {
        if let Some(mut ws) = socket.take() {
            let _ = ws.send(close_frame(close::CLIENT_CALL, "client call")).await;
            let _ = ws.close(None).await;
        }
        self.set_connected(false);
    }

    async fn on_tick(&mut self, socket: &mut Option<WsStream>) {
        self.timer_inc += 1;

        // Expire pending requests past the deadline.
        let deadline = Duration::from_millis(self.config.timeout_ms);
        let expired: Vec<u64> = self
            .pendings
            .iter()
            .filter(|(_, p)| p.at.elapsed() > deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pendings.remove(&id) {
                let _ = pending.responder.send(Response::gateway_timeout());
            }
        }

        // Heartbeat while connected.
        if socket.is_some()
            && self.config.heartick_secs > 0
            && self.timer_inc % self.config.heartick_secs == 0
        {
            let id = self.req_id.fetch_add(1, Ordering::Relaxed);
            let beat = Packet::new(routes::HEARTICK, id, Value::from(now_ms()));
            self.send_packet(socket, &beat).await;
        }

        // Reconnect while disconnected.
        if socket.is_none()
            && !self.paused
            && self.config.conntick_secs > 0
            && self.timer_inc % self.config.conntick_secs == 0
        {
            self.retry_count += 1;
            let count = self.retry_count;
            self.emit(ClientEvent::Retry { count });
            self.try_open(socket).await;
        }

        let timer = self.timer_inc;
        let net_delay_ms = self.net_delay_ms;
        self.emit(ClientEvent::Tick { timer, net_delay_ms });
    }

    async fn on_command(&mut self, cmd: Command, socket: &mut Option<WsStream>) {
        match cmd {
            Command::Request { packet, responder } => {
                if let Some(responder) = responder {
                    self.pendings.insert(
                        packet.req_id,
                        Pending {
                            at: Instant::now(),
                            responder,
                        },
                    );
                }
                // A send while disconnected is dropped silently; any pending
                // entry times out normally.
                self.send_packet(socket, &packet).await;
            }
            Command::On { route, tx } => {
                self.listeners
                    .entry(route)
                    .or_default()
                    .push(Listener::Every(tx));
            }
            Command::Once { route, tx } => {
                self.listeners
                    .entry(route)
                    .or_default()
                    .push(Listener::Once(tx));
            }
            Command::Events { tx } => self.event_subs.push(tx),
            Command::PauseReconnect => self.paused = true,
            Command::ResumeReconnect => self.paused = false,
            // Terminal; intercepted by the run loop.
            Command::Disconnect => {}
        }
    }

    async fn on_frame(
        &mut self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
        socket: &mut Option<WsStream>,
    ) {
        match frame {
            Some(Ok(Message::Text(text))) => {
                self.dispatch(WireFrame::Text(text.to_string()));
            }
            Some(Ok(Message::Binary(data))) => {
                self.dispatch(WireFrame::Binary(data.to_vec()));
            }
            Some(Ok(Message::Ping(payload))) => {
                if let Some(ws) = socket.as_mut() {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
            }
            Some(Ok(Message::Close(reason))) => {
                let code = reason
                    .map(|f| u16::from(f.code))
                    .unwrap_or(close::CLIENT_CLOSE);
                *socket = None;
                self.set_connected(false);
                self.emit(ClientEvent::Closed { code });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                *socket = None;
                self.set_connected(false);
                self.emit(ClientEvent::Error(format!("socket error: {e}")));
                self.emit(ClientEvent::Closed {
                    code: close::CLIENT_ERROR,
                });
            }
            None => {
                *socket = None;
                self.set_connected(false);
                self.emit(ClientEvent::Closed {
                    code: close::CLIENT_CLOSE,
                });
            }
        }
    }

    /// Route one decoded frame: heartbeat echo, response correlation, then
    /// route listeners. A frame that fails to decode fires the error event
    /// and is otherwise ignored.
    fn dispatch(&mut self, frame: WireFrame) {
        let packet = codec::decode(&frame, self.config.password.as_deref())
            .and_then(Packet::from_value);
        let packet = match packet {
            Ok(p) => p,
            Err(_) => {
                self.emit(ClientEvent::Error("Deserialize Error".into()));
                return;
            }
        };

        match packet.route.as_str() {
            routes::HEARTICK => {
                if let Some(sent) = packet.message.as_u64() {
                    self.net_delay_ms = now_ms().saturating_sub(sent);
                }
            }
            routes::RESPONSE => {
                // No pending entry means the request already timed out.
                if let Some(pending) = self.pendings.remove(&packet.req_id) {
                    self.net_delay_ms = pending.at.elapsed().as_millis() as u64;
                    let _ = pending.responder.send(Response::from_value(packet.message));
                }
            }
            route => {
                if let Some(mut list) = self.listeners.remove(route) {
                    let mut kept = Vec::with_capacity(list.len());
                    for listener in list.drain(..) {
                        match listener {
                            Listener::Every(tx) => {
                                if tx.send(packet.message.clone()).is_ok() {
                                    kept.push(Listener::Every(tx));
                                }
                            }
                            Listener::Once(tx) => {
                                let _ = tx.send(packet.message.clone());
                            }
                        }
                    }
                    if !kept.is_empty() {
                        self.listeners.insert(route.to_string(), kept);
                    }
                }
            }
        }
    }

    async fn send_packet(&mut self, socket: &mut Option<WsStream>, packet: &Packet) {
        let ws = match socket.as_mut() {
            Some(ws) => ws,
            None => return,
        };
        let frame = match codec::encode(packet, self.config.password.as_deref(), self.config.binary)
        {
            Ok(f) => f,
            Err(e) => {
                self.emit(ClientEvent::Error(format!("encode error: {e}")));
                return;
            }
        };
        let msg = match frame {
            WireFrame::Text(t) => Message::Text(t.into()),
            WireFrame::Binary(b) => Message::Binary(b.into()),
        };
        if let Err(e) = ws.send(msg).await {
            *socket = None;
            self.set_connected(false);
            self.emit(ClientEvent::Error(format!("send error: {e}")));
            self.emit(ClientEvent::Closed {
                code: close::CLIENT_ERROR,
            });
        }
    }

    /// Attempt one connection. On success the retry count resets and the
    /// open event fires; on failure the socket stays down until the next
    /// conntick.
    async fn try_open(&mut self, socket: &mut Option<WsStream>) {
        // A stale half-open socket is replaced, not reused.
        if let Some(mut stale) = socket.take() {
            let _ = stale
                .send(close_frame(close::CLIENT_RETRY, "client retry"))
                .await;
            let _ = stale.close(None).await;
            self.set_connected(false);
        }

        let url = self.config.ws_url();
        // Bound the attempt so a black-holed connect cannot stall the tick
        // loop past the retry cadence.
        let guard = Duration::from_secs(self.config.conntick_secs.clamp(1, 5));
        let attempt = async {
            if url.starts_with("wss://") {
                connect_async_tls_with_config(url.as_str(), None, false, Some(crate::tls::trusting_connector()))
                    .await
            } else {
                connect_async(url.as_str()).await
            }
        };
        match tokio::time::timeout(guard, attempt).await {
            Ok(Ok((ws, _response))) => {
                debug!(url = %url, "bridge client connected");
                *socket = Some(ws);
                self.retry_count = 0;
                self.set_connected(true);
                self.emit(ClientEvent::Open);
            }
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "bridge client connect failed");
            }
            Err(_) => {
                warn!(url = %url, "bridge client connect timed out");
            }
        }
    }

    fn set_connected(&self, up: bool) {
        self.connected.store(up, Ordering::Relaxed);
    }

    fn emit(&mut self, event: ClientEvent) {
        self.event_subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket.as_mut() {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_normalization() {
        assert_eq!(
            ClientConfig::new("http://a.example:9000").ws_url(),
            "ws://a.example:9000"
        );
        assert_eq!(
            ClientConfig::new("https://a.example").ws_url(),
            "wss://a.example"
        );
        assert_eq!(
            ClientConfig::new("ws://a.example").ws_url(),
            "ws://a.example"
        );
    }

    #[test]
    fn defaults_match_protocol() {
        let cfg = ClientConfig::new("ws://x");
        assert_eq!(cfg.timeout_ms, 8000);
        assert_eq!(cfg.heartick_secs, 60);
        assert_eq!(cfg.conntick_secs, 3);
        assert!(!cfg.binary);
        assert!(cfg.password.is_none());
    }
}
