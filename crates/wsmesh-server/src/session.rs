//! Per-connection server-side state.
//!
//! A `Session` is one live WebSocket plus its application state: identity,
//! UID binding, joined channels, the recent-request-id ring, and the
//! heartbeat watermark. Outbound frames go through an unbounded channel to
//! the connection's writer task, so sends never block the caller.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use wsmesh_core::codec::WireFrame;

/// Resolve the peer address of a connection, preferring a configured
/// forwarding header over the TCP peer, and normalizing the result.
pub(crate) fn resolve_ip(forwarded: Option<&str>, peer: SocketAddr) -> String {
    let raw = forwarded
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| peer.ip().to_string());
    normalize_ip(&raw)
}

/// Strip the IPv6-mapped-IPv4 prefix and fold loopback to dotted form.
fn normalize_ip(raw: &str) -> String {
    let stripped = raw.strip_prefix("::ffff:").unwrap_or(raw);
    if stripped == "::1" {
        "127.0.0.1".to_string()
    } else {
        stripped.to_string()
    }
}

struct SessionState {
    uid: Option<String>,
    context: std::collections::HashMap<String, Value>,
    channels: HashSet<String>,
    recent_req_ids: VecDeque<u64>,
    last_heart: Instant,
}

/// One live WebSocket connection and its application state.
pub struct Session {
    id: u64,
    ip: String,
    tx: mpsc::UnboundedSender<Message>,
    open: AtomicBool,
    closed: Notify,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(id: u64, ip: String, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            ip,
            tx,
            open: AtomicBool::new(true),
            closed: Notify::new(),
            state: Mutex::new(SessionState {
                uid: None,
                context: std::collections::HashMap::new(),
                channels: HashSet::new(),
                recent_req_ids: VecDeque::new(),
                last_heart: Instant::now(),
            }),
        }
    }

    /// Local connection id, assigned at accept time.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Normalized peer address.
    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Hand a frame to the socket. Returns whether the frame was accepted,
    /// which is only true while the socket is open.
    pub fn send(&self, frame: WireFrame) -> bool {
        let msg = match frame {
            WireFrame::Text(t) => Message::Text(t.into()),
            WireFrame::Binary(b) => Message::Binary(b.into()),
        };
        self.send_raw(msg)
    }

    pub(crate) fn send_raw(&self, msg: Message) -> bool {
        if !self.is_open() {
            return false;
        }
        self.tx.send(msg).is_ok()
    }

    /// Shut the underlying socket. Idempotent; only the first close emits
    /// the close frame.
    pub fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            })));
            self.closed.notify_one();
        }
    }

    /// Resolves once `close` has been called. The stored permit covers a
    /// close that happens before the wait starts.
    pub(crate) async fn wait_closed(&self) {
        self.closed.notified().await;
    }

    /// Mark the session closed without emitting a close frame. Used during
    /// teardown when the socket is already gone.
    pub(crate) fn seal(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closed.notify_one();
        }
    }

    // ── UID slot ────────────────────────────────────────────────────

    /// Current UID, if bound.
    pub fn uid(&self) -> Option<String> {
        self.state.lock().unwrap().uid.clone()
    }

    pub(crate) fn set_uid(&self, uid: String) {
        self.state.lock().unwrap().uid = Some(uid);
    }

    pub(crate) fn take_uid(&self) -> Option<String> {
        self.state.lock().unwrap().uid.take()
    }

    // ── Context scratch ─────────────────────────────────────────────

    /// Store an application value on this session.
    pub fn set_context(&self, key: impl Into<String>, value: Value) {
        self.state.lock().unwrap().context.insert(key.into(), value);
    }

    /// Read an application value off this session.
    pub fn context(&self, key: &str) -> Option<Value> {
        self.state.lock().unwrap().context.get(key).cloned()
    }

    // ── Channels ────────────────────────────────────────────────────

    /// Record channel membership. Returns false when already joined
    /// (joining twice is idempotent).
    pub(crate) fn join_channel(&self, gid: &str) -> bool {
        self.state.lock().unwrap().channels.insert(gid.to_string())
    }

    /// Drop channel membership. Returns false when not a member.
    pub(crate) fn quit_channel(&self, gid: &str) -> bool {
        self.state.lock().unwrap().channels.remove(gid)
    }

    /// Visit every joined channel id.
    pub fn each_channel(&self, mut f: impl FnMut(&str)) {
        for gid in self.state.lock().unwrap().channels.iter() {
            f(gid);
        }
    }

    /// Snapshot of joined channel ids.
    pub fn channels(&self) -> Vec<String> {
        self.state.lock().unwrap().channels.iter().cloned().collect()
    }

    pub(crate) fn drain_channels(&self) -> Vec<String> {
        self.state.lock().unwrap().channels.drain().collect()
    }

    // ── Request-id ring ─────────────────────────────────────────────

    /// Record a request id. Returns true when the id is novel; false when
    /// it is already in the ring, in which case the caller must close the
    /// connection with code 4003. On overflow the oldest half of the ring
    /// is dropped, so the defense covers the ring window only.
    pub fn update_req_id(&self, req_id: u64, capacity: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.recent_req_ids.contains(&req_id) {
            return false;
        }
        state.recent_req_ids.push_back(req_id);
        if state.recent_req_ids.len() > capacity {
            let drop_n = (capacity / 2).max(1);
            state.recent_req_ids.drain(..drop_n);
        }
        true
    }

    // ── Heartbeat watermark ─────────────────────────────────────────

    /// Stamp the liveness watermark.
    pub fn update_heart(&self) {
        self.state.lock().unwrap().last_heart = Instant::now();
    }

    /// Whether the last heartbeat is older than `timeout`.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.state.lock().unwrap().last_heart.elapsed() > timeout
    }

    #[cfg(test)]
    pub(crate) fn backdate_heart(&self, age: Duration) {
        let past = Instant::now()
            .checked_sub(age)
            .expect("process uptime exceeds the backdate age");
        self.state.lock().unwrap().last_heart = past;
    }
}
