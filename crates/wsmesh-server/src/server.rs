//! Core server: accepts connections, owns the session registries, and
//! routes every inbound packet.
//!
//! All registries live behind one `RwLock`, so cross-map invariants (UID
//! binding, channel membership) mutate atomically. Each accepted socket
//! gets a writer task fed by the session's outbound channel and a read
//! loop that drives the receive pipeline to completion frame by frame,
//! preserving per-connection ordering.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use wsmesh_core::codec::{self, WireFrame};
use wsmesh_core::fleet::{FleetEnv, NodeEntry, SslPaths};
use wsmesh_core::packet::{close, routes};
use wsmesh_core::{InnerEnvelope, MeshError, MeshResult, Packet, Response};

use crate::cluster::Peer;
use crate::session::{resolve_ip, Session};

/// A user or remote route handler.
pub type Handler =
    Arc<dyn Fn(Arc<MessageServer>, Arc<Session>, Packet) -> BoxFuture<'static, ()> + Send + Sync>;

/// Supervisor callback, invoked each cycle with (socket count, UID-bound count).
pub type SupervisorHook = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Close callback, invoked for every session teardown.
pub type CloserHook = Arc<dyn Fn(Arc<Session>) + Send + Sync>;

/// Message server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,
    /// Codec password; `None` means plaintext JSON frames.
    pub password: Option<String>,
    /// Cluster-signing secret; required for any cluster traffic.
    pub secret: Option<String>,
    /// Emit binary frames instead of Base64 text.
    pub binary: bool,
    /// Supervisor period in milliseconds. Must be >= 10_000.
    pub cycle_ms: u64,
    /// Max interval between heartbeats per session, in milliseconds.
    /// Must be >= 30_000 and >= 3 x `cycle_ms`.
    pub timeout_ms: u64,
    /// Recent-request-id ring capacity per session.
    pub req_id_cache: usize,
    /// Header consulted before the TCP peer when resolving a client address.
    pub forwarded_header: Option<String>,
    /// TLS material; when present the listener terminates TLS.
    pub ssls: Option<SslPaths>,
    /// Cluster set, fixed at startup: group name to peer endpoints.
    pub links: HashMap<String, Vec<NodeEntry>>,
}

impl ServerConfig {
    pub const MIN_CYCLE_MS: u64 = 10_000;
    pub const MIN_TIMEOUT_MS: u64 = 30_000;

    pub fn new(port: u16) -> Self {
        Self {
            host: "0.0.0.0".into(),
            port,
            password: None,
            secret: None,
            binary: false,
            cycle_ms: 60_000,
            timeout_ms: 180_000,
            req_id_cache: 32,
            forwarded_header: None,
            ssls: None,
            links: HashMap::new(),
        }
    }

    /// Build a config from the fleet environment of this process.
    /// The codec password and cluster secret are not part of the fleet
    /// descriptor and stay unset.
    pub fn from_fleet(fleet: &FleetEnv) -> Self {
        let mut config = Self::new(fleet.port);
        config.host = fleet.inip.clone();
        config.ssls = fleet.ssls.clone();
        config.links = fleet.linked_nodes();
        config
    }

    fn validate(&self) -> MeshResult<()> {
        if self.cycle_ms < Self::MIN_CYCLE_MS {
            return Err(MeshError::Config(format!(
                "cycle {}ms is below the {}ms floor",
                self.cycle_ms,
                Self::MIN_CYCLE_MS
            )));
        }
        if self.timeout_ms < Self::MIN_TIMEOUT_MS || self.timeout_ms < 3 * self.cycle_ms {
            return Err(MeshError::Config(format!(
                "timeout {}ms must be >= {}ms and >= 3 x cycle",
                self.timeout_ms,
                Self::MIN_TIMEOUT_MS
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Registry {
    /// Every accepted connection.
    sockets: HashMap<u64, Arc<Session>>,
    /// Only UID-bound sessions.
    sessions: HashMap<String, Arc<Session>>,
    /// Channel members, keyed by group id then session id.
    channels: HashMap<String, HashMap<u64, Arc<Session>>>,
}

#[derive(Default)]
struct Hooks {
    supervisor: Option<SupervisorHook>,
    closer: Option<CloserHook>,
}

enum InnerKind {
    P2p,
    Grp,
    All,
    Rmc,
}

fn reject_reserved(route: String) -> MeshResult<String> {
    if routes::is_reserved(&route) {
        return Err(MeshError::Config(format!(
            "route {route} collides with the reserved namespace"
        )));
    }
    Ok(route)
}

/// The message server instance.
pub struct MessageServer {
    config: ServerConfig,
    /// Back-reference to the owning `Arc`, handed to route handlers.
    self_ref: Weak<MessageServer>,
    registry: RwLock<Registry>,
    routers: RwLock<HashMap<String, Handler>>,
    remotes: RwLock<HashMap<String, Handler>>,
    pub(crate) clusters: RwLock<HashMap<String, Vec<Peer>>>,
    hooks: RwLock<Hooks>,
    next_session_id: AtomicU64,
    bound_addr: StdMutex<Option<SocketAddr>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MessageServer {
    /// Create a server. Fails when the supervisor timing constraints are
    /// violated.
    pub fn new(config: ServerConfig) -> MeshResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            config,
            self_ref: self_ref.clone(),
            registry: RwLock::new(Registry::default()),
            routers: RwLock::new(HashMap::new()),
            remotes: RwLock::new(HashMap::new()),
            clusters: RwLock::new(HashMap::new()),
            hooks: RwLock::new(Hooks::default()),
            next_session_id: AtomicU64::new(1),
            bound_addr: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The address the listener bound to (available after `start`).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }

    // ── Registration ────────────────────────────────────────────────

    /// Install a user route handler. Routes in the reserved `$...$`
    /// namespace are rejected; the dispatcher owns those.
    pub async fn set_router<F, Fut>(&self, route: impl Into<String>, handler: F) -> MeshResult<()>
    where
        F: Fn(Arc<MessageServer>, Arc<Session>, Packet) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let route = reject_reserved(route.into())?;
        let handler: Handler = Arc::new(move |srv, sess, pkt| Box::pin(handler(srv, sess, pkt)));
        self.routers.write().await.insert(route, handler);
        Ok(())
    }

    /// Install a cluster RPC handler. The same reserved-namespace rule as
    /// [`set_router`] applies.
    ///
    /// [`set_router`]: MessageServer::set_router
    pub async fn set_remote<F, Fut>(&self, route: impl Into<String>, handler: F) -> MeshResult<()>
    where
        F: Fn(Arc<MessageServer>, Arc<Session>, Packet) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let route = reject_reserved(route.into())?;
        let handler: Handler = Arc::new(move |srv, sess, pkt| Box::pin(handler(srv, sess, pkt)));
        self.remotes.write().await.insert(route, handler);
        Ok(())
    }

    /// Install the optional supervisor and session-close callbacks.
    pub async fn set_listeners(
        &self,
        supervisor: Option<SupervisorHook>,
        closer: Option<CloserHook>,
    ) {
        let mut hooks = self.hooks.write().await;
        hooks.supervisor = supervisor;
        hooks.closer = closer;
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Bind the listener, start the supervisor, and connect peer clients.
    pub async fn start(&self) -> MeshResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MeshError::Other("server already running".into()));
        }
        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> MeshResult<()> {
        let acceptor = match &self.config.ssls {
            Some(ssls) => Some(crate::tls::load_tls_acceptor(
                std::path::Path::new(&ssls.key),
                std::path::Path::new(&ssls.cert),
            )?),
            None => None,
        };

        let bind = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&bind).await?;
        let local = listener.local_addr()?;
        *self.bound_addr.lock().unwrap() = Some(local);

        self.connect_peers().await;

        let server = self
            .self_ref
            .upgrade()
            .ok_or_else(|| MeshError::Other("server dropped".into()))?;
        let supervisor = tokio::spawn(server.clone().supervise());
        let accepter = tokio::spawn(server.accept_loop(listener, acceptor));
        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(supervisor);
            tasks.push(accepter);
        }

        info!(
            addr = %local,
            tls = self.config.ssls.is_some(),
            groups = self.config.links.len(),
            "message server listening"
        );
        Ok(())
    }

    /// Stop the supervisor and listener, disconnect peers, and close every
    /// live session.
    pub async fn close(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        self.disconnect_peers().await;

        let sessions: Vec<Arc<Session>> = {
            let mut registry = self.registry.write().await;
            let all: Vec<Arc<Session>> = registry.sockets.values().cloned().collect();
            registry.sockets.clear();
            registry.sessions.clear();
            registry.channels.clear();
            all
        };
        for session in sessions {
            // 1001: standard "going away"; framework codes are reserved for
            // protocol violations.
            session.close(1001, "server closed");
        }
        *self.bound_addr.lock().unwrap() = None;
        info!("message server closed");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    match acceptor.clone() {
                        Some(acceptor) => {
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(tls) => server.serve_connection(tls, addr).await,
                                    Err(e) => {
                                        warn!(remote = %addr, error = %e, "TLS accept failed")
                                    }
                                }
                            });
                        }
                        None => {
                            tokio::spawn(async move { server.serve_connection(stream, addr).await });
                        }
                    }
                }
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    }

    // ── Connection handling ─────────────────────────────────────────

    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // The forwarding header is only visible during the HTTP upgrade, so
        // it is captured out of the handshake callback.
        let header_name = self.config.forwarded_header.clone();
        let forwarded: Arc<OnceLock<String>> = Arc::new(OnceLock::new());
        let captured = forwarded.clone();
        let callback = move |request: &Request,
                             response: HandshakeResponse|
              -> Result<HandshakeResponse, ErrorResponse> {
            if let Some(name) = header_name.as_deref() {
                if let Some(value) = request.headers().get(name).and_then(|v| v.to_str().ok()) {
                    let _ = captured.set(value.to_string());
                }
            }
            Ok(response)
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(remote = %peer_addr, error = %e, "WebSocket handshake failed");
                return;
            }
        };

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let ip = resolve_ip(forwarded.get().map(String::as_str), peer_addr);
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let session = Arc::new(Session::new(id, ip, tx));
        self.registry
            .write()
            .await
            .sockets
            .insert(id, session.clone());
        debug!(session_id = id, ip = %session.ip(), "session accepted");

        let (mut sink, mut stream) = ws.split();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            if !session.is_open() {
                break;
            }
            tokio::select! {
                _ = session.wait_closed() => break,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !self.handle_frame(&session, WireFrame::Text(text.to_string())).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if !self.handle_frame(&session, WireFrame::Binary(data.to_vec())).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        session.send_raw(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session_id = id, error = %e, "socket error");
                        session.close(close::SOCKET, "socket error");
                        break;
                    }
                    None => break,
                }
            }
        }

        self.cleanup_session(&session).await;
        debug!(session_id = id, "session ended");
        // The writer drains on its own once every sender is dropped.
        drop(writer);
    }

    /// The receive pipeline. Returns false once the session is closed and
    /// the read loop should end.
    async fn handle_frame(&self, session: &Arc<Session>, frame: WireFrame) -> bool {
        let value = match codec::decode(&frame, self.config.password.as_deref()) {
            Ok(value) => value,
            Err(e) => {
                debug!(session_id = session.id(), error = %e, "frame parse failed");
                session.close(close::PARSE, "parse error");
                return false;
            }
        };
        let packet = match Packet::from_value(value) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(session_id = session.id(), error = %e, "bad packet shape");
                session.close(close::FORMAT, "format error");
                return false;
            }
        };
        if !session.update_req_id(packet.req_id, self.config.req_id_cache) {
            debug!(
                session_id = session.id(),
                req_id = packet.req_id,
                "duplicate reqId"
            );
            session.close(close::REPEAT, "repeat error");
            return false;
        }

        let inner_kind = match packet.route.as_str() {
            routes::HEARTICK => {
                session.update_heart();
                self.send_to(session, &packet);
                return true;
            }
            routes::INNER_P2P => Some(InnerKind::P2p),
            routes::INNER_GRP => Some(InnerKind::Grp),
            routes::INNER_ALL => Some(InnerKind::All),
            routes::INNER_RMC => Some(InnerKind::Rmc),
            _ => None,
        };
        match inner_kind {
            Some(kind) => self.handle_inner(session, packet, kind).await,
            None => {
                let handler = self.routers.read().await.get(&packet.route).cloned();
                match handler {
                    Some(handler) => {
                        if let Some(server) = self.self_ref.upgrade() {
                            handler(server, session.clone(), packet).await;
                        }
                        true
                    }
                    None => {
                        debug!(
                            session_id = session.id(),
                            route = %packet.route,
                            "unknown route"
                        );
                        session.close(close::ROUTE, "route error");
                        false
                    }
                }
            }
        }
    }

    async fn handle_inner(&self, session: &Arc<Session>, packet: Packet, kind: InnerKind) -> bool {
        let secret = match self.config.secret.as_deref() {
            Some(secret) => secret,
            None => {
                warn!(session_id = session.id(), "cluster packet without a configured secret");
                session.close(close::SIGN, "sign error");
                return false;
            }
        };
        let envelope = match InnerEnvelope::from_value(packet.message) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(session_id = session.id(), error = %e, "malformed inner envelope");
                session.close(close::SIGN, "sign error");
                return false;
            }
        };
        if !envelope.verify(secret) {
            warn!(
                session_id = session.id(),
                route = %envelope.route,
                "inner envelope signature mismatch"
            );
            session.close(close::SIGN, "sign error");
            return false;
        }

        match kind {
            InnerKind::P2p => {
                if let Some(tid) = envelope.tid {
                    self.push_session(&tid, &envelope.route, envelope.message)
                        .await;
                }
                true
            }
            InnerKind::Grp => {
                if let Some(tid) = envelope.tid {
                    self.push_channel(&tid, &envelope.route, envelope.message)
                        .await;
                }
                true
            }
            InnerKind::All => {
                self.broadcast(&envelope.route, envelope.message).await;
                true
            }
            InnerKind::Rmc => {
                let handler = self.remotes.read().await.get(&envelope.route).cloned();
                match handler {
                    Some(handler) => {
                        // The outer reqId is preserved so the handler can
                        // correlate a reply over the peer connection.
                        let request = Packet::new(envelope.route, packet.req_id, envelope.message);
                        if let Some(server) = self.self_ref.upgrade() {
                            handler(server, session.clone(), request).await;
                        }
                        true
                    }
                    None => {
                        debug!(
                            session_id = session.id(),
                            route = %envelope.route,
                            "unknown remote route"
                        );
                        session.close(close::REMOTE, "remote error");
                        false
                    }
                }
            }
        }
    }

    async fn cleanup_session(&self, session: &Arc<Session>) {
        // The socket is already gone; just stop further sends.
        session.seal();

        let closer = self.hooks.read().await.closer.clone();
        if let Some(closer) = closer {
            if catch_unwind(AssertUnwindSafe(|| closer(session.clone()))).is_err() {
                warn!(session_id = session.id(), "close callback panicked");
            }
        }

        let mut registry = self.registry.write().await;
        for gid in session.drain_channels() {
            if let Some(members) = registry.channels.get_mut(&gid) {
                members.remove(&session.id());
                if members.is_empty() {
                    registry.channels.remove(&gid);
                }
            }
        }
        if let Some(uid) = session.take_uid() {
            registry.sessions.remove(&uid);
        }
        registry.sockets.remove(&session.id());
    }

    // ── UID binding ─────────────────────────────────────────────────

    /// Bind a UID to a session. When another session holds the UID it is
    /// unbound first and, with `close_old`, closed with code 4009. The
    /// unbind happens before the close so the displaced session's close
    /// handler cannot erase the new binding.
    pub async fn bind_uid(&self, session: &Arc<Session>, uid: impl Into<String>, close_old: bool) {
        let uid = uid.into();
        let displaced = {
            let mut registry = self.registry.write().await;
            let mut displaced = None;
            if let Some(old) = registry.sessions.remove(&uid) {
                if old.id() != session.id() {
                    old.take_uid();
                    displaced = Some(old);
                }
            }
            if let Some(previous) = session.take_uid() {
                registry.sessions.remove(&previous);
            }
            session.set_uid(uid.clone());
            registry.sessions.insert(uid.clone(), session.clone());
            displaced
        };
        if let Some(old) = displaced {
            info!(uid = %uid, old = old.id(), new = session.id(), "uid displaced");
            if close_old {
                old.close(close::NEWBIND, "newbind");
            }
        }
    }

    /// Drop a session's UID binding. Idempotent.
    pub async fn unbind_uid(&self, session: &Arc<Session>) {
        let mut registry = self.registry.write().await;
        if let Some(uid) = session.take_uid() {
            registry.sessions.remove(&uid);
        }
    }

    /// Look up the session bound to a UID on this node.
    pub async fn session(&self, uid: &str) -> Option<Arc<Session>> {
        self.registry.read().await.sessions.get(uid).cloned()
    }

    // ── Channels ────────────────────────────────────────────────────

    /// Add a session to a channel. Created lazily on first join; joining
    /// twice is idempotent.
    pub async fn join_channel(&self, session: &Arc<Session>, gid: impl Into<String>) {
        let gid = gid.into();
        let mut registry = self.registry.write().await;
        if session.join_channel(&gid) {
            registry
                .channels
                .entry(gid)
                .or_default()
                .insert(session.id(), session.clone());
        }
    }

    /// Remove a session from a channel; the channel itself is removed when
    /// it empties.
    pub async fn quit_channel(&self, session: &Arc<Session>, gid: &str) {
        let mut registry = self.registry.write().await;
        if session.quit_channel(gid) {
            if let Some(members) = registry.channels.get_mut(gid) {
                members.remove(&session.id());
                if members.is_empty() {
                    registry.channels.remove(gid);
                }
            }
        }
    }

    /// Member count of a channel; 0 when the channel does not exist.
    pub async fn channel_count(&self, gid: &str) -> usize {
        self.registry
            .read()
            .await
            .channels
            .get(gid)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    /// Number of accepted connections.
    pub async fn socket_count(&self) -> usize {
        self.registry.read().await.sockets.len()
    }

    /// Number of UID-bound sessions.
    pub async fn session_count(&self) -> usize {
        self.registry.read().await.sessions.len()
    }

    // ── Push primitives ─────────────────────────────────────────────

    pub(crate) fn encode(&self, packet: &Packet) -> Option<WireFrame> {
        match codec::encode(packet, self.config.password.as_deref(), self.config.binary) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(route = %packet.route, error = %e, "encode failed");
                None
            }
        }
    }

    fn send_to(&self, session: &Session, packet: &Packet) -> bool {
        match self.encode(packet) {
            Some(frame) => session.send(frame),
            None => false,
        }
    }

    /// Answer a request, reusing its `reqId`.
    pub fn response(&self, session: &Session, request: &Packet, response: Response) -> bool {
        let packet = Packet::new(routes::RESPONSE, request.req_id, response.into());
        self.send_to(session, &packet)
    }

    /// Push to the session bound to a UID. Silently a no-op when the UID is
    /// not bound on this node.
    pub async fn push_session(&self, uid: &str, route: &str, message: Value) -> bool {
        let target = self.registry.read().await.sessions.get(uid).cloned();
        match target {
            Some(session) => self.send_to(&session, &Packet::new(route, 0, message)),
            None => false,
        }
    }

    /// Push the same message to a batch of UIDs.
    pub async fn push_session_batch(&self, uids: &[String], route: &str, message: Value) {
        for uid in uids {
            self.push_session(uid, route, message.clone()).await;
        }
    }

    /// Push to every member of a channel. Returns the number of frames
    /// handed to sockets.
    pub async fn push_channel(&self, gid: &str, route: &str, message: Value) -> usize {
        let members: Vec<Arc<Session>> = {
            let registry = self.registry.read().await;
            registry
                .channels
                .get(gid)
                .map(|members| members.values().cloned().collect())
                .unwrap_or_default()
        };
        let frame = match self.encode(&Packet::new(route, 0, message)) {
            Some(frame) => frame,
            None => return 0,
        };
        members
            .iter()
            .filter(|session| session.send(frame.clone()))
            .count()
    }

    /// Push to every member of a channel, re-encoding per recipient through
    /// a caller-supplied transform of the base message.
    pub async fn push_channel_custom(
        &self,
        gid: &str,
        route: &str,
        base: Value,
        transform: &(dyn Fn(&Session, &Value) -> Value + Send + Sync),
    ) -> usize {
        let members: Vec<Arc<Session>> = {
            let registry = self.registry.read().await;
            registry
                .channels
                .get(gid)
                .map(|members| members.values().cloned().collect())
                .unwrap_or_default()
        };
        let mut delivered = 0;
        for session in members {
            let message = transform(&session, &base);
            if self.send_to(&session, &Packet::new(route, 0, message)) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Push to every UID-bound session. Sessions without a UID are not
    /// broadcast targets.
    pub async fn broadcast(&self, route: &str, message: Value) -> usize {
        let targets: Vec<Arc<Session>> = {
            let registry = self.registry.read().await;
            registry.sessions.values().cloned().collect()
        };
        let frame = match self.encode(&Packet::new(route, 0, message)) {
            Some(frame) => frame,
            None => return 0,
        };
        targets
            .iter()
            .filter(|session| session.send(frame.clone()))
            .count()
    }

    // ── Supervisor ──────────────────────────────────────────────────

    async fn supervise(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.cycle_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // skip first immediate tick
        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }

    /// One supervisor cycle: close expired sessions, then report counts.
    /// A panicking callback is caught and logged; the cycle never dies.
    async fn sweep(&self) {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let (expired, live, bound) = {
            let registry = self.registry.read().await;
            let expired: Vec<Arc<Session>> = registry
                .sockets
                .values()
                .filter(|session| session.is_expired(timeout))
                .cloned()
                .collect();
            (expired, registry.sockets.len(), registry.sessions.len())
        };
        for session in &expired {
            warn!(session_id = session.id(), "session heartbeat lapsed");
            session.close(close::TIMEOUT, "timeout");
        }
        let supervisor = self.hooks.read().await.supervisor.clone();
        if let Some(supervisor) = supervisor {
            if catch_unwind(AssertUnwindSafe(|| supervisor(live, bound))).is_err() {
                warn!("supervisor callback panicked");
            }
        }
    }
}
