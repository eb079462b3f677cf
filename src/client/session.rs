use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::endpoint::{TcpEndpointBuilder, Tunnel, TunnelInfo};
use super::status::ConnectionStatus;
use crate::error::{Result, SluiceError};
use crate::mux::{Link, Multiplexer, TunnelStream};
use crate::protocol::{codes, EndpointOptions, Frame, SessionId, TunnelId};
use crate::transport::{spawn_writer, LINK_CAPACITY};

/// Environment variable read by [`SessionBuilder::authtoken_from_env`]
pub const AUTHTOKEN_ENV: &str = "SLUICE_AUTHTOKEN";

/// Matches the development relay's default listen address
pub const DEFAULT_SERVER: &str = "ws://127.0.0.1:7000";
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
const MISSED_HEARTBEATS: u32 = 3;
const ACCEPT_BACKLOG: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Builds and authenticates a [`Session`]
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    server: String,
    authtoken: Option<String>,
    metadata: Option<String>,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    reconnect: bool,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            authtoken: None,
            metadata: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: true,
        }
    }

    pub fn authtoken(mut self, token: impl Into<String>) -> Self {
        self.authtoken = Some(token.into());
        self
    }

    /// Use the token in `SLUICE_AUTHTOKEN`, if set
    pub fn authtoken_from_env(mut self) -> Self {
        if let Ok(token) = std::env::var(AUTHTOKEN_ENV) {
            if !token.trim().is_empty() {
                self.authtoken = Some(token);
            }
        }
        self
    }

    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Relay address: a full `ws://` / `wss://` URL, or a bare host
    pub fn server_addr(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(10));
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Dial the relay and authenticate.
    ///
    /// Fails fast on the first attempt; reconnects only happen after a
    /// session was established once.
    pub async fn connect(self) -> Result<Session> {
        let authtoken = self
            .authtoken
            .filter(|t| !t.trim().is_empty())
            .ok_or(SluiceError::MissingAuthtoken)?;
        let server_url = server_url(&self.server)?;

        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let inner = Arc::new(SessionInner {
            config: SessionConfig {
                server_url,
                authtoken,
                metadata: self.metadata,
                heartbeat_interval: self.heartbeat_interval,
                connect_timeout: self.connect_timeout,
                reconnect: self.reconnect,
            },
            state: RwLock::new(SessionState::default()),
            status,
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
            next_request: AtomicU64::new(1),
            next_endpoint: AtomicU64::new(1),
        });

        let conn = inner.dial(None).await?;
        inner.install(&conn).await;

        let handle = tokio::spawn(supervise(inner.clone(), conn));
        *inner.supervisor.lock().await = Some(handle);

        Ok(Session { inner })
    }
}

/// Normalize a relay address into a WebSocket URL
pub fn server_url(server: &str) -> Result<String> {
    let server = server.trim();
    let candidate = if server.contains("://") {
        server.to_string()
    } else {
        format!("wss://{}/tunnel/ws", server.trim_end_matches('/'))
    };

    let url = Url::parse(&candidate)
        .map_err(|e| SluiceError::InvalidServerUrl(format!("{}: {}", server, e)))?;

    match url.scheme() {
        "ws" | "wss" if url.host_str().is_some_and(|h| !h.is_empty()) => Ok(url.to_string()),
        "ws" | "wss" => Err(SluiceError::InvalidServerUrl(format!("{}: missing host", server))),
        other => Err(SluiceError::InvalidServerUrl(format!(
            "{}: unsupported scheme '{}'",
            server, other
        ))),
    }
}

#[derive(Debug, Clone)]
struct SessionConfig {
    server_url: String,
    authtoken: String,
    metadata: Option<String>,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    reconnect: bool,
}

/// Registered endpoint, kept across reconnects
struct EndpointEntry {
    options: EndpointOptions,
    info: watch::Sender<TunnelInfo>,
    incoming: mpsc::Sender<TunnelStream>,
}

impl EndpointEntry {
    /// Options for re-registering, pinned to the address the relay
    /// assigned earlier
    fn replay_options(&self) -> EndpointOptions {
        let mut options = self.options.clone();
        let assigned = self.info.borrow().remote_addr.clone();
        if !assigned.is_empty() {
            options.remote_addr = Some(assigned);
        }
        options
    }
}

/// In-flight `listen` request. `reply` is empty for re-registrations.
struct PendingListen {
    key: u64,
    reply: Option<oneshot::Sender<Result<TunnelInfo>>>,
}

/// Re-registration that hit `bind_failed` and is retried with backoff
struct ReplayRetry {
    delay: Duration,
    due: Instant,
}

#[derive(Default)]
struct SessionState {
    session_id: Option<SessionId>,
    /// Outbound half of the current connection
    link: Option<Link>,
    endpoints: HashMap<u64, EndpointEntry>,
    /// Relay tunnel id -> endpoint key, rebuilt on every connection
    routes: HashMap<TunnelId, u64>,
    pending: HashMap<u64, PendingListen>,
    retries: HashMap<u64, ReplayRetry>,
}

struct SessionInner {
    config: SessionConfig,
    state: RwLock<SessionState>,
    status: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    next_request: AtomicU64,
    next_endpoint: AtomicU64,
}

/// An authenticated connection that has not started its read loop yet
struct Connection {
    session_id: SessionId,
    read: SplitStream<WsStream>,
    link: Link,
    control: mpsc::Sender<Message>,
    writer: JoinHandle<()>,
}

/// Handle to an authenticated relay session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.inner.config.server_url)
            .field("status", &*self.inner.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Relay-assigned id of the current (or last) connection
    pub async fn id(&self) -> Option<SessionId> {
        self.inner.state.read().await.session_id.clone()
    }

    pub fn metadata(&self) -> Option<&str> {
        self.inner.config.metadata.as_deref()
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn tcp_endpoint(&self) -> TcpEndpointBuilder {
        TcpEndpointBuilder::new(self.clone())
    }

    /// Close the control connection and every endpoint on it
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.supervisor.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub(super) async fn listen(&self, options: EndpointOptions) -> Result<Tunnel> {
        let inner = &self.inner;
        let key = inner.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let request_id = inner.next_request.fetch_add(1, Ordering::Relaxed);

        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (info_tx, info_rx) = watch::channel(TunnelInfo::default());
        let (reply_tx, reply_rx) = oneshot::channel();

        let link = {
            let mut s = inner.state.write().await;
            let link = s.link.clone().ok_or(SluiceError::NotConnected)?;
            s.endpoints.insert(
                key,
                EndpointEntry {
                    options: options.clone(),
                    info: info_tx,
                    incoming: incoming_tx,
                },
            );
            s.pending.insert(
                request_id,
                PendingListen {
                    key,
                    reply: Some(reply_tx),
                },
            );
            link
        };

        debug!("Sending listen request {}", request_id);
        let frame = Frame::Listen {
            request_id,
            endpoint: options.clone(),
        };

        let outcome = if link.send(frame).await.is_err() {
            Err(SluiceError::NotConnected)
        } else {
            match timeout(inner.config.connect_timeout, reply_rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => Err(SluiceError::NotConnected),
                Err(_) => Err(SluiceError::Timeout("listen response")),
            }
        };

        match outcome {
            Ok(_) => Ok(Tunnel::new(self.clone(), key, options, info_rx, incoming_rx)),
            Err(e) => {
                let mut s = inner.state.write().await;
                s.endpoints.remove(&key);
                s.pending.remove(&request_id);
                Err(e)
            }
        }
    }

    pub(super) async fn unlisten(&self, key: u64) -> Result<()> {
        let (link, tunnel_id) = {
            let mut s = self.inner.state.write().await;
            let tunnel_id = s
                .endpoints
                .remove(&key)
                .map(|entry| entry.info.borrow().tunnel_id.clone());
            if let Some(id) = &tunnel_id {
                s.routes.remove(id);
            }
            (s.link.clone(), tunnel_id)
        };

        if let (Some(link), Some(tunnel_id)) = (link, tunnel_id) {
            info!("Closing endpoint {}", tunnel_id);
            link.send(Frame::Unlisten { tunnel_id })
                .await
                .map_err(|_| SluiceError::NotConnected)?;
        }
        Ok(())
    }
}

impl SessionInner {
    async fn dial(&self, resume: Option<SessionId>) -> Result<Connection> {
        let cfg = &self.config;
        info!("Connecting to {}...", cfg.server_url);

        let (ws_stream, _) = timeout(cfg.connect_timeout, connect_async(cfg.server_url.as_str()))
            .await
            .map_err(|_| SluiceError::Timeout("relay connection"))??;

        let (write, mut read) = ws_stream.split();
        let (link, frames) = mpsc::channel(LINK_CAPACITY);
        let (control, control_rx) = mpsc::channel(16);
        let writer = spawn_writer(write, frames, control_rx);

        let auth = Frame::auth(&cfg.authtoken, cfg.metadata.as_deref(), resume);
        if link.send(auth).await.is_err() {
            writer.abort();
            return Err(SluiceError::NotConnected);
        }

        let session_id = match timeout(cfg.connect_timeout, await_auth(&mut read, &control)).await
        {
            Ok(Ok(session_id)) => session_id,
            Ok(Err(e)) => {
                writer.abort();
                return Err(e);
            }
            Err(_) => {
                writer.abort();
                return Err(SluiceError::Timeout("authentication"));
            }
        };

        info!("Authenticated, session {}", session_id);
        Ok(Connection {
            session_id,
            read,
            link,
            control,
            writer,
        })
    }

    /// Make `conn` the current connection and replay endpoint registrations
    async fn install(&self, conn: &Connection) {
        let mut replays = Vec::new();
        {
            let mut s = self.state.write().await;
            s.session_id = Some(conn.session_id.clone());
            s.link = Some(conn.link.clone());
            s.routes.clear();
            s.retries.clear();

            let keys: Vec<u64> = s.endpoints.keys().copied().collect();
            for key in keys {
                let Some(entry) = s.endpoints.get(&key) else {
                    continue;
                };
                let options = entry.replay_options();

                let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
                s.pending.insert(request_id, PendingListen { key, reply: None });
                replays.push(Frame::Listen {
                    request_id,
                    endpoint: options,
                });
            }
        }

        if !replays.is_empty() {
            info!("Re-registering {} endpoints", replays.len());
        }
        for frame in replays {
            if conn.link.send(frame).await.is_err() {
                break;
            }
        }
        self.status.send_replace(ConnectionStatus::Connected);
    }

    async fn run_connection(&self, conn: Connection) -> Result<()> {
        let Connection {
            mut read,
            link,
            control,
            mut writer,
            ..
        } = conn;
        let mux = Multiplexer::new(link.clone());

        let interval = self.config.heartbeat_interval;
        let dead_after = interval * MISSED_HEARTBEATS;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        let retry_every = INITIAL_RETRY_DELAY.min(interval);
        let mut retries = tokio::time::interval_at(Instant::now() + retry_every, retry_every);
        let mut last_seen = Instant::now();

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > dead_after {
                        break Err(SluiceError::Timeout("relay heartbeat"));
                    }
                    if link.send(Frame::heartbeat()).await.is_err() {
                        break Err(SluiceError::NotConnected);
                    }
                }

                _ = retries.tick() => self.retry_replays(&link).await,

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        if let Err(e) = self.handle_frame(&text, &link, &mux).await {
                            error!("Error handling message: {}", e);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        debug!("Received ping, sending pong");
                        let _ = control.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(
                            "Relay closed connection: {:?}",
                            frame.map(|f| f.reason.to_string())
                        );
                        break Err(SluiceError::SessionClosed);
                    }
                    Some(Ok(_)) => {
                        debug!("Received binary message (ignoring)");
                    }
                    Some(Err(e)) => break Err(e.into()),
                    None => break Err(SluiceError::SessionClosed),
                },
            }
        };

        mux.shutdown();
        {
            let mut s = self.state.write().await;
            s.link = None;
            s.routes.clear();
            s.retries.clear();
            for (_, pending) in s.pending.drain() {
                if let Some(reply) = pending.reply {
                    let _ = reply.send(Err(SluiceError::NotConnected));
                }
            }
        }

        drop(control);
        drop(link);
        if result.is_ok() {
            // Let queued frames (unlisten, close) reach the relay.
            if timeout(Duration::from_secs(1), &mut writer).await.is_err() {
                writer.abort();
            }
        } else {
            writer.abort();
        }

        result
    }

    /// Resend re-registrations whose backoff has elapsed
    async fn retry_replays(&self, link: &Link) {
        let frames = {
            let mut guard = self.state.write().await;
            let s = &mut *guard;
            let now = Instant::now();
            let due: Vec<u64> = s
                .retries
                .iter()
                .filter(|(_, retry)| retry.due <= now)
                .map(|(key, _)| *key)
                .collect();

            let mut frames = Vec::new();
            for key in due {
                let Some(entry) = s.endpoints.get(&key) else {
                    s.retries.remove(&key);
                    continue;
                };
                let endpoint = entry.replay_options();
                if let Some(retry) = s.retries.get_mut(&key) {
                    // Held back until the relay answers this attempt.
                    retry.due = now + retry.delay;
                }

                let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
                s.pending.insert(request_id, PendingListen { key, reply: None });
                frames.push(Frame::Listen {
                    request_id,
                    endpoint,
                });
            }
            frames
        };

        for frame in frames {
            debug!("Retrying endpoint registration");
            if link.send(frame).await.is_err() {
                break;
            }
        }
    }

    async fn handle_frame(&self, text: &str, link: &Link, mux: &Multiplexer) -> Result<()> {
        let frame = Frame::from_json(text)?;

        match frame {
            Frame::Listening {
                request_id,
                tunnel_id,
                url,
                remote_addr,
            } => {
                let mut guard = self.state.write().await;
                let s = &mut *guard;
                let Some(pending) = s.pending.remove(&request_id) else {
                    warn!("Listening reply for unknown request {}", request_id);
                    return Ok(());
                };

                let info = TunnelInfo {
                    tunnel_id: tunnel_id.clone(),
                    url,
                    remote_addr,
                };

                let registered = match s.endpoints.get(&pending.key) {
                    Some(entry) => {
                        entry.info.send_replace(info.clone());
                        true
                    }
                    None => false,
                };

                if registered {
                    s.retries.remove(&pending.key);
                    s.routes.insert(tunnel_id, pending.key);
                    info!("Endpoint online: {} (tunnel {})", info.url, info.tunnel_id);
                    if let Some(reply) = pending.reply {
                        let _ = reply.send(Ok(info));
                    }
                } else {
                    // Closed while the registration was in flight.
                    drop(guard);
                    let _ = link.send(Frame::Unlisten { tunnel_id }).await;
                }
            }

            Frame::StreamOpen {
                stream_id,
                tunnel_id,
                remote_addr,
                local_addr,
            } => {
                let s = self.state.read().await;
                let incoming = s
                    .routes
                    .get(&tunnel_id)
                    .and_then(|key| s.endpoints.get(key))
                    .map(|entry| entry.incoming.clone());
                drop(s);

                let Some(incoming) = incoming else {
                    warn!("Stream {} for unknown tunnel {}", stream_id, tunnel_id);
                    let _ = link
                        .send(Frame::stream_reset(stream_id, "unknown tunnel"))
                        .await;
                    return Ok(());
                };

                let stream = mux
                    .open(stream_id)?
                    .with_addrs(&remote_addr, &local_addr);
                debug!(
                    "Stream {} opened on {} from {}",
                    stream_id, tunnel_id, remote_addr
                );

                if let Err(e) = incoming.try_send(stream) {
                    warn!(
                        "Endpoint {} is not accepting, resetting stream {}",
                        tunnel_id, stream_id
                    );
                    e.into_inner()
                        .reset("endpoint not accepting connections")
                        .await;
                }
            }

            frame @ (Frame::StreamData { .. }
            | Frame::StreamAck { .. }
            | Frame::StreamClose { .. }
            | Frame::StreamReset { .. }) => {
                let stream_id = frame.stream_id();
                if let Err(e) = mux.dispatch(frame).await {
                    warn!("Stream {:?}: {}", stream_id, e);
                }
            }

            Frame::Heartbeat { .. } => {
                debug!("Received heartbeat");
            }

            Frame::Error {
                request_id: Some(request_id),
                code,
                message,
            } => {
                let mut s = self.state.write().await;
                if let Some(pending) = s.pending.remove(&request_id) {
                    match pending.reply {
                        Some(reply) => {
                            let _ = reply.send(Err(SluiceError::Relay { code, message }));
                        }
                        None if code == codes::BIND_FAILED
                            && s.endpoints.contains_key(&pending.key) =>
                        {
                            // The old address may still be held; keep trying.
                            let delay = s
                                .retries
                                .get(&pending.key)
                                .map(|r| std::cmp::min(r.delay * 2, MAX_RETRY_DELAY))
                                .unwrap_or(INITIAL_RETRY_DELAY);
                            warn!(
                                "Re-registering endpoint failed: {}, retrying in {:?}",
                                message, delay
                            );
                            s.retries.insert(
                                pending.key,
                                ReplayRetry {
                                    delay,
                                    due: Instant::now() + delay,
                                },
                            );
                        }
                        None => {
                            // Dropping the entry ends the tunnel's accept loop.
                            error!("Re-registering endpoint failed: {} - {}", code, message);
                            s.endpoints.remove(&pending.key);
                            s.retries.remove(&pending.key);
                        }
                    }
                }
            }

            Frame::Error { code, message, .. } => {
                error!("Relay error: {} - {}", code, message);
            }

            other => {
                warn!("Unexpected frame from relay: {:?}", other);
            }
        }

        Ok(())
    }
}

/// Owns the connection for the lifetime of the session, reconnecting with
/// exponential backoff.
async fn supervise(inner: Arc<SessionInner>, first: Connection) {
    let mut next = Some(first);
    let mut attempt = 0u32;
    let mut delay = INITIAL_RETRY_DELAY;
    let mut last_error = String::new();

    let reason = loop {
        if let Some(conn) = next.take() {
            attempt = 0;
            delay = INITIAL_RETRY_DELAY;
            match inner.run_connection(conn).await {
                Ok(()) => break "session closed".to_string(),
                Err(e) => {
                    error!("Connection error: {}", e);
                    last_error = e.to_string();
                }
            }
        }

        if inner.cancel.is_cancelled() {
            break "session closed".to_string();
        }
        if !inner.config.reconnect {
            break last_error;
        }

        attempt += 1;
        inner.status.send_replace(ConnectionStatus::Reconnecting {
            attempt,
            reason: last_error.clone(),
            next_retry_secs: delay.as_secs(),
        });
        info!("Reconnecting in {:?}...", delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.cancel.cancelled() => break "session closed".to_string(),
        }
        delay = std::cmp::min(delay * 2, MAX_RETRY_DELAY);

        let resume = inner.state.read().await.session_id.clone();
        match inner.dial(resume).await {
            Ok(conn) => {
                inner.install(&conn).await;
                next = Some(conn);
            }
            Err(SluiceError::AuthFailed(message)) => {
                error!("Relay rejected credentials: {}", message);
                break format!("authentication failed: {}", message);
            }
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                last_error = e.to_string();
            }
        }
    };

    {
        let mut s = inner.state.write().await;
        s.link = None;
        s.routes.clear();
        s.pending.clear();
        s.retries.clear();
        s.endpoints.clear();
    }
    info!("Session ended: {}", reason);
    inner
        .status
        .send_replace(ConnectionStatus::Disconnected { reason });
}

async fn await_auth(
    read: &mut SplitStream<WsStream>,
    control: &mpsc::Sender<Message>,
) -> Result<SessionId> {
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                return match Frame::from_json(&text)? {
                    Frame::AuthOk { session_id } => Ok(session_id),
                    Frame::Error { code, message, .. } if code == codes::AUTH_FAILED => {
                        Err(SluiceError::AuthFailed(message))
                    }
                    Frame::Error { code, message, .. } => Err(SluiceError::Relay { code, message }),
                    other => Err(SluiceError::Protocol(format!(
                        "expected auth_ok, got {:?}",
                        other
                    ))),
                };
            }
            Message::Ping(data) => {
                let _ = control.send(Message::Pong(data)).await;
            }
            Message::Close(_) => return Err(SluiceError::SessionClosed),
            _ => {}
        }
    }
    Err(SluiceError::SessionClosed)
}
