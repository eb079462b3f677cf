//! Development relay.
//!
//! Accepts client control connections, binds a public TCP listener per
//! registered endpoint and multiplexes every accepted connection to the
//! owning client as a stream.

mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::SessionId;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7000";
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Control connection listen address
    pub listen: String,
    /// Accepted authtokens; empty accepts any non-empty token
    pub tokens: Vec<String>,
    /// Host advertised in endpoint URLs, defaults to `bind_host`
    pub public_host: Option<String>,
    /// Interface endpoint listeners bind to when no address is requested
    pub bind_host: String,
    pub auth_timeout: Duration,
    /// Sessions silent for this long are dropped
    pub idle_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            tokens: Vec::new(),
            public_host: None,
            bind_host: DEFAULT_BIND_HOST.to_string(),
            auth_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    fn accepts(&self, token: &str) -> bool {
        if token.trim().is_empty() {
            return false;
        }
        self.tokens.is_empty() || self.tokens.iter().any(|t| t == token)
    }

    fn public_host(&self) -> &str {
        self.public_host.as_deref().unwrap_or(&self.bind_host)
    }
}

/// A live session as seen by later connections that resume it
struct SessionEntry {
    generation: u64,
    /// Cancelled to stop the session's read loop
    cancel: CancellationToken,
    /// Cancelled by the session once its listeners are closed
    released: CancellationToken,
}

/// State shared by every session on one relay
struct RelayShared {
    config: RelayConfig,
    next_tunnel: AtomicU64,
    next_generation: AtomicU64,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl RelayShared {
    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `id` as live. Returns the generation and the two tokens the
    /// session has to honour.
    fn register(&self, id: &SessionId) -> (u64, CancellationToken, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let released = CancellationToken::new();
        self.sessions().insert(
            id.clone(),
            SessionEntry {
                generation,
                cancel: cancel.clone(),
                released: released.clone(),
            },
        );
        (generation, cancel, released)
    }

    /// Forget `id`, unless a resumed connection already took it over
    fn unregister(&self, id: &SessionId, generation: u64) {
        let mut sessions = self.sessions();
        if sessions.get(id).is_some_and(|e| e.generation == generation) {
            sessions.remove(id);
        }
    }

    /// Stop a previous connection of the same session and wait until its
    /// public listeners are closed. Returns false for unknown ids.
    async fn take_over(&self, id: &SessionId) -> bool {
        let Some(entry) = self.sessions().remove(id) else {
            return false;
        };
        entry.cancel.cancel();
        if tokio::time::timeout(TAKEOVER_TIMEOUT, entry.released.cancelled())
            .await
            .is_err()
        {
            warn!("Previous connection of {} did not release in time", id);
        }
        true
    }
}

const TAKEOVER_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RelayServer {
    listener: TcpListener,
    shared: Arc<RelayShared>,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            shared: Arc::new(RelayShared {
                config,
                next_tunnel: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept control connections forever
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!("Control connection from {}", peer);

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = session::handle_client(stream, peer, shared).await {
                    warn!("Session from {} ended with error: {}", peer, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_check() {
        let open = RelayConfig::default();
        assert!(open.accepts("anything"));
        assert!(!open.accepts(""));

        let locked = RelayConfig {
            tokens: vec!["secret".to_string()],
            ..RelayConfig::default()
        };
        assert!(locked.accepts("secret"));
        assert!(!locked.accepts("guess"));
    }

    fn shared() -> RelayShared {
        RelayShared {
            config: RelayConfig::default(),
            next_tunnel: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    #[tokio::test]
    async fn test_take_over_waits_for_release() {
        let shared = Arc::new(shared());
        let id = SessionId("sess_a".to_string());
        let (generation, cancel, released) = shared.register(&id);

        // Stand-in for the old session: stop on cancel, then release.
        let old = tokio::spawn(async move {
            cancel.cancelled().await;
            released.cancel();
        });

        assert!(shared.take_over(&id).await);
        old.await.unwrap();
        assert!(shared.sessions().is_empty());

        // The old session's cleanup must not evict whoever took over.
        let _ = shared.register(&id);
        shared.unregister(&id, generation);
        assert!(shared.sessions().contains_key(&id));
    }

    #[tokio::test]
    async fn test_take_over_unknown_session() {
        let shared = shared();
        assert!(!shared.take_over(&SessionId("sess_gone".to_string())).await);
    }

    #[test]
    fn test_public_host_fallback() {
        let mut config = RelayConfig::default();
        assert_eq!(config.public_host(), "127.0.0.1");

        config.public_host = Some("relay.example.com".to_string());
        assert_eq!(config.public_host(), "relay.example.com");
    }
}
