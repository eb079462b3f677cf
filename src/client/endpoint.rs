use std::path::PathBuf;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::forward::{forward_stream, Destination};
use super::session::Session;
use crate::acl::Acl;
use crate::error::Result;
use crate::mux::TunnelStream;
use crate::protocol::{EndpointOptions, ProxyProto, TunnelId};

/// What the relay reported for a registered endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelInfo {
    pub tunnel_id: TunnelId,
    /// Public URL, e.g. `tcp://relay.example.com:20001`
    pub url: String,
    /// Address the relay listener is bound to
    pub remote_addr: String,
}

/// Configures a TCP endpoint before registering it with the relay
#[derive(Debug)]
pub struct TcpEndpointBuilder {
    session: Session,
    options: EndpointOptions,
}

impl TcpEndpointBuilder {
    pub(super) fn new(session: Session) -> Self {
        Self {
            session,
            options: EndpointOptions::tcp(),
        }
    }

    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.options.metadata = Some(metadata.into());
        self
    }

    /// Ask the relay for a specific public address (`host:port`)
    pub fn remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.options.remote_addr = Some(addr.into());
        self
    }

    /// Free-form description of the upstream, shown by the relay
    pub fn forwards_to(mut self, upstream: impl Into<String>) -> Self {
        self.options.forwards_to = Some(upstream.into());
        self
    }

    pub fn proxy_proto(mut self, version: ProxyProto) -> Self {
        self.options.proxy_proto = version;
        self
    }

    pub fn allow_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.options.allow_cidrs.push(cidr.into());
        self
    }

    pub fn deny_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.options.deny_cidrs.push(cidr.into());
        self
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }

    /// Register the endpoint and wait for the relay to bind it
    pub async fn listen(self) -> Result<Tunnel> {
        Acl::parse(&self.options.allow_cidrs, &self.options.deny_cidrs)?;
        self.session.listen(self.options).await
    }
}

/// A registered endpoint. Streams from the relay arrive via [`Tunnel::accept`]
/// or are handed to a [`Destination`] by the `forward*` methods.
///
/// The endpoint survives reconnects; `accept` returns `None` once the
/// endpoint or its session is closed.
pub struct Tunnel {
    session: Session,
    key: u64,
    options: EndpointOptions,
    info: watch::Receiver<TunnelInfo>,
    incoming: mpsc::Receiver<TunnelStream>,
    closed: bool,
}

impl Tunnel {
    pub(super) fn new(
        session: Session,
        key: u64,
        options: EndpointOptions,
        info: watch::Receiver<TunnelInfo>,
        incoming: mpsc::Receiver<TunnelStream>,
    ) -> Self {
        Self {
            session,
            key,
            options,
            info,
            incoming,
            closed: false,
        }
    }

    pub fn id(&self) -> TunnelId {
        self.info.borrow().tunnel_id.clone()
    }

    pub fn url(&self) -> String {
        self.info.borrow().url.clone()
    }

    pub fn remote_addr(&self) -> String {
        self.info.borrow().remote_addr.clone()
    }

    pub fn info(&self) -> TunnelInfo {
        self.info.borrow().clone()
    }

    pub fn metadata(&self) -> Option<&str> {
        self.options.metadata.as_deref()
    }

    pub fn forwards_to(&self) -> Option<&str> {
        self.options.forwards_to.as_deref()
    }

    pub fn proxy_proto(&self) -> ProxyProto {
        self.options.proxy_proto
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn accept(&mut self) -> Option<TunnelStream> {
        self.incoming.recv().await
    }

    /// Forward every incoming stream to `dest` until the endpoint closes
    pub async fn forward(&mut self, dest: Destination) -> Result<()> {
        info!("Forwarding {} -> {}", self.url(), dest);
        let proxy = self.options.proxy_proto;

        while let Some(stream) = self.accept().await {
            let dest = dest.clone();
            tokio::spawn(async move {
                let id = stream.id();
                if let Err(e) = forward_stream(stream, &dest, proxy).await {
                    debug!("Stream {} to {} failed: {}", id, dest, e);
                }
            });
        }

        info!("Endpoint {} closed", self.id());
        Ok(())
    }

    pub async fn forward_pipe(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.forward(Destination::Pipe(path.into())).await
    }

    pub async fn forward_tcp(&mut self, addr: impl Into<String>) -> Result<()> {
        self.forward(Destination::Tcp(addr.into())).await
    }

    /// Unregister from the relay. Streams already accepted keep running.
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        self.session.unlisten(self.key).await
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("info", &*self.info.borrow())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let session = self.session.clone();
            let key = self.key;
            handle.spawn(async move {
                let _ = session.unlisten(key).await;
            });
        }
    }
}
