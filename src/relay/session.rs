use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};

use super::RelayShared;
use crate::acl::Acl;
use crate::error::{Result, SluiceError};
use crate::mux::{bridge, Link, Multiplexer};
use crate::protocol::{codes, EndpointOptions, Frame, SessionId, StreamId, TunnelId};
use crate::transport::{spawn_writer, LINK_CAPACITY};

type WsStream = WebSocketStream<TcpStream>;

/// Serve one client control connection until it goes away
pub(super) async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<RelayShared>,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let ws = accept_async(stream).await?;
    let (write, mut read) = ws.split();

    let (link, frames) = mpsc::channel(LINK_CAPACITY);
    let (control, control_rx) = mpsc::channel(16);
    let mut writer = spawn_writer(write, frames, control_rx);

    let cfg = &shared.config;
    let auth = timeout(cfg.auth_timeout, next_frame(&mut read, &control)).await;
    let (token, resume) = match auth {
        Ok(Ok(Some(Frame::Auth {
            token,
            metadata,
            resume,
            client_version,
        }))) => {
            debug!(
                "Auth from {} (client {}, metadata: {:?}, resume: {:?})",
                peer, client_version, metadata, resume
            );
            (token, resume)
        }
        Ok(Ok(Some(other))) => {
            warn!("First frame from {} was not auth: {:?}", peer, other);
            let _ = link
                .send(Frame::error(None, codes::INVALID_REQUEST, "expected auth"))
                .await;
            return close(link, control, writer).await;
        }
        Ok(Ok(None)) => {
            writer.abort();
            return Ok(());
        }
        Ok(Err(e)) => {
            writer.abort();
            return Err(e);
        }
        Err(_) => {
            warn!("No auth from {} within {:?}", peer, cfg.auth_timeout);
            writer.abort();
            return Err(SluiceError::Timeout("client auth"));
        }
    };

    if !cfg.accepts(&token) {
        warn!("Rejected session from {}: invalid authtoken", peer);
        let _ = link
            .send(Frame::error(None, codes::AUTH_FAILED, "invalid authtoken"))
            .await;
        return close(link, control, writer).await;
    }

    // A resumed session gets its id back once the old connection has let
    // go of its public ports, so re-registrations can bind them again.
    let session_id = match resume {
        Some(id) if shared.take_over(&id).await => {
            info!("Session {} resumed from {}", id, peer);
            id
        }
        _ => {
            let id = SessionId(format!("sess_{:016x}", rand::random::<u64>()));
            info!("Session {} authenticated from {}", id, peer);
            id
        }
    };
    let (generation, cancel, released) = shared.register(&session_id);

    if link
        .send(Frame::AuthOk {
            session_id: session_id.clone(),
        })
        .await
        .is_err()
    {
        released.cancel();
        shared.unregister(&session_id, generation);
        writer.abort();
        return Ok(());
    }

    let ctx = SessionCtx {
        shared: shared.clone(),
        mux: Multiplexer::new(link.clone()),
        next_stream: Arc::new(AtomicU64::new(1)),
    };
    let mut tunnels: HashMap<TunnelId, JoinHandle<()>> = HashMap::new();

    let result = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Session {} taken over by a new connection", session_id);
                break Ok(());
            }
            next = timeout(cfg.idle_timeout, read.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                warn!("Session {} idle for {:?}, dropping", session_id, cfg.idle_timeout);
                break Err(SluiceError::Timeout("client heartbeat"));
            }
            Ok(None) => break Ok(()),
            Ok(Some(Err(e))) => break Err(e.into()),
            Ok(Some(Ok(msg))) => msg,
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Ping(data) => {
                let _ = control.send(Message::Pong(data)).await;
                continue;
            }
            Message::Close(_) => break Ok(()),
            _ => continue,
        };

        let frame = match Frame::from_json(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed frame from session {}: {}", session_id, e);
                let _ = link
                    .send(Frame::error(None, codes::INVALID_REQUEST, e.to_string()))
                    .await;
                continue;
            }
        };

        match frame {
            Frame::Listen {
                request_id,
                endpoint,
            } => match ctx.listen(request_id, endpoint).await {
                Ok((tunnel_id, handle)) => {
                    tunnels.insert(tunnel_id, handle);
                }
                Err(reply) => {
                    let _ = link.send(reply).await;
                }
            },

            Frame::Unlisten { tunnel_id } => match tunnels.remove(&tunnel_id) {
                Some(handle) => {
                    handle.abort();
                    let _ = handle.await;
                    info!("Tunnel {} closed by session {}", tunnel_id, session_id);
                }
                None => {
                    let _ = link
                        .send(Frame::error(
                            None,
                            codes::UNKNOWN_TUNNEL,
                            format!("no tunnel {}", tunnel_id),
                        ))
                        .await;
                }
            },

            Frame::Heartbeat { .. } => {
                let _ = link.send(Frame::heartbeat()).await;
            }

            frame @ (Frame::StreamData { .. }
            | Frame::StreamAck { .. }
            | Frame::StreamClose { .. }
            | Frame::StreamReset { .. }) => {
                let stream_id = frame.stream_id();
                if let Err(e) = ctx.mux.dispatch(frame).await {
                    warn!("Session {} stream {:?}: {}", session_id, stream_id, e);
                }
            }

            other => {
                warn!("Unexpected frame from session {}: {:?}", session_id, other);
                let _ = link
                    .send(Frame::error(
                        None,
                        codes::INVALID_REQUEST,
                        "unexpected frame",
                    ))
                    .await;
            }
        }
    };

    // Listeners are closed for good once their tasks are joined.
    for (_, handle) in tunnels.drain() {
        handle.abort();
        let _ = handle.await;
    }
    released.cancel();
    shared.unregister(&session_id, generation);

    ctx.mux.shutdown();
    drop(ctx);
    drop(control);
    drop(link);
    if timeout(Duration::from_secs(1), &mut writer).await.is_err() {
        writer.abort();
    }
    info!("Session {} ended", session_id);

    result
}

struct SessionCtx {
    shared: Arc<RelayShared>,
    mux: Multiplexer,
    next_stream: Arc<AtomicU64>,
}

impl SessionCtx {
    /// Bind a public listener for `endpoint`. On failure the returned
    /// frame is the error reply for the client.
    async fn listen(
        &self,
        request_id: u64,
        endpoint: EndpointOptions,
    ) -> std::result::Result<(TunnelId, JoinHandle<()>), Frame> {
        let cfg = &self.shared.config;
        let reject = |code: &str, message: String| Frame::error(Some(request_id), code, message);

        if !endpoint.proto.eq_ignore_ascii_case("tcp") {
            return Err(reject(
                codes::UNSUPPORTED_PROTO,
                format!("unsupported protocol '{}'", endpoint.proto),
            ));
        }

        let acl = Acl::parse(&endpoint.allow_cidrs, &endpoint.deny_cidrs)
            .map_err(|e| reject(codes::INVALID_REQUEST, e.to_string()))?;

        let bound = match endpoint.remote_addr.as_deref() {
            Some(addr) => TcpListener::bind(addr).await,
            None => TcpListener::bind((cfg.bind_host.as_str(), 0)).await,
        };
        let listener = bound.map_err(|e| {
            reject(
                codes::BIND_FAILED,
                format!(
                    "{}: {}",
                    endpoint.remote_addr.as_deref().unwrap_or(&cfg.bind_host),
                    e
                ),
            )
        })?;
        let local = listener
            .local_addr()
            .map_err(|e| reject(codes::BIND_FAILED, e.to_string()))?;

        let n = self.shared.next_tunnel.fetch_add(1, Ordering::Relaxed);
        let tunnel_id = TunnelId(format!("tun_{}", n));
        let url = format!("tcp://{}:{}", cfg.public_host(), local.port());

        info!(
            "Tunnel {} listening on {} (forwards to: {}, metadata: {:?})",
            tunnel_id,
            local,
            endpoint.forwards_to.as_deref().unwrap_or("-"),
            endpoint.metadata
        );

        // Listening must reach the client before any stream_open for it.
        self.mux
            .link()
            .send(Frame::Listening {
                request_id,
                tunnel_id: tunnel_id.clone(),
                url,
                remote_addr: local.to_string(),
            })
            .await
            .map_err(|_| reject(codes::BIND_FAILED, "session closing".to_string()))?;

        let handle = tokio::spawn(accept_loop(
            listener,
            tunnel_id.clone(),
            acl,
            self.mux.clone(),
            self.next_stream.clone(),
        ));
        Ok((tunnel_id, handle))
    }
}

/// Accept public connections for one tunnel and hand each to the client
async fn accept_loop(
    listener: TcpListener,
    tunnel_id: TunnelId,
    acl: Acl,
    mux: Multiplexer,
    next_stream: Arc<AtomicU64>,
) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Tunnel {} accept error: {}", tunnel_id, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        if !acl.allows(peer.ip()) {
            info!("Tunnel {} refused {}: blocked by CIDR rules", tunnel_id, peer);
            continue;
        }

        let stream_id = StreamId(next_stream.fetch_add(1, Ordering::Relaxed));
        let stream = match mux.open(stream_id) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Tunnel {}: {}", tunnel_id, e);
                continue;
            }
        };

        let open = Frame::StreamOpen {
            stream_id,
            tunnel_id: tunnel_id.clone(),
            remote_addr: peer.to_string(),
            local_addr: local.clone(),
        };
        if mux.link().send(open).await.is_err() {
            break;
        }
        debug!("Stream {} on {} from {}", stream_id, tunnel_id, peer);

        tokio::spawn(async move {
            let _ = tcp.set_nodelay(true);
            let (read, write) = tcp.into_split();
            let (sent, received) = bridge(read, write, stream).await;
            debug!(
                "Stream {} done ({} bytes out, {} bytes in)",
                stream_id, sent, received
            );
        });
    }
}

/// Read frames until the first protocol frame, answering pings meanwhile
async fn next_frame(
    read: &mut SplitStream<WsStream>,
    control: &mpsc::Sender<Message>,
) -> Result<Option<Frame>> {
    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => return Frame::from_json(&text).map(Some),
            Message::Ping(data) => {
                let _ = control.send(Message::Pong(data)).await;
            }
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

/// Flush queued frames, then close the socket
async fn close(
    link: Link,
    control: mpsc::Sender<Message>,
    mut writer: JoinHandle<()>,
) -> Result<()> {
    drop(link);
    drop(control);
    if timeout(Duration::from_secs(1), &mut writer).await.is_err() {
        writer.abort();
    }
    Ok(())
}
