//! End-to-end tests: a real relay, a client session, and local services on
//! the far side of the tunnel.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use sluice::client::{pipe_name, ConnectionStatus, Session};
use sluice::hello::{HelloServer, HELLO_BODY};
use sluice::protocol::ProxyProto;
use sluice::relay::{RelayConfig, RelayServer};
use sluice::SluiceError;

const TOKEN: &str = "tok_e2e";

async fn start_relay() -> SocketAddr {
    let relay = RelayServer::bind(RelayConfig {
        listen: "127.0.0.1:0".to_string(),
        tokens: vec![TOKEN.to_string()],
        ..RelayConfig::default()
    })
    .await
    .unwrap();
    let addr = relay.local_addr().unwrap();
    tokio::spawn(relay.run());
    addr
}

async fn connect(relay: SocketAddr) -> Session {
    Session::builder()
        .server_addr(format!("ws://{}", relay))
        .authtoken(TOKEN)
        .metadata("e2e")
        .connect_timeout(Duration::from_secs(5))
        .connect()
        .await
        .unwrap()
}

/// TCP forwarder in front of the relay that can go silent on every
/// connection it carries so far while keeping the sockets open.
struct StallingProxy {
    addr: SocketAddr,
    live: Arc<Mutex<Vec<CancellationToken>>>,
}

impl StallingProxy {
    async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let live = Arc::new(Mutex::new(Vec::new()));

        let tracked = live.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let stall = CancellationToken::new();
                tracked.lock().unwrap().push(stall.clone());
                tokio::spawn(async move {
                    let Ok(mut outbound) = TcpStream::connect(target).await else {
                        return;
                    };
                    tokio::select! {
                        _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound) => {}
                        _ = stall.cancelled() => std::future::pending::<()>().await,
                    }
                });
            }
        });

        Self { addr, live }
    }

    fn stall(&self) {
        for token in self.live.lock().unwrap().drain(..) {
            token.cancel();
        }
    }
}

#[tokio::test]
async fn test_hello_through_tunnel() {
    let relay = start_relay().await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.sock");
    let hello = HelloServer::bind(&path).unwrap();
    tokio::spawn(hello.run());

    let session = connect(relay).await;
    assert!(session.id().await.is_some());
    assert_eq!(*session.status().borrow(), ConnectionStatus::Connected);

    let mut tunnel = session
        .tcp_endpoint()
        .metadata("hello endpoint")
        .forwards_to("hello")
        .listen()
        .await
        .unwrap();
    assert!(tunnel.url().starts_with("tcp://127.0.0.1:"));
    assert_eq!(tunnel.metadata(), Some("hello endpoint"));

    let url = format!("http://{}/", tunnel.remote_addr());
    tokio::spawn(async move {
        let _ = tunnel.forward_pipe(path).await;
    });

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/html");
    assert_eq!(response.content_length(), Some(31));
    assert_eq!(response.text().await.unwrap(), HELLO_BODY);

    session.close().await;
}

#[tokio::test]
async fn test_concurrent_requests() {
    let relay = start_relay().await;

    let path = pipe_name();
    let hello = HelloServer::bind(&path).unwrap();
    tokio::spawn(hello.run());

    let session = connect(relay).await;
    let mut tunnel = session.tcp_endpoint().listen().await.unwrap();
    let url = format!("http://{}/", tunnel.remote_addr());
    tokio::spawn(async move {
        let _ = tunnel.forward_pipe(path).await;
    });

    let mut requests = tokio::task::JoinSet::new();
    for i in 0..8 {
        let url = format!("{}page/{}", url, i);
        requests.spawn(async move {
            let client = reqwest::Client::new();
            let response = client.get(&url).send().await.unwrap();
            assert_eq!(response.status(), 200);
            response.text().await.unwrap()
        });
    }

    while let Some(body) = requests.join_next().await {
        assert_eq!(body.unwrap(), HELLO_BODY);
    }

    session.close().await;
}

#[tokio::test]
async fn test_wrong_token_rejected() {
    let relay = start_relay().await;

    let result = Session::builder()
        .server_addr(format!("ws://{}", relay))
        .authtoken("tok_wrong")
        .connect()
        .await;

    assert!(matches!(result, Err(SluiceError::AuthFailed(_))));
}

#[tokio::test]
async fn test_invalid_cidr_rejected_locally() {
    let relay = start_relay().await;
    let session = connect(relay).await;

    let result = session
        .tcp_endpoint()
        .allow_cidr("10.0.0.0/33")
        .listen()
        .await;

    assert!(matches!(result, Err(SluiceError::InvalidCidr(_))));
    session.close().await;
}

#[tokio::test]
async fn test_denied_peer_never_reaches_client() {
    let relay = start_relay().await;
    let session = connect(relay).await;

    let mut tunnel = session
        .tcp_endpoint()
        .deny_cidr("127.0.0.0/8")
        .listen()
        .await
        .unwrap();

    let mut public = TcpStream::connect(tunnel.remote_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let read = timeout(Duration::from_secs(5), public.read(&mut buf))
        .await
        .expect("relay should drop the connection");
    assert!(matches!(read, Ok(0) | Err(_)));

    assert!(timeout(Duration::from_millis(200), tunnel.accept())
        .await
        .is_err());

    session.close().await;
}

#[tokio::test]
async fn test_half_close_over_tunnel() {
    let relay = start_relay().await;
    let session = connect(relay).await;
    let mut tunnel = session.tcp_endpoint().listen().await.unwrap();

    let mut public = TcpStream::connect(tunnel.remote_addr()).await.unwrap();
    public.write_all(b"ping").await.unwrap();
    public.shutdown().await.unwrap();

    let mut stream = timeout(Duration::from_secs(5), tunnel.accept())
        .await
        .unwrap()
        .unwrap();
    assert!(stream.remote_addr().is_some());

    let mut received = Vec::new();
    while let Some(chunk) = stream.recv().await {
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, b"ping");

    // Our direction is still open after the peer finished.
    stream.send(b"pong").await.unwrap();
    stream.finish().await.unwrap();

    let mut reply = Vec::new();
    timeout(Duration::from_secs(5), public.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, b"pong");

    session.close().await;
}

#[tokio::test]
async fn test_proxy_header_reaches_upstream() {
    let relay = start_relay().await;

    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let session = connect(relay).await;
    let mut tunnel = session
        .tcp_endpoint()
        .proxy_proto(ProxyProto::V1)
        .listen()
        .await
        .unwrap();
    let public_addr = tunnel.remote_addr();
    tokio::spawn(async move {
        let _ = tunnel.forward_tcp(upstream_addr.to_string()).await;
    });

    let mut public = TcpStream::connect(&public_addr).await.unwrap();
    let client_addr = public.local_addr().unwrap();
    public.write_all(b"payload").await.unwrap();

    let (conn, _) = timeout(Duration::from_secs(5), upstream.accept())
        .await
        .unwrap()
        .unwrap();
    let mut conn = BufReader::new(conn);

    let mut header = String::new();
    conn.read_line(&mut header).await.unwrap();
    assert_eq!(
        header,
        format!(
            "PROXY TCP4 127.0.0.1 127.0.0.1 {} {}\r\n",
            client_addr.port(),
            public_addr.rsplit_once(':').unwrap().1
        )
    );

    let mut payload = [0u8; 7];
    conn.read_exact(&mut payload).await.unwrap();
    assert_eq!(&payload, b"payload");

    session.close().await;
}

#[tokio::test]
async fn test_closed_endpoint_stops_accepting() {
    let relay = start_relay().await;
    let session = connect(relay).await;

    let tunnel = session.tcp_endpoint().listen().await.unwrap();
    let public_addr = tunnel.remote_addr();
    tunnel.close().await.unwrap();

    let mut refused = false;
    for _ in 0..50 {
        if TcpStream::connect(&public_addr).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(refused, "listener should be gone after close");

    session.close().await;
}

#[tokio::test]
async fn test_session_close_reports_disconnected() {
    let relay = start_relay().await;
    let session = connect(relay).await;
    let status = session.status();

    session.close().await;

    assert!(matches!(
        *status.borrow(),
        ConnectionStatus::Disconnected { .. }
    ));
}

#[tokio::test]
async fn test_endpoint_survives_stalled_connection() {
    let relay = start_relay().await;
    let proxy = StallingProxy::start(relay).await;

    let session = Session::builder()
        .server_addr(format!("ws://{}", proxy.addr))
        .authtoken(TOKEN)
        .heartbeat_interval(Duration::from_millis(100))
        .connect()
        .await
        .unwrap();
    let session_id = session.id().await;
    let mut status = session.status();

    let mut tunnel = session.tcp_endpoint().listen().await.unwrap();
    let first_tunnel = tunnel.id();
    let public_addr = tunnel.remote_addr();

    // The relay still holds the old connection and its listener.
    proxy.stall();

    let reconnecting = timeout(
        Duration::from_secs(5),
        status.wait_for(|s| matches!(s, ConnectionStatus::Reconnecting { .. })),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    match reconnecting {
        ConnectionStatus::Reconnecting {
            attempt,
            reason,
            next_retry_secs,
        } => {
            assert_eq!(attempt, 1);
            assert_eq!(next_retry_secs, 1);
            assert!(reason.contains("heartbeat"), "reason: {}", reason);
        }
        other => panic!("unexpected status {:?}", other),
    }

    for _ in 0..200 {
        if tunnel.id() != first_tunnel {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_ne!(tunnel.id(), first_tunnel, "endpoint was not re-registered");
    assert!(session.status().borrow().is_connected());
    assert_eq!(session.id().await, session_id);
    assert_eq!(tunnel.remote_addr(), public_addr);

    let mut public = TcpStream::connect(&public_addr).await.unwrap();
    public.write_all(b"still here").await.unwrap();

    let mut stream = timeout(Duration::from_secs(5), tunnel.accept())
        .await
        .unwrap()
        .expect("endpoint should still accept after reconnecting");
    assert_eq!(stream.recv().await.unwrap(), b"still here".to_vec());

    session.close().await;
}
