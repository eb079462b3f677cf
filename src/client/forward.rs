use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::{debug, warn};

use super::proxy_proto;
use crate::error::{Result, SluiceError};
use crate::mux::{bridge, TunnelStream};
use crate::protocol::ProxyProto;

/// Where forwarded streams are delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Unix domain socket path
    Pipe(PathBuf),
    /// `host:port`
    Tcp(String),
}

impl FromStr for Destination {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(SluiceError::InvalidDestination(s.to_string()));
            }
            return Ok(Destination::Pipe(PathBuf::from(path)));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Destination::Tcp(s.to_string()))
            }
            _ => Err(SluiceError::InvalidDestination(s.to_string())),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Pipe(path) => write!(f, "unix:{}", path.display()),
            Destination::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

/// Connect `stream` to `dest` and pump bytes until both sides are done.
///
/// A failed local connect resets the stream with the error as reason.
pub async fn forward_stream(
    stream: TunnelStream,
    dest: &Destination,
    proxy: ProxyProto,
) -> Result<()> {
    let header = proxy_header(&stream, proxy);

    match dest {
        Destination::Pipe(path) => match UnixStream::connect(path).await {
            Ok(local) => {
                let (read, write) = local.into_split();
                pump(read, write, stream, header).await
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", dest, e);
                stream.reset(&format!("Connection failed: {}", e)).await;
                Err(e.into())
            }
        },
        Destination::Tcp(addr) => match TcpStream::connect(addr).await {
            Ok(local) => {
                let _ = local.set_nodelay(true);
                let (read, write) = local.into_split();
                pump(read, write, stream, header).await
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", dest, e);
                stream.reset(&format!("Connection failed: {}", e)).await;
                Err(e.into())
            }
        },
    }
}

async fn pump<R, W>(
    read: R,
    mut write: W,
    stream: TunnelStream,
    header: Option<Vec<u8>>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Some(header) = header {
        if let Err(e) = write.write_all(&header).await {
            stream.reset(&format!("PROXY header write failed: {}", e)).await;
            return Err(e.into());
        }
    }

    let id = stream.id();
    let (sent, received) = bridge(read, write, stream).await;
    debug!("Stream {} forwarded {} bytes in, {} bytes out", id, received, sent);
    Ok(())
}

fn proxy_header(stream: &TunnelStream, proxy: ProxyProto) -> Option<Vec<u8>> {
    if proxy == ProxyProto::None {
        return None;
    }

    let source = stream.remote_addr()?.parse::<SocketAddr>();
    let destination = stream.local_addr()?.parse::<SocketAddr>();
    match (source, destination) {
        (Ok(source), Ok(destination)) => proxy_proto::header(proxy, source, destination),
        _ => {
            warn!(
                "Stream {} has unparseable addresses, skipping PROXY header",
                stream.id()
            );
            None
        }
    }
}
