use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{TunnelStream, MAX_FRAME};

/// Pump bytes between a local connection and a stream until both
/// directions are done. Returns `(bytes sent to peer, bytes received)`.
///
/// Local EOF half-closes the stream; a peer close shuts down the local
/// write side. A reset from either end stops both directions.
pub async fn bridge<R, W>(mut local_read: R, mut local_write: W, stream: TunnelStream) -> (u64, u64)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let id = stream.id();
    let (mut reader, mut writer) = stream.into_split();
    let aborted = CancellationToken::new();

    let upstream = async {
        let mut buf = vec![0u8; MAX_FRAME];
        let mut total = 0u64;

        loop {
            let read = tokio::select! {
                read = local_read.read(&mut buf) => read,
                _ = aborted.cancelled() => break,
            };

            match read {
                Ok(0) => {
                    let _ = writer.finish().await;
                    break;
                }
                Ok(n) => {
                    if let Err(e) = writer.send(&buf[..n]).await {
                        debug!("Stream {} send failed: {}", id, e);
                        aborted.cancel();
                        break;
                    }
                    total += n as u64;
                }
                Err(e) => {
                    debug!("Stream {} local read error: {}", id, e);
                    writer.reset(&e.to_string()).await;
                    aborted.cancel();
                    break;
                }
            }
        }

        total
    };

    let downstream = async {
        let mut total = 0u64;

        loop {
            let data = tokio::select! {
                data = reader.recv() => data,
                _ = aborted.cancelled() => break,
            };
            let Some(data) = data else { break };

            if let Err(e) = local_write.write_all(&data).await {
                debug!("Stream {} local write error: {}", id, e);
                reader.reset(&e.to_string()).await;
                aborted.cancel();
                break;
            }
            total += data.len() as u64;
        }

        if reader.is_reset() {
            aborted.cancel();
        }
        let _ = local_write.shutdown().await;
        total
    };

    let (sent, received) = tokio::join!(upstream, downstream);
    debug!(
        "Stream {} finished: {} bytes out, {} bytes in",
        id, sent, received
    );
    (sent, received)
}
