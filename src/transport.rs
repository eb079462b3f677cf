//! WebSocket plumbing shared by client and relay.

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{debug, error};

use crate::protocol::Frame;

/// Frames queued per connection before senders start waiting
pub const LINK_CAPACITY: usize = 256;

/// Single writer for a WebSocket sink. Protocol frames and raw control
/// messages (pongs) are merged here; the sink is closed once both
/// channels are gone.
pub fn spawn_writer<S>(
    mut write: SplitSink<WebSocketStream<S>, Message>,
    mut frames: mpsc::Receiver<Frame>,
    mut control: mpsc::Receiver<Message>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                Some(msg) = control.recv() => msg,
                Some(frame) = frames.recv() => match frame.to_json() {
                    Ok(json) => Message::Text(json),
                    Err(e) => {
                        error!("Failed to encode frame: {}", e);
                        continue;
                    }
                },
                else => break,
            };

            if let Err(e) = write.send(msg).await {
                debug!("Send error (connection closing): {}", e);
                break;
            }
        }
        let _ = write.close().await;
    })
}
