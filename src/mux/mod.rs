//! Stream multiplexer for a single control connection.
//!
//! Every public connection accepted by the relay becomes a logical stream
//! identified by a [`StreamId`]. Both peers keep one [`Multiplexer`] per
//! control connection; it routes inbound stream frames to the matching
//! [`TunnelStream`] and enforces credit based flow control:
//!
//! - each direction starts with `window` bytes of credit
//! - a writer must hold credit for every byte it puts on the link
//! - the reader hands credit back with `stream_ack` once the consumer asks
//!   for the next chunk
//!
//! Inbound frames never block the connection reader. A peer that sends past
//! its window gets the stream reset.

mod bridge;
mod stream;

pub use bridge::bridge;
pub use stream::{StreamReader, StreamWriter, TunnelStream};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use crate::error::{Result, SluiceError};
use crate::protocol::{decode_data, Frame, StreamId};

/// Initial per-direction credit of a stream
pub const DEFAULT_WINDOW: u32 = 256 * 1024;

/// Largest payload carried by one `stream_data` frame
pub const MAX_FRAME: usize = 16 * 1024;

/// Outbound half of a control connection
pub type Link = mpsc::Sender<Frame>;

/// State shared between a slot and the stream halves
#[derive(Default)]
struct StreamShared {
    reset: AtomicBool,
    /// Bytes delivered to the reader queue and not yet acked
    pending: AtomicU32,
    /// Bytes sent to the peer and not yet acked by it
    in_flight: AtomicU32,
}

struct StreamSlot {
    /// Dropped once the peer closed its direction
    inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    credit: Arc<Semaphore>,
    shared: Arc<StreamShared>,
    local_closed: bool,
}

impl StreamSlot {
    fn abort(self) {
        self.shared.reset.store(true, Ordering::Release);
        self.credit.close();
    }
}

struct MuxInner {
    link: Link,
    window: u32,
    streams: Mutex<HashMap<StreamId, StreamSlot>>,
}

#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("window", &self.inner.window)
            .field("streams", &self.len())
            .finish()
    }
}

impl Multiplexer {
    pub fn new(link: Link) -> Self {
        Self::with_window(link, DEFAULT_WINDOW)
    }

    pub fn with_window(link: Link, window: u32) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                link,
                window: window.max(1),
                streams: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn link(&self) -> &Link {
        &self.inner.link
    }

    /// Number of streams with at least one open direction
    pub fn len(&self) -> usize {
        self.streams().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new stream and return its handle
    pub fn open(&self, stream_id: StreamId) -> Result<TunnelStream> {
        let mut streams = self.streams();
        if streams.contains_key(&stream_id) {
            return Err(SluiceError::DuplicateStream(stream_id));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let credit = Arc::new(Semaphore::new(self.inner.window as usize));
        let shared = Arc::new(StreamShared::default());

        streams.insert(
            stream_id,
            StreamSlot {
                inbound: Some(inbound_tx),
                credit: credit.clone(),
                shared: shared.clone(),
                local_closed: false,
            },
        );
        drop(streams);

        debug!("Stream {} opened", stream_id);
        Ok(TunnelStream::new(
            stream_id,
            self.clone(),
            inbound_rx,
            credit,
            shared,
        ))
    }

    /// Route an inbound stream frame.
    ///
    /// Frames for streams that are already gone are dropped silently; they
    /// are expected after a reset races with data in flight.
    pub async fn dispatch(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::StreamData { stream_id, data } => {
                let data = decode_data(&data)?;
                let violation = {
                    let mut streams = self.streams();
                    let verdict = match streams.get(&stream_id) {
                        None => {
                            debug!("Data for unknown stream {} ({} bytes)", stream_id, data.len());
                            None
                        }
                        Some(slot) => match &slot.inbound {
                            None => Some("data after close"),
                            Some(tx) => {
                                let len = data.len() as u32;
                                let pending = slot.shared.pending.load(Ordering::Acquire);
                                if pending.saturating_add(len) > self.inner.window {
                                    Some("flow control violation")
                                } else {
                                    slot.shared.pending.fetch_add(len, Ordering::AcqRel);
                                    // Reader may be gone mid-reset, nothing to deliver then.
                                    let _ = tx.send(data);
                                    None
                                }
                            }
                        },
                    };
                    if verdict.is_some() {
                        if let Some(slot) = streams.remove(&stream_id) {
                            slot.abort();
                        }
                    }
                    verdict
                };

                if let Some(reason) = violation {
                    warn!("Resetting stream {}: {}", stream_id, reason);
                    self.send(Frame::stream_reset(stream_id, reason)).await;
                }
            }

            Frame::StreamAck { stream_id, bytes } => {
                let overrun = {
                    let mut streams = self.streams();
                    let overrun = match streams.get(&stream_id) {
                        None => false,
                        Some(slot) => {
                            let acked = slot.shared.in_flight.fetch_update(
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                |in_flight| in_flight.checked_sub(bytes),
                            );
                            match acked {
                                Ok(_) => {
                                    slot.credit.add_permits(bytes as usize);
                                    false
                                }
                                Err(_) => true,
                            }
                        }
                    };
                    if overrun {
                        if let Some(slot) = streams.remove(&stream_id) {
                            slot.abort();
                        }
                    }
                    overrun
                };

                if overrun {
                    warn!("Resetting stream {}: ack for more than was sent", stream_id);
                    self.send(Frame::stream_reset(stream_id, "flow control violation"))
                        .await;
                }
            }

            Frame::StreamClose { stream_id, reason } => {
                debug!("Stream {} closed by peer: {}", stream_id, reason);
                let mut streams = self.streams();
                if let Some(slot) = streams.get_mut(&stream_id) {
                    slot.inbound = None;
                    if slot.local_closed {
                        streams.remove(&stream_id);
                    }
                }
            }

            Frame::StreamReset { stream_id, reason } => {
                debug!("Stream {} reset by peer: {}", stream_id, reason);
                if let Some(slot) = self.streams().remove(&stream_id) {
                    slot.abort();
                }
            }

            other => {
                return Err(SluiceError::Protocol(format!(
                    "not a stream frame: {:?}",
                    other
                )));
            }
        }

        Ok(())
    }

    /// Reset every stream. Called when the control connection is gone.
    pub fn shutdown(&self) {
        let slots: Vec<StreamSlot> = self.streams().drain().map(|(_, slot)| slot).collect();
        if !slots.is_empty() {
            debug!("Resetting {} streams on shutdown", slots.len());
        }
        for slot in slots {
            slot.abort();
        }
    }

    /// Mark our direction finished. Returns false if the stream is gone.
    fn finish_local(&self, stream_id: StreamId) -> bool {
        let mut streams = self.streams();
        match streams.get_mut(&stream_id) {
            None => false,
            Some(slot) => {
                slot.local_closed = true;
                if slot.inbound.is_none() {
                    streams.remove(&stream_id);
                }
                true
            }
        }
    }

    /// Drop the stream locally. Returns false if it was already gone.
    fn abort(&self, stream_id: StreamId) -> bool {
        match self.streams().remove(&stream_id) {
            Some(slot) => {
                slot.abort();
                true
            }
            None => false,
        }
    }

    async fn send(&self, frame: Frame) -> bool {
        self.inner.link.send(frame).await.is_ok()
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<StreamId, StreamSlot>> {
        // A poisoned map only means another stream task panicked mid-update.
        self.inner
            .streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn mux(window: u32) -> (Multiplexer, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(64);
        (Multiplexer::with_window(tx, window), rx)
    }

    #[tokio::test]
    async fn test_data_reaches_reader() {
        let (mux, _rx) = mux(DEFAULT_WINDOW);
        let mut stream = mux.open(StreamId(1)).unwrap();

        mux.dispatch(Frame::stream_data(StreamId(1), b"hello"))
            .await
            .unwrap();

        assert_eq!(stream.recv().await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_duplicate_stream_rejected() {
        let (mux, _rx) = mux(DEFAULT_WINDOW);
        let _stream = mux.open(StreamId(1)).unwrap();

        assert!(matches!(
            mux.open(StreamId(1)),
            Err(SluiceError::DuplicateStream(StreamId(1)))
        ));
    }

    #[tokio::test]
    async fn test_writer_waits_for_credit() {
        let (mux, mut rx) = mux(4);
        let mut stream = mux.open(StreamId(1)).unwrap();

        stream.send(b"abcd").await.unwrap();
        assert!(matches!(rx.recv().await, Some(Frame::StreamData { .. })));

        // No credit left: the next send parks until the peer acks.
        let blocked = timeout(Duration::from_millis(50), stream.send(b"e")).await;
        assert!(blocked.is_err());

        mux.dispatch(Frame::StreamAck {
            stream_id: StreamId(1),
            bytes: 4,
        })
        .await
        .unwrap();

        timeout(Duration::from_secs(1), stream.send(b"e"))
            .await
            .expect("credit should be restored")
            .unwrap();
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let (mux, mut rx) = mux(DEFAULT_WINDOW);
        let mut stream = mux.open(StreamId(9)).unwrap();

        stream.send(&vec![7u8; MAX_FRAME + 10]).await.unwrap();

        let mut sizes = Vec::new();
        for _ in 0..2 {
            match rx.recv().await {
                Some(Frame::StreamData { data, .. }) => sizes.push(decode_data(&data).unwrap().len()),
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(sizes, vec![MAX_FRAME, 10]);
    }

    #[tokio::test]
    async fn test_reader_acks_consumed_data() {
        let (mux, mut rx) = mux(DEFAULT_WINDOW);
        let mut stream = mux.open(StreamId(2)).unwrap();

        mux.dispatch(Frame::stream_data(StreamId(2), b"one"))
            .await
            .unwrap();
        mux.dispatch(Frame::stream_data(StreamId(2), b"two"))
            .await
            .unwrap();

        assert_eq!(stream.recv().await.unwrap(), b"one".to_vec());
        assert_eq!(stream.recv().await.unwrap(), b"two".to_vec());

        assert_eq!(
            rx.recv().await,
            Some(Frame::StreamAck {
                stream_id: StreamId(2),
                bytes: 3
            })
        );
    }

    #[tokio::test]
    async fn test_window_overrun_resets_stream() {
        let (mux, mut rx) = mux(4);
        let mut stream = mux.open(StreamId(1)).unwrap();

        mux.dispatch(Frame::stream_data(StreamId(1), b"abcde"))
            .await
            .unwrap();

        match rx.recv().await {
            Some(Frame::StreamReset { stream_id, reason }) => {
                assert_eq!(stream_id, StreamId(1));
                assert_eq!(reason, "flow control violation");
            }
            other => panic!("expected reset, got {:?}", other),
        }
        assert!(stream.recv().await.is_none());
        assert!(stream.send(b"x").await.is_err());
        assert!(mux.is_empty());
    }

    #[tokio::test]
    async fn test_over_ack_resets_stream() {
        let (mux, mut rx) = mux(DEFAULT_WINDOW);
        let mut stream = mux.open(StreamId(3)).unwrap();

        stream.send(b"abc").await.unwrap();
        assert!(matches!(rx.recv().await, Some(Frame::StreamData { .. })));

        mux.dispatch(Frame::StreamAck {
            stream_id: StreamId(3),
            bytes: 4,
        })
        .await
        .unwrap();

        match rx.recv().await {
            Some(Frame::StreamReset { stream_id, reason }) => {
                assert_eq!(stream_id, StreamId(3));
                assert_eq!(reason, "flow control violation");
            }
            other => panic!("expected reset, got {:?}", other),
        }
        assert!(stream.send(b"x").await.is_err());
        assert!(mux.is_empty());
    }

    #[tokio::test]
    async fn test_ack_before_any_data_resets_stream() {
        let (mux, mut rx) = mux(DEFAULT_WINDOW);
        let _stream = mux.open(StreamId(8)).unwrap();

        mux.dispatch(Frame::StreamAck {
            stream_id: StreamId(8),
            bytes: 1,
        })
        .await
        .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(Frame::StreamReset { stream_id: StreamId(8), .. })
        ));
    }

    #[tokio::test]
    async fn test_half_close_keeps_write_side() {
        let (mux, mut rx) = mux(DEFAULT_WINDOW);
        let mut stream = mux.open(StreamId(5)).unwrap();

        mux.dispatch(Frame::stream_close(StreamId(5), "closed"))
            .await
            .unwrap();
        assert!(stream.recv().await.is_none());

        stream.send(b"late reply").await.unwrap();
        assert!(matches!(rx.recv().await, Some(Frame::StreamData { .. })));

        stream.finish().await.unwrap();
        assert!(matches!(rx.recv().await, Some(Frame::StreamClose { .. })));
        assert!(mux.is_empty());
    }

    #[tokio::test]
    async fn test_drop_unfinished_stream_resets() {
        let (mux, mut rx) = mux(DEFAULT_WINDOW);
        let stream = mux.open(StreamId(4)).unwrap();
        drop(stream);

        match timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
            Some(Frame::StreamReset { stream_id, .. }) => assert_eq!(stream_id, StreamId(4)),
            other => panic!("expected reset, got {:?}", other),
        }
        assert!(mux.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_resets_everything() {
        let (mux, _rx) = mux(DEFAULT_WINDOW);
        let mut a = mux.open(StreamId(1)).unwrap();
        let mut b = mux.open(StreamId(2)).unwrap();

        mux.shutdown();

        assert!(a.recv().await.is_none());
        assert!(b.send(b"x").await.is_err());
        assert!(a.is_reset());
        assert!(mux.is_empty());
    }

    #[tokio::test]
    async fn test_non_stream_frame_rejected() {
        let (mux, _rx) = mux(DEFAULT_WINDOW);
        assert!(mux.dispatch(Frame::heartbeat()).await.is_err());
    }
}
