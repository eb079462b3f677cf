use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use super::{Multiplexer, StreamShared, MAX_FRAME};
use crate::error::{Result, SluiceError};
use crate::protocol::{Frame, StreamId};

/// One logical connection carried over the control connection.
///
/// Addresses are filled in for streams announced by the relay and are empty
/// on the relay side.
pub struct TunnelStream {
    reader: StreamReader,
    writer: StreamWriter,
    remote_addr: Option<String>,
    local_addr: Option<String>,
}

impl TunnelStream {
    pub(super) fn new(
        id: StreamId,
        mux: Multiplexer,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        credit: Arc<Semaphore>,
        shared: Arc<StreamShared>,
    ) -> Self {
        let max_chunk = MAX_FRAME.min(mux.inner.window as usize);
        Self {
            reader: StreamReader {
                id,
                mux: mux.clone(),
                inbound,
                shared: shared.clone(),
                unacked: 0,
                eof: false,
            },
            writer: StreamWriter {
                id,
                mux,
                credit,
                shared,
                max_chunk,
                finished: false,
            },
            remote_addr: None,
            local_addr: None,
        }
    }

    pub fn with_addrs(mut self, remote_addr: &str, local_addr: &str) -> Self {
        self.remote_addr = Some(remote_addr.to_string());
        self.local_addr = Some(local_addr.to_string());
        self
    }

    pub fn id(&self) -> StreamId {
        self.reader.id
    }

    /// Address of the public peer as seen by the relay
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Relay listener address the peer connected to
    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }

    pub fn is_reset(&self) -> bool {
        self.reader.is_reset()
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.reader.recv().await
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.writer.send(data).await
    }

    pub async fn finish(&mut self) -> Result<()> {
        self.writer.finish().await
    }

    pub async fn reset(mut self, reason: &str) {
        self.writer.reset(reason).await;
        self.reader.eof = true;
    }

    pub fn into_split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream")
            .field("id", &self.reader.id)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Inbound half of a stream
pub struct StreamReader {
    id: StreamId,
    mux: Multiplexer,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<StreamShared>,
    unacked: u32,
    eof: bool,
}

impl StreamReader {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn is_reset(&self) -> bool {
        self.shared.reset.load(Ordering::Acquire)
    }

    /// Next chunk from the peer, `None` once the peer closed or the stream
    /// was reset. Credit for the previous chunk is returned first.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        if self.eof {
            return None;
        }

        if self.unacked > 0 {
            let bytes = std::mem::take(&mut self.unacked);
            self.shared.pending.fetch_sub(bytes, Ordering::AcqRel);
            if !self.is_reset() {
                let _ = self
                    .mux
                    .send(Frame::StreamAck {
                        stream_id: self.id,
                        bytes,
                    })
                    .await;
            }
        }

        match self.inbound.recv().await {
            Some(data) => {
                self.unacked = data.len() as u32;
                Some(data)
            }
            None => {
                self.eof = true;
                None
            }
        }
    }

    /// Abort the whole stream from the read side
    pub async fn reset(&mut self, reason: &str) {
        self.eof = true;
        if self.mux.abort(self.id) {
            debug!("Stream {} reset: {}", self.id, reason);
            self.mux.send(Frame::stream_reset(self.id, reason)).await;
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        if !self.eof {
            reset_on_drop(&self.mux, self.id);
        }
    }
}

/// Outbound half of a stream
pub struct StreamWriter {
    id: StreamId,
    mux: Multiplexer,
    credit: Arc<Semaphore>,
    shared: Arc<StreamShared>,
    max_chunk: usize,
    finished: bool,
}

impl StreamWriter {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn is_reset(&self) -> bool {
        self.shared.reset.load(Ordering::Acquire)
    }

    /// Send bytes to the peer, waiting for credit as needed
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(SluiceError::StreamClosed(self.id));
        }

        for chunk in data.chunks(self.max_chunk) {
            self.credit
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| SluiceError::StreamClosed(self.id))?
                .forget();
            self.shared
                .in_flight
                .fetch_add(chunk.len() as u32, Ordering::AcqRel);

            if !self.mux.send(Frame::stream_data(self.id, chunk)).await {
                return Err(SluiceError::StreamClosed(self.id));
            }
        }

        Ok(())
    }

    /// Close our direction. The peer may keep sending.
    pub async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if !self.mux.finish_local(self.id) {
            return Err(SluiceError::StreamClosed(self.id));
        }
        if !self.mux.send(Frame::stream_close(self.id, "closed")).await {
            return Err(SluiceError::StreamClosed(self.id));
        }
        Ok(())
    }

    /// Abort the whole stream from the write side
    pub async fn reset(&mut self, reason: &str) {
        self.finished = true;
        if self.mux.abort(self.id) {
            debug!("Stream {} reset: {}", self.id, reason);
            self.mux.send(Frame::stream_reset(self.id, reason)).await;
        }
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.finished {
            reset_on_drop(&self.mux, self.id);
        }
    }
}

fn reset_on_drop(mux: &Multiplexer, id: StreamId) {
    if !mux.abort(id) {
        return;
    }

    let frame = Frame::stream_reset(id, "dropped");
    match mux.link().try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(frame)) => {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let link = mux.link().clone();
                handle.spawn(async move {
                    let _ = link.send(frame).await;
                });
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}
