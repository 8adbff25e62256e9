//! Push-to-pull bridge between transcoder output and the playback sink.
//!
//! The writer half accepts chunks on the producer's schedule; the reader half
//! yields them on the consumer's schedule. Buffering is unbounded: a slow
//! reader never causes chunk loss or reordering.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// Output sample rate of the relay stream in Hz.
pub const PCM_SAMPLE_RATE: u32 = 48_000;

/// Interleaved channel count of the relay stream.
pub const PCM_CHANNELS: u16 = 2;

/// Bytes per interleaved frame (16-bit samples × channels).
pub const PCM_FRAME_BYTES: usize = 2 * PCM_CHANNELS as usize;

/// Create a connected writer/reader pair.
pub fn relay_channel() -> (RelayWriter, RelayReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        RelayWriter {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        RelayReader { rx, pending: None },
    )
}

/// Push side of the relay stream.
///
/// Clones share one end-of-stream flag: [`end`](Self::end) on any clone ends
/// the stream for all of them. Dropping every clone also ends it.
#[derive(Clone)]
pub struct RelayWriter {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>,
}

impl RelayWriter {
    /// Append a chunk.
    ///
    /// Returns `false` if the stream has ended or the reader is gone; the
    /// chunk is dropped in that case.
    pub fn push(&self, chunk: Bytes) -> bool {
        if chunk.is_empty() {
            return !self.is_ended();
        }
        let Ok(guard) = self.tx.lock() else {
            return false;
        };
        match guard.as_ref() {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }

    /// Mark that no further chunks will arrive. Idempotent.
    pub fn end(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }

    /// Returns `true` once ended or once the reader has been dropped.
    pub fn is_ended(&self) -> bool {
        match self.tx.lock() {
            Ok(guard) => guard.as_ref().is_none_or(mpsc::UnboundedSender::is_closed),
            Err(_) => true,
        }
    }
}

/// Pull side of the relay stream.
///
/// Usable as a chunk source ([`recv`](Self::recv), [`Stream`]) or as a byte
/// source ([`AsyncRead`]). Mixing the two is allowed; a partially read chunk
/// is resumed by either.
#[derive(Debug)]
pub struct RelayReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Option<Bytes>,
}

impl RelayReader {
    /// Next chunk in write order, or `None` after end once the buffer is drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        if let Some(chunk) = self.pending.take() {
            return Some(chunk);
        }
        self.rx.recv().await
    }

    /// Next chunk if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        if let Some(chunk) = self.pending.take() {
            return Some(chunk);
        }
        self.rx.try_recv().ok()
    }

    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        if let Some(chunk) = self.pending.take() {
            return Poll::Ready(Some(chunk));
        }
        self.rx.poll_recv(cx)
    }
}

impl Stream for RelayReader {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.get_mut().poll_chunk(cx)
    }
}

impl AsyncRead for RelayReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let Some(mut chunk) = ready!(this.poll_chunk(cx)) else {
            // End of stream: zero bytes filled.
            return Poll::Ready(Ok(()));
        };
        let n = chunk.len().min(buf.remaining());
        buf.put_slice(&chunk.split_to(n));
        if !chunk.is_empty() {
            this.pending = Some(chunk);
        }
        Poll::Ready(Ok(()))
    }
}
