//! Logical stream carried by a multiplexed session

use bytes::{Buf, Bytes};
use edgeturn_proto::{Frame, StreamId};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing::trace;

use crate::config::MuxConfig;
use crate::session::Shared;

/// Message delivered from the session reader to one stream
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    Fin,
}

/// Why the session reader gave up on a stream
#[derive(Debug)]
pub(crate) enum Undeliverable {
    /// The stream was dropped
    Gone,
    /// The reader took nothing for this long while data was queued
    Stalled(Duration),
    /// Queued bytes would exceed the per-stream limit
    Overflow(usize),
}

/// Bytes queued for a stream and when its reader last made progress
#[derive(Debug)]
struct Backlog {
    bytes: AtomicUsize,
    /// Session clock in milliseconds
    progress_ms: AtomicU64,
}

/// Session-reader end of a stream's inbound queue.
///
/// Pushing never waits, so a stream whose reader stops cannot hold up the
/// session reader.
#[derive(Debug, Clone)]
pub(crate) struct Inlet {
    tx: mpsc::UnboundedSender<Inbound>,
    backlog: Arc<Backlog>,
}

impl Inlet {
    pub(crate) fn push(
        &self,
        msg: Inbound,
        now_ms: u64,
        config: &MuxConfig,
    ) -> Result<(), Undeliverable> {
        if let Inbound::Data(data) = &msg {
            let queued = self.backlog.bytes.load(Ordering::Acquire);
            if queued == 0 {
                self.backlog.progress_ms.store(now_ms, Ordering::Release);
            } else {
                let since = self.backlog.progress_ms.load(Ordering::Acquire);
                let stalled = Duration::from_millis(now_ms.saturating_sub(since));
                if stalled >= config.stream_send_timeout {
                    return Err(Undeliverable::Stalled(stalled));
                }
            }

            let total = queued + data.len();
            if total > config.stream_backlog_limit {
                return Err(Undeliverable::Overflow(total));
            }
            self.backlog.bytes.fetch_add(data.len(), Ordering::AcqRel);
        }

        self.tx.send(msg).map_err(|_| Undeliverable::Gone)
    }
}

/// One logical duplex byte stream of a [`crate::MuxSession`].
///
/// Shutting down the write side sends FIN. Dropping a stream before both
/// directions have finished resets it on the peer.
pub struct MuxStream {
    id: StreamId,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    backlog: Arc<Backlog>,
    pending: Bytes,
    read_done: bool,
    outbound: PollSender<Frame>,
    write_done: bool,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream")
            .field("session_id", &self.shared.session_id)
            .field("id", &self.id)
            .field("read_done", &self.read_done)
            .field("write_done", &self.write_done)
            .finish()
    }
}

impl MuxStream {
    /// A new stream plus the inlet the session reader feeds it through
    pub(crate) fn new(id: StreamId, shared: Arc<Shared>) -> (Self, Inlet) {
        let (tx, inbound) = mpsc::unbounded_channel();
        let backlog = Arc::new(Backlog {
            bytes: AtomicUsize::new(0),
            progress_ms: AtomicU64::new(shared.now_ms()),
        });
        let inlet = Inlet {
            tx,
            backlog: backlog.clone(),
        };

        let stream = Self {
            id,
            inbound,
            backlog,
            pending: Bytes::new(),
            read_done: false,
            outbound: PollSender::new(shared.data_tx.clone()),
            write_done: false,
            shared,
        };
        (stream, inlet)
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    fn closed_error(&self) -> io::Error {
        if self.shared.is_closed() {
            io::Error::new(io::ErrorKind::ConnectionAborted, "multiplexed session closed")
        } else {
            io::Error::new(io::ErrorKind::ConnectionReset, "stream reset by peer")
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.read_done {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.inbound.poll_recv(cx)) {
                Some(Inbound::Data(data)) => {
                    this.backlog
                        .progress_ms
                        .store(this.shared.now_ms(), Ordering::Release);
                    this.backlog.bytes.fetch_sub(data.len(), Ordering::AcqRel);
                    this.pending = data;
                }
                Some(Inbound::Fin) => this.read_done = true,
                None => return Poll::Ready(Err(this.closed_error())),
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_done {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.shared.is_closed() {
            return Poll::Ready(Err(this.closed_error()));
        }

        if ready!(this.outbound.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(this.closed_error()));
        }

        let n = buf.len().min(this.shared.config.max_frame_size.max(1));
        let frame = Frame::data(this.id, Bytes::copy_from_slice(&buf[..n]));
        if this.outbound.send_item(frame).is_err() {
            return Poll::Ready(Err(this.closed_error()));
        }

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the session writer as soon as they are queued
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.write_done {
            return Poll::Ready(Ok(()));
        }

        if ready!(this.outbound.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(this.closed_error()));
        }
        if this.outbound.send_item(Frame::fin(this.id)).is_err() {
            return Poll::Ready(Err(this.closed_error()));
        }

        trace!("[{}] Stream {} finished", this.shared.session_id, this.id);
        this.write_done = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.remove_stream(self.id);
        if !(self.read_done && self.write_done) && !self.shared.is_closed() {
            trace!("[{}] Resetting dropped stream {}", self.shared.session_id, self.id);
            let _ = self.shared.ctrl_tx.send(Frame::rst(self.id));
        }
    }
}
