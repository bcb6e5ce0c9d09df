//! Multiplexed session over a single reliable byte stream

use bytes::Bytes;
use dashmap::DashMap;
use edgeturn_proto::{Frame, FrameCodec, FrameType, StreamId};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{MuxConfig, MuxRole};
use crate::stream::{Inbound, Inlet, MuxStream, Undeliverable};

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Multiplexed session is closed")]
    SessionClosed,

    #[error("Too many open streams (limit {0})")]
    TooManyStreams(usize),

    #[error("No available stream IDs")]
    StreamIdsExhausted,
}

/// State shared between the session handle, its streams and the driver task
pub(crate) struct Shared {
    pub(crate) session_id: String,
    pub(crate) role: MuxRole,
    pub(crate) config: MuxConfig,
    pub(crate) streams: DashMap<StreamId, Inlet>,
    next_stream_id: AtomicU32,
    pub(crate) shutdown: CancellationToken,
    close_reason: OnceLock<String>,
    pub(crate) data_tx: mpsc::Sender<Frame>,
    pub(crate) ctrl_tx: mpsc::UnboundedSender<Frame>,
    epoch: Instant,
    last_seen_ms: AtomicU64,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Milliseconds since the session was created
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch(&self) {
        self.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last_seen = self.last_seen_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last_seen))
    }

    /// Record why the session ended and cancel everything derived from it
    fn close(&self, reason: impl Into<String>) {
        let _ = self.close_reason.set(reason.into());
        self.shutdown.cancel();
    }

    /// Final teardown once the driver is gone: dropping every stream's
    /// sender fails their pending and future reads.
    fn terminate(&self, reason: String) {
        self.close(reason);
        self.streams.clear();
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        self.streams.remove(&id);
    }
}

/// Handle to a multiplexed session.
///
/// Cheap to clone; every clone refers to the same physical connection.
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<Shared>,
    accept_rx: Arc<Mutex<mpsc::Receiver<MuxStream>>>,
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("session_id", &self.shared.session_id)
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MuxSession {
    /// Wrap `io` in a multiplexing layer.
    ///
    /// Nothing is read or written until the returned [`MuxDriver`] is spawned.
    pub fn new<T>(io: T, role: MuxRole, config: MuxConfig) -> (MuxSession, MuxDriver<T>)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session_id = format!("mux-{}", uuid::Uuid::new_v4());

        let (data_tx, data_rx) = mpsc::channel(config.outbound_buffer.max(1));
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));

        let shared = Arc::new(Shared {
            session_id,
            role,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            config,
            streams: DashMap::new(),
            shutdown: CancellationToken::new(),
            close_reason: OnceLock::new(),
            data_tx,
            ctrl_tx,
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        });

        let session = MuxSession {
            shared: shared.clone(),
            accept_rx: Arc::new(Mutex::new(accept_rx)),
        };

        let driver = MuxDriver {
            io,
            shared,
            data_rx,
            ctrl_rx,
            accept_tx,
        };

        (session, driver)
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn role(&self) -> MuxRole {
        self.shared.role
    }

    /// Open a new logical stream to the peer
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        if shared.streams.len() >= shared.config.max_streams {
            return Err(MuxError::TooManyStreams(shared.config.max_streams));
        }

        let id = shared.next_stream_id.fetch_add(2, Ordering::SeqCst);
        if id > u32::MAX - 2 {
            return Err(MuxError::StreamIdsExhausted);
        }

        let (stream, inlet) = MuxStream::new(id, shared.clone());
        shared.streams.insert(id, inlet);

        // Teardown cancels before clearing the map, so an insert that raced
        // with it is caught here.
        if shared.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        shared
            .data_tx
            .send(Frame::open(id))
            .await
            .map_err(|_| MuxError::SessionClosed)?;

        debug!("[{}] Opened stream {}", shared.session_id, id);
        Ok(stream)
    }

    /// Wait for the next stream opened by the peer
    pub async fn accept_stream(&self) -> Result<MuxStream, MuxError> {
        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            stream = accept_rx.recv() => stream.ok_or(MuxError::SessionClosed),
            _ = self.shared.shutdown.cancelled() => Err(MuxError::SessionClosed),
        }
    }

    /// Close the session and every stream on it. Idempotent.
    pub fn close(&self, reason: &str) {
        if !self.shared.is_closed() {
            debug!("[{}] Closing session: {}", self.shared.session_id, reason);
        }
        self.shared.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the session is closed for any reason
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    /// Why the session closed, if it has
    pub fn close_reason(&self) -> Option<String> {
        self.shared.close_reason.get().cloned()
    }

    /// Number of streams currently registered on this session
    pub fn active_streams(&self) -> usize {
        self.shared.streams.len()
    }
}

/// Task that owns the physical connection of a [`MuxSession`]
pub struct MuxDriver<T> {
    io: T,
    shared: Arc<Shared>,
    data_rx: mpsc::Receiver<Frame>,
    ctrl_rx: mpsc::UnboundedReceiver<Frame>,
    accept_tx: mpsc::Sender<MuxStream>,
}

impl<T> MuxDriver<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run(None))
    }

    /// Spawn the driver, writing `preamble` verbatim before the first frame
    pub fn spawn_with_preamble(self, preamble: Bytes) -> JoinHandle<()> {
        tokio::spawn(self.run(Some(preamble)))
    }

    /// Service the connection until it fails or the session is closed
    pub async fn run(self, preamble: Option<Bytes>) {
        let MuxDriver {
            io,
            shared,
            data_rx,
            ctrl_rx,
            accept_tx,
        } = self;

        shared.touch();
        let reason = drive(io, &shared, data_rx, ctrl_rx, accept_tx, preamble).await;

        debug!("[{}] Session driver ended: {}", shared.session_id, reason);
        shared.terminate(reason);
    }
}

async fn drive<T>(
    io: T,
    shared: &Arc<Shared>,
    data_rx: mpsc::Receiver<Frame>,
    ctrl_rx: mpsc::UnboundedReceiver<Frame>,
    accept_tx: mpsc::Sender<MuxStream>,
    preamble: Option<Bytes>,
) -> String
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(io);

    if let Some(preamble) = preamble {
        let written = async {
            write_half.write_all(&preamble).await?;
            write_half.flush().await
        };
        if let Err(e) = written.await {
            return format!("preamble write failed: {}", e);
        }
    }

    let frames_in = FramedRead::new(read_half, FrameCodec::new());
    let frames_out = FramedWrite::new(write_half, FrameCodec::new());

    tokio::select! {
        reason = read_loop(shared, frames_in, accept_tx) => reason,
        reason = write_loop(frames_out, data_rx, ctrl_rx) => reason,
        reason = keepalive_loop(shared) => reason,
        _ = shared.shutdown.cancelled() => shared
            .close_reason
            .get()
            .cloned()
            .unwrap_or_else(|| "closed locally".to_string()),
    }
}

async fn read_loop<T>(
    shared: &Arc<Shared>,
    mut frames: FramedRead<ReadHalf<T>, FrameCodec>,
    accept_tx: mpsc::Sender<MuxStream>,
) -> String
where
    T: AsyncRead + AsyncWrite,
{
    let session_id = &shared.session_id;

    loop {
        let frame = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return format!("read error: {}", e),
            None => return "peer closed connection".to_string(),
        };
        shared.touch();

        trace!(
            "[{}] Received frame: stream={}, type={:?}, len={}",
            session_id,
            frame.stream_id,
            frame.frame_type,
            frame.payload.len()
        );

        match frame.frame_type {
            FrameType::Ping => {
                if !frame.flags.has_ack() {
                    let _ = shared.ctrl_tx.send(Frame::pong());
                }
            }
            FrameType::Open => {
                let id = frame.stream_id;
                if !shared.role.is_peer_stream_id(id) || shared.streams.contains_key(&id) {
                    return format!("protocol violation: unexpected open of stream {}", id);
                }

                if !shared.config.accept_streams
                    || shared.streams.len() >= shared.config.max_streams
                {
                    debug!("[{}] Refusing peer stream {}", session_id, id);
                    let _ = shared.ctrl_tx.send(Frame::rst(id));
                    continue;
                }

                let (stream, inlet) = MuxStream::new(id, shared.clone());
                shared.streams.insert(id, inlet);

                // A stream that cannot be queued is dropped, which resets it.
                if let Err(e) = accept_tx.try_send(stream) {
                    warn!("[{}] Dropping peer stream {}: {}", session_id, id, e);
                } else {
                    debug!("[{}] Accepted stream {}", session_id, id);
                }
            }
            FrameType::Data => {
                if frame.payload.is_empty() {
                    continue;
                }
                deliver(shared, frame.stream_id, Inbound::Data(frame.payload));
            }
            FrameType::Close => {
                let id = frame.stream_id;
                if frame.flags.has_rst() {
                    debug!("[{}] Stream {} reset by peer", session_id, id);
                    shared.remove_stream(id);
                } else {
                    deliver(shared, id, Inbound::Fin);
                    shared.remove_stream(id);
                }
            }
        }
    }
}

/// Hand an inbound message to a stream without waiting on its reader.
///
/// A stream whose reader is gone, stalled past `stream_send_timeout` or
/// behind by more than `stream_backlog_limit` bytes is reset; the session
/// and its other streams carry on.
fn deliver(shared: &Arc<Shared>, id: StreamId, msg: Inbound) {
    let Some(inlet) = shared.streams.get(&id).map(|entry| entry.value().clone()) else {
        trace!("[{}] Frame for unknown stream {}", shared.session_id, id);
        return;
    };

    match inlet.push(msg, shared.now_ms(), &shared.config) {
        Ok(()) => {}
        Err(Undeliverable::Gone) => {
            trace!("[{}] Stream {} receiver dropped", shared.session_id, id);
            shared.remove_stream(id);
        }
        Err(Undeliverable::Stalled(stalled)) => {
            warn!(
                "[{}] Stream {} took no data for {:?}, resetting it",
                shared.session_id, id, stalled
            );
            shared.remove_stream(id);
            let _ = shared.ctrl_tx.send(Frame::rst(id));
        }
        Err(Undeliverable::Overflow(queued)) => {
            warn!(
                "[{}] Stream {} has {} bytes queued (limit {}), resetting it",
                shared.session_id, id, queued, shared.config.stream_backlog_limit
            );
            shared.remove_stream(id);
            let _ = shared.ctrl_tx.send(Frame::rst(id));
        }
    }
}

async fn write_loop<T>(
    mut frames: FramedWrite<WriteHalf<T>, FrameCodec>,
    mut data_rx: mpsc::Receiver<Frame>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Frame>,
) -> String
where
    T: AsyncRead + AsyncWrite,
{
    loop {
        // Data first: a reset queued after data must not overtake it.
        let frame = tokio::select! {
            biased;
            Some(frame) = data_rx.recv() => frame,
            Some(frame) = ctrl_rx.recv() => frame,
            else => return "all senders dropped".to_string(),
        };

        if let Err(e) = frames.send(frame).await {
            return format!("write error: {}", e);
        }
    }
}

async fn keepalive_loop(shared: &Arc<Shared>) -> String {
    let Some(interval) = shared.config.keepalive_interval else {
        return std::future::pending().await;
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let idle = shared.idle_for();
        if idle >= shared.config.keepalive_timeout {
            return format!("keepalive timeout after {:?} of silence", idle);
        }

        let _ = shared.ctrl_tx.send(Frame::ping());
    }
}
