//! Transport abstraction layer for EdgeTurn
//!
//! Every byte channel the relay moves data between (a TCP or TLS socket, a
//! client WebSocket, a multiplexed stream) is seen through the
//! [`DuplexStream`] trait: it splits into an independent receive half and
//! send half, which the byte-pump drives from two tasks.

pub mod io;
pub mod listener;
pub mod pump;

pub use io::{IoReader, IoStream, IoWriter};
pub use listener::{MaybeTlsStream, StreamAcceptor};
pub use pump::{bridge, BridgeStats, PumpConfig};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Operation timed out")]
    Timeout,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Receive half of a duplex byte channel
#[async_trait]
pub trait StreamRecv: Send {
    /// Receive up to `max_size` bytes.
    ///
    /// Returns `Ok(None)` once the peer has finished sending. Implementations
    /// may return empty chunks, which carry no meaning.
    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Option<Bytes>>;
}

/// Send half of a duplex byte channel
#[async_trait]
pub trait StreamSend: Send {
    /// Send all of `data`
    async fn send_bytes(&mut self, data: Bytes) -> TransportResult<()>;

    /// Finish the send direction; the peer observes end of stream
    async fn finish(&mut self) -> TransportResult<()>;
}

/// Bidirectional byte channel that can be split into independent halves
pub trait DuplexStream: Send + 'static {
    type Reader: StreamRecv + 'static;
    type Writer: StreamSend + 'static;

    fn split(self) -> (Self::Reader, Self::Writer);
}
