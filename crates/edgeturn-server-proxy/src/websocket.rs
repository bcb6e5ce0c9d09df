//! [`DuplexStream`] over a server-side WebSocket

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use edgeturn_transport::{DuplexStream, StreamRecv, StreamSend, TransportError, TransportResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::trace;

/// Client WebSocket seen as a byte stream.
///
/// Every message payload is raw bytes, text or binary alike. Outgoing
/// data is sent as binary messages.
pub struct WsDuplex {
    socket: WebSocket,
}

impl WsDuplex {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl DuplexStream for WsDuplex {
    type Reader = WsReader;
    type Writer = WsWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.socket.split();
        (
            WsReader {
                stream,
                pending: Bytes::new(),
            },
            WsWriter { sink },
        )
    }
}

pub struct WsReader {
    stream: SplitStream<WebSocket>,
    /// Remainder of a message larger than the caller's buffer
    pending: Bytes,
}

#[async_trait]
impl StreamRecv for WsReader {
    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Option<Bytes>> {
        while self.pending.is_empty() {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(TransportError::ConnectionError(e.to_string())),
                None => return Ok(None),
            };

            match message {
                Message::Binary(data) => self.pending = data,
                Message::Text(text) => {
                    self.pending = Bytes::copy_from_slice(text.as_str().as_bytes())
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(frame) => {
                    trace!("WebSocket closed by client: {:?}", frame);
                    return Ok(None);
                }
            }
        }

        let take = self.pending.len().min(max_size);
        Ok(Some(self.pending.split_to(take)))
    }
}

pub struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl StreamSend for WsWriter {
    async fn send_bytes(&mut self, data: Bytes) -> TransportResult<()> {
        self.sink
            .send(Message::Binary(data))
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }
}
