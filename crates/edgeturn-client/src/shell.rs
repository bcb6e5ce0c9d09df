//! Shell WebSocket client

use async_trait::async_trait;
use bytes::Bytes;
use edgeturn_cert::ClientTlsSettings;
use edgeturn_transport::{DuplexStream, StreamRecv, StreamSend, TransportError, TransportResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::ClientError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a shell WebSocket (`wss://host:port/edgeshell?edgetoken=...`)
pub async fn connect_shell(url: &str, tls: &ClientTlsSettings) -> Result<ShellClient, ClientError> {
    let connector = Connector::Rustls(Arc::new(tls.client_config()?));

    let (socket, response) =
        tokio_tungstenite::connect_async_tls_with_config(url, None, true, Some(connector))
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) => {
                    ClientError::Refused(response.status().as_u16())
                }
                other => ClientError::WebSocket(other),
            })?;

    debug!("Shell WebSocket open (HTTP {})", response.status());
    Ok(ShellClient { socket })
}

/// Attached shell session, usable as a byte stream
pub struct ShellClient {
    socket: Socket,
}

impl ShellClient {
    pub fn into_inner(self) -> Socket {
        self.socket
    }
}

impl DuplexStream for ShellClient {
    type Reader = ShellReader;
    type Writer = ShellWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.socket.split();
        (
            ShellReader {
                stream,
                pending: Bytes::new(),
            },
            ShellWriter { sink },
        )
    }
}

pub struct ShellReader {
    stream: SplitStream<Socket>,
    pending: Bytes,
}

#[async_trait]
impl StreamRecv for ShellReader {
    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Option<Bytes>> {
        while self.pending.is_empty() {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => self.pending = Bytes::from(data),
                Some(Ok(Message::Text(text))) => self.pending = Bytes::from(text.into_bytes()),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::ConnectionError(e.to_string())),
            }
        }

        let take = self.pending.len().min(max_size);
        Ok(Some(self.pending.split_to(take)))
    }
}

pub struct ShellWriter {
    sink: SplitSink<Socket, Message>,
}

#[async_trait]
impl StreamSend for ShellWriter {
    async fn send_bytes(&mut self, data: Bytes) -> TransportResult<()> {
        self.sink
            .send(Message::Binary(data.to_vec()))
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
