//! Plaintext-or-TLS stream acceptance shared by both listeners

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Accepts raw TCP connections as plaintext or TLS streams
#[derive(Clone)]
pub enum StreamAcceptor {
    Plain,
    Tls(TlsAcceptor),
}

impl StreamAcceptor {
    pub fn tls(config: Arc<ServerConfig>) -> Self {
        StreamAcceptor::Tls(TlsAcceptor::from(config))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, StreamAcceptor::Tls(_))
    }

    /// Run the TLS handshake (if any) on a freshly accepted socket
    pub async fn accept(&self, stream: TcpStream) -> io::Result<MaybeTlsStream> {
        match self {
            StreamAcceptor::Plain => Ok(MaybeTlsStream::Plain(stream)),
            StreamAcceptor::Tls(acceptor) => {
                let tls = acceptor.accept(stream).await?;
                Ok(MaybeTlsStream::Tls(Box::new(tls)))
            }
        }
    }
}

impl std::fmt::Debug for StreamAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamAcceptor::Plain => f.write_str("StreamAcceptor::Plain"),
            StreamAcceptor::Tls(_) => f.write_str("StreamAcceptor::Tls"),
        }
    }
}

/// Server-side stream that may or may not be wrapped in TLS
#[derive(Debug)]
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    pub fn get_ref(&self) -> &TcpStream {
        match self {
            MaybeTlsStream::Plain(s) => s,
            MaybeTlsStream::Tls(s) => s.get_ref().0,
        }
    }

    /// Whether the peer presented a client certificate during the handshake
    pub fn has_peer_certificate(&self) -> bool {
        match self {
            MaybeTlsStream::Plain(_) => false,
            MaybeTlsStream::Tls(s) => s
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| !certs.is_empty())
                .unwrap_or(false),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
