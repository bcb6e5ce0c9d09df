//! [`DuplexStream`] adapter for tokio byte streams

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::{DuplexStream, StreamRecv, StreamSend, TransportResult};

/// Wraps any `AsyncRead + AsyncWrite` stream (TCP, TLS, mux stream)
#[derive(Debug)]
pub struct IoStream<T> {
    inner: T,
}

impl<T> IoStream<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T> DuplexStream for IoStream<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    type Reader = IoReader<ReadHalf<T>>;
    type Writer = IoWriter<WriteHalf<T>>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read, write) = tokio::io::split(self.inner);
        (IoReader { inner: read }, IoWriter { inner: write })
    }
}

/// Receive half of an [`IoStream`]
#[derive(Debug)]
pub struct IoReader<R> {
    inner: R,
}

#[async_trait]
impl<R> StreamRecv for IoReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(max_size);
        let n = self.inner.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }
}

/// Send half of an [`IoStream`]
#[derive(Debug)]
pub struct IoWriter<W> {
    inner: W,
}

#[async_trait]
impl<W> StreamSend for IoWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_bytes(&mut self, data: Bytes) -> TransportResult<()> {
        self.inner.write_all(&data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
