//! Line-delimited JSON handshake I/O
//!
//! Each handshake message is one JSON object followed by `\n`. Readers take a
//! buffered reader so that bytes arriving right after the line (the first mux
//! frames) stay in the buffer for whoever consumes the stream next.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed before handshake completed")]
    UnexpectedEof,

    #[error("Handshake line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Malformed handshake message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize a message into a single newline-terminated line
pub fn encode_line<T: Serialize>(msg: &T) -> Result<Bytes, HandshakeError> {
    let json = serde_json::to_vec(msg)?;
    let mut buf = BytesMut::with_capacity(json.len() + 1);
    buf.put_slice(&json);
    buf.put_u8(b'\n');
    Ok(buf.freeze())
}

/// Write a message as one line and flush
pub async fn write_line<T, W>(writer: &mut W, msg: &T) -> Result<(), HandshakeError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let line = encode_line(msg)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one newline-terminated JSON message of at most `max_len` bytes
pub async fn read_line<T, R>(reader: &mut R, max_len: usize) -> Result<T, HandshakeError>
where
    T: DeserializeOwned,
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(256);
    let n = (&mut *reader)
        .take(max_len as u64)
        .read_until(b'\n', &mut line)
        .await?;

    if line.last() != Some(&b'\n') {
        if n >= max_len {
            return Err(HandshakeError::LineTooLong(max_len));
        }
        return Err(HandshakeError::UnexpectedEof);
    }

    trace!("Read handshake line ({} bytes)", line.len());
    Ok(serde_json::from_slice(&line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecReqInfo, ExecReqType, SessionInfo};
    use tokio::io::{AsyncReadExt, BufReader};

    #[tokio::test]
    async fn test_read_line_leaves_trailing_bytes() {
        let data = b"{\"Type\":\"shell\"}\n\x00\x00\x00\x01rest".to_vec();
        let mut reader = BufReader::new(&data[..]);

        let req: ExecReqInfo = read_line(&mut reader, 4096).await.unwrap();
        assert_eq!(req.kind, ExecReqType::Shell);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"\x00\x00\x00\x01rest");
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let data = vec![b'x'; 100];
        let mut reader = BufReader::new(&data[..]);

        let err = read_line::<ExecReqInfo, _>(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, HandshakeError::LineTooLong(16)));
    }

    #[tokio::test]
    async fn test_read_line_eof() {
        let data = b"{\"Type\":".to_vec();
        let mut reader = BufReader::new(&data[..]);

        let err = read_line::<ExecReqInfo, _>(&mut reader, 4096).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedEof));

        let mut empty = BufReader::new(&b""[..]);
        let err = read_line::<ExecReqInfo, _>(&mut empty, 4096).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_read_line_malformed() {
        let data = b"not json\n".to_vec();
        let mut reader = BufReader::new(&data[..]);

        let err = read_line::<ExecReqInfo, _>(&mut reader, 4096).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut client, server) = tokio::io::duplex(1024);
        let info = SessionInfo {
            token: "tok".to_string(),
            access_port: "8443".to_string(),
        };

        write_line(&mut client, &info).await.unwrap();

        let mut reader = BufReader::new(server);
        let got: SessionInfo = read_line(&mut reader, 4096).await.unwrap();
        assert_eq!(got, info);
    }
}
