//! Multiplexing frame format
//!
//! Every frame on a backend connection after the handshake has a fixed
//! 10-byte header followed by the payload:
//!
//! ```text
//! stream_id: u32 | frame_type: u8 | flags: u8 | length: u32 | payload
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Stream identifier
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Opens a new stream; payload is empty
    Open = 0,
    Data = 1,
    /// Half-close (FIN) or abort (RST) of a stream
    Close = 2,
    /// Session keepalive on stream 0; answered with ACK set
    Ping = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::Ping),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 0b0000_0001;
    pub const ACK: u8 = 0b0000_0010;
    pub const RST: u8 = 0b0000_0100;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + flags (1) + length (4) = 10 bytes
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn fin(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new()).with_flags(FrameFlags::new().with_fin())
    }

    pub fn rst(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new()).with_flags(FrameFlags::new().with_rst())
    }

    pub fn ping() -> Self {
        Self::new(0, FrameType::Ping, Bytes::new())
    }

    pub fn pong() -> Self {
        Self::ping().with_flags(FrameFlags::new().with_ack())
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode frame into `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        buf.reserve(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put_slice(&self.payload);

        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameError::IncompleteFrame);
        }

        let stream_id = buf.get_u32();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = FrameFlags::from_u8(buf.get_u8());
        let length = buf.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length as usize));
        }

        if buf.remaining() < length as usize {
            return Err(FrameError::IncompleteFrame);
        }

        let payload = buf.split_to(length as usize);

        Ok(Self {
            stream_id,
            frame_type,
            flags,
            payload,
        })
    }
}

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,
}

/// `tokio_util` codec for [`Frame`]s over a byte stream
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: crate::MAX_FRAME_SIZE as usize,
        }
    }

    /// Lower the accepted payload size (never above [`crate::MAX_FRAME_SIZE`])
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.min(crate::MAX_FRAME_SIZE as usize);
        self
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < Frame::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &src[..Frame::HEADER_SIZE];
        let stream_id = header.get_u32();
        let frame_type = FrameType::try_from(header.get_u8())?;
        let flags = FrameFlags::from_u8(header.get_u8());
        let length = header.get_u32() as usize;

        if length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge(length));
        }

        if src.len() < Frame::HEADER_SIZE + length {
            src.reserve(Frame::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(Frame::HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        Ok(Some(Frame {
            stream_id,
            frame_type,
            flags,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge(item.payload.len()));
        }
        item.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let payload = Bytes::from("hello world");
        let frame = Frame::data(42, payload.clone());

        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), Frame::HEADER_SIZE + payload.len());

        let decoded = Frame::decode(encoded).unwrap();
        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_close_flags() {
        let fin = Frame::fin(10);
        assert!(fin.flags.has_fin());
        assert!(!fin.flags.has_rst());

        let rst = Frame::decode(Frame::rst(10).encode().unwrap()).unwrap();
        assert_eq!(rst.frame_type, FrameType::Close);
        assert!(rst.flags.has_rst());
        assert!(!rst.flags.has_fin());

        assert!(Frame::pong().flags.has_ack());
        assert!(!Frame::ping().flags.has_ack());
    }

    #[test]
    fn test_invalid_frame_type() {
        let mut raw = Frame::open(1).encode().unwrap().to_vec();
        raw[4] = 9;
        assert!(matches!(
            Frame::decode(Bytes::from(raw)),
            Err(FrameError::InvalidFrameType(9))
        ));
    }

    #[test]
    fn test_codec_partial_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let first = Frame::data(1, Bytes::from_static(b"abc"));
        let second = Frame::fin(1);
        let mut wire = BytesMut::new();
        codec.encode(first.clone(), &mut wire).unwrap();
        codec.encode(second.clone(), &mut wire).unwrap();

        // Header split across reads
        buf.extend_from_slice(&wire[..4]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Header complete, payload missing
        buf.extend_from_slice(&wire[4..11]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[11..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_rejects_oversized() {
        let mut codec = FrameCodec::new().with_max_frame_size(8);

        let mut buf = BytesMut::new();
        Frame::data(3, Bytes::from(vec![0u8; 9]))
            .encode_into(&mut buf)
            .unwrap();

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::FrameTooLarge(9))
        ));

        let mut out = BytesMut::new();
        assert!(codec
            .encode(Frame::data(3, Bytes::from(vec![0u8; 9])), &mut out)
            .is_err());
    }
}
