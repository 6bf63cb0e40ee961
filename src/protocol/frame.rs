//! Inbound frames with typed accessors.
//!
//! A [`Frame`] is built from a decoded header type and its payload. Message
//! payloads are further split into timestamp, attempts, id and body.
//! Uses `bytes::Bytes` so the body shares the receive buffer.
//!
//! # Example
//!
//! ```
//! use nsq_client::protocol::{frame_type, Frame};
//! use bytes::Bytes;
//!
//! let frame = Frame::build(frame_type::RESPONSE, Bytes::from_static(b"OK")).unwrap();
//! assert!(frame.is_ok());
//! ```

use std::borrow::Cow;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::wire_format::{
    frame_type, FrameHeader, HEADER_SIZE, HEARTBEAT, MESSAGE_HEADER_SIZE, MESSAGE_ID_SIZE,
};
use crate::error::{NsqError, Result};

/// Opaque 16-byte message identifier.
///
/// Servers send printable hex ids; `Display` renders them as text.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; MESSAGE_ID_SIZE]);

impl MessageId {
    /// Wrap raw id bytes.
    pub const fn new(bytes: [u8; MESSAGE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build an id from a slice; it must be exactly 16 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; MESSAGE_ID_SIZE] = bytes.try_into().map_err(|_| {
            NsqError::MalformedFrame(format!(
                "message id must be {} bytes, got {}",
                MESSAGE_ID_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    /// Raw id bytes as sent on the wire.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// A delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Broker timestamp in nanoseconds.
    pub timestamp: u64,
    /// Delivery attempts, starting at 1.
    pub attempts: u16,
    /// Message identifier used by FIN/REQ/TOUCH.
    pub id: MessageId,
    /// Message body (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

impl Message {
    /// Parse a message frame payload.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < MESSAGE_HEADER_SIZE {
            return Err(NsqError::MalformedFrame(format!(
                "message payload of {} bytes is shorter than its {}-byte header",
                payload.len(),
                MESSAGE_HEADER_SIZE
            )));
        }
        let head = payload.split_to(MESSAGE_HEADER_SIZE);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&head[0..8]);
        Ok(Self {
            timestamp: u64::from_be_bytes(timestamp),
            attempts: u16::from_be_bytes([head[8], head[9]]),
            id: MessageId::from_slice(&head[10..MESSAGE_HEADER_SIZE])?,
            body: payload,
        })
    }

    /// Encode the message payload (without the frame header).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_SIZE + self.body.len());
        buf.put_u64(self.timestamp);
        buf.put_u16(self.attempts);
        buf.put_slice(self.id.as_bytes());
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Body as a byte slice.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// A complete inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Response text (`OK`, `CLOSE_WAIT`, heartbeat, negotiation JSON).
    Response(Bytes),
    /// Error text (`E_INVALID ...`).
    Error(Bytes),
    /// Delivered message.
    Message(Message),
}

impl Frame {
    /// Build a frame from its wire type and payload.
    pub fn build(frame_type: i32, payload: Bytes) -> Result<Self> {
        match frame_type {
            frame_type::RESPONSE => Ok(Frame::Response(payload)),
            frame_type::ERROR => Ok(Frame::Error(payload)),
            frame_type::MESSAGE => Ok(Frame::Message(Message::decode(payload)?)),
            other => Err(NsqError::UnknownFrameType(other)),
        }
    }

    /// Wire type of this frame.
    #[inline]
    pub fn frame_type(&self) -> i32 {
        match self {
            Frame::Response(_) => frame_type::RESPONSE,
            Frame::Error(_) => frame_type::ERROR,
            Frame::Message(_) => frame_type::MESSAGE,
        }
    }

    /// Raw payload for response and error frames.
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Frame::Response(data) | Frame::Error(data) => Some(data),
            Frame::Message(_) => None,
        }
    }

    /// Response or error payload as text.
    pub fn text(&self) -> Option<Cow<'_, str>> {
        self.payload().map(|data| String::from_utf8_lossy(data))
    }

    /// Check if this is the server heartbeat.
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(data) if data.as_ref() == HEARTBEAT)
    }

    /// Check if this is a plain `OK` response.
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Response(data) if data.as_ref() == b"OK")
    }

    /// Check if this is an error frame.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Encode the frame back to wire bytes, header included.
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Response(data) => build_frame(frame_type::RESPONSE, data),
            Frame::Error(data) => build_frame(frame_type::ERROR, data),
            Frame::Message(message) => build_frame(frame_type::MESSAGE, &message.encode()),
        }
    }
}

/// Build wire bytes for a frame of `frame_type` carrying `payload`.
pub fn build_frame(frame_type: i32, payload: &[u8]) -> Bytes {
    let header = FrameHeader::new(payload.len() as u32, frame_type);
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    buf.freeze()
}

/// Read exactly one frame from `reader`.
///
/// Used during the handshake, before the receive loop owns the stream,
/// so that nothing past the frame is consumed.
pub async fn read_frame<R>(reader: &mut R, max_size: u32) -> Result<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut head)
        .await
        .map_err(NsqError::from_transport)?;
    let header = FrameHeader::decode(&head)?;
    header.validate(max_size)?;

    let mut payload = vec![0u8; header.size as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(NsqError::from_transport)?;
    Frame::build(header.frame_type, Bytes::from(payload))
}
