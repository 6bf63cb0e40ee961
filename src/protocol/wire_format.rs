//! Wire format encoding and decoding.
//!
//! Every inbound frame starts with an 8-byte header:
//! ```text
//! ┌──────────┬──────────┬─────────────────┐
//! │ Size     │ Type     │ Data            │
//! │ 4 bytes  │ 4 bytes  │ size - 4 bytes  │
//! │ int32 BE │ int32 BE │                 │
//! └──────────┴──────────┴─────────────────┘
//! ```
//!
//! The declared size covers the type field, so the net payload length is
//! `size - 4`.

use crate::error::{NsqError, Result};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Bytes of the type field counted in the declared frame size.
pub const TYPE_FIELD_SIZE: usize = 4;

/// Protocol version marker written right after connecting.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Response body the server uses for heartbeats.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Length of a message ID.
pub const MESSAGE_ID_SIZE: usize = 16;

/// Fixed prefix of a message frame: timestamp, attempts, id.
pub const MESSAGE_HEADER_SIZE: usize = 8 + 2 + MESSAGE_ID_SIZE;

/// Default maximum payload size accepted from the server (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame type constants.
pub mod frame_type {
    /// Response to a command (`OK`, `CLOSE_WAIT`, heartbeat, JSON).
    pub const RESPONSE: i32 = 0;
    /// Error reply (`E_INVALID ...`).
    pub const ERROR: i32 = 1;
    /// Delivered message.
    pub const MESSAGE: i32 = 2;
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Net payload length (declared size minus the type field).
    pub size: u32,
    /// Frame type (see [`frame_type`]).
    pub frame_type: i32,
}

impl FrameHeader {
    /// Create a new header for a payload of `size` bytes.
    pub fn new(size: u32, frame_type: i32) -> Self {
        Self { size, frame_type }
    }

    /// Encode header to bytes (Big Endian), restoring the declared size.
    ///
    /// # Example
    ///
    /// ```
    /// use nsq_client::protocol::{frame_type, FrameHeader};
    ///
    /// let bytes = FrameHeader::new(2, frame_type::RESPONSE).encode();
    /// assert_eq!(bytes, [0, 0, 0, 6, 0, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let declared = self.size + TYPE_FIELD_SIZE as u32;
        buf[0..4].copy_from_slice(&declared.to_be_bytes());
        buf[4..8].copy_from_slice(&self.frame_type.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Fails with [`NsqError::MalformedFrame`] when the buffer is short or
    /// the declared size cannot hold the type field.
    ///
    /// # Example
    ///
    /// ```
    /// use nsq_client::protocol::FrameHeader;
    ///
    /// let header = FrameHeader::decode(&[0, 0, 0, 6, 0, 0, 0, 1]).unwrap();
    /// assert_eq!(header.size, 2);
    /// assert_eq!(header.frame_type, 1);
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(NsqError::MalformedFrame(format!(
                "header needs {} bytes, got {}",
                HEADER_SIZE,
                buf.len()
            )));
        }
        let declared = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let frame_type = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if declared < TYPE_FIELD_SIZE as i32 {
            return Err(NsqError::MalformedFrame(format!(
                "declared size {} is smaller than the type field",
                declared
            )));
        }
        Ok(Self {
            size: (declared - TYPE_FIELD_SIZE as i32) as u32,
            frame_type,
        })
    }

    /// Reject payloads larger than `max_size`.
    pub fn validate(&self, max_size: u32) -> Result<()> {
        if self.size > max_size {
            return Err(NsqError::MalformedFrame(format!(
                "Payload size {} exceeds maximum {}",
                self.size, max_size
            )));
        }
        Ok(())
    }
}
