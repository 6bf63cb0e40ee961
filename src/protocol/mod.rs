//! Protocol module - wire format, framing, frames and commands.
//!
//! This module implements the binary protocol:
//! - 8-byte frame header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame and message types with typed accessors
//! - Outbound commands with their response classes

mod command;
mod frame;
mod frame_buffer;
mod wire_format;

pub use command::{validate_name, Command, ResponseClass, MAX_NAME_LENGTH};
pub use frame::{build_frame, read_frame, Frame, Message, MessageId};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    frame_type, FrameHeader, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE, HEARTBEAT, MAGIC_V2,
    MESSAGE_HEADER_SIZE, MESSAGE_ID_SIZE, TYPE_FIELD_SIZE,
};
