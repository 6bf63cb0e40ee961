//! Codec module - byte-stream transforms layered over a transport.
//!
//! A [`StreamCodec`] turns plaintext writes into wire bytes and wire bytes
//! back into plaintext. [`crate::transport::CodecStream`] drives a codec
//! on top of any `AsyncRead + AsyncWrite` stream, so layers chain freely.
//!
//! - [`RawCodec`] - identity, bytes pass through unchanged
//! - [`DeflateCodec`] - raw deflate, sync-flushed on every write
//! - [`SnappyCodec`] - snappy framing format with masked CRC-32C checksums
//!
//! Decode failures are reported as `io::ErrorKind::InvalidData`.
//!
//! # Example
//!
//! ```
//! use nsq_client::codec::{SnappyCodec, StreamCodec};
//! use bytes::BytesMut;
//!
//! let mut writer = SnappyCodec::new();
//! let mut reader = SnappyCodec::new();
//!
//! let mut wire = BytesMut::new();
//! writer.encode(b"hello hello hello", &mut wire).unwrap();
//!
//! let mut plain = BytesMut::new();
//! reader.decode(&mut wire, &mut plain).unwrap();
//! assert_eq!(&plain[..], b"hello hello hello");
//! ```

use std::io;

use bytes::BytesMut;

mod deflate;
mod raw;
mod snappy;

pub use deflate::{DeflateCodec, DEFAULT_DEFLATE_LEVEL};
pub use raw::RawCodec;
pub use snappy::{masked_crc32c, SnappyCodec, MAX_CHUNK_SIZE};

/// Bidirectional byte transform.
pub trait StreamCodec: Send + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Encode `plain` and append the wire bytes to `out`.
    ///
    /// Output must be self-contained: a reader that receives everything
    /// appended so far can decode all of `plain`.
    fn encode(&mut self, plain: &[u8], out: &mut BytesMut) -> io::Result<()>;

    /// Consume complete units from `wire` and append plaintext to `out`.
    ///
    /// Incomplete trailing data stays in `wire` for the next call.
    fn decode(&mut self, wire: &mut BytesMut, out: &mut BytesMut) -> io::Result<()>;
}

pub(crate) fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}
