//! Raw codec - identity transform.
//!
//! Installed when no compression was negotiated; bytes pass through as-is.

use std::io;

use bytes::BytesMut;

use super::StreamCodec;

/// Codec that passes bytes through without transformation.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl StreamCodec for RawCodec {
    fn name(&self) -> &'static str {
        "identity"
    }

    #[inline]
    fn encode(&mut self, plain: &[u8], out: &mut BytesMut) -> io::Result<()> {
        out.extend_from_slice(plain);
        Ok(())
    }

    #[inline]
    fn decode(&mut self, wire: &mut BytesMut, out: &mut BytesMut) -> io::Result<()> {
        out.extend_from_slice(&wire.split());
        Ok(())
    }
}
