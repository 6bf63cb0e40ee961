//! Deflate codec - raw deflate stream without zlib header.
//!
//! The compressor is sync-flushed after each write so that every command
//! reaches the server without waiting for more input. The stream has no
//! message boundaries; the frame layer above restores them.

use std::io::{self, Write};

use bytes::BytesMut;
use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;

use super::{invalid_data, StreamCodec};

/// Compression level used when the server grants deflate without a level.
pub const DEFAULT_DEFLATE_LEVEL: u32 = 6;

/// Streaming raw-deflate codec.
pub struct DeflateCodec {
    level: u32,
    encoder: DeflateEncoder<Vec<u8>>,
    decoder: DeflateDecoder<Vec<u8>>,
}

impl DeflateCodec {
    /// Create a codec compressing at `level` (clamped to 1..=9).
    pub fn new(level: u32) -> Self {
        let level = level.clamp(1, 9);
        Self {
            level,
            encoder: DeflateEncoder::new(Vec::new(), Compression::new(level)),
            decoder: DeflateDecoder::new(Vec::new()),
        }
    }

    /// Effective compression level.
    #[inline]
    pub fn level(&self) -> u32 {
        self.level
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self::new(DEFAULT_DEFLATE_LEVEL)
    }
}

impl StreamCodec for DeflateCodec {
    fn name(&self) -> &'static str {
        "deflate"
    }

    fn encode(&mut self, plain: &[u8], out: &mut BytesMut) -> io::Result<()> {
        self.encoder.write_all(plain)?;
        self.encoder.flush()?;
        let compressed = self.encoder.get_mut();
        out.extend_from_slice(compressed);
        compressed.clear();
        Ok(())
    }

    fn decode(&mut self, wire: &mut BytesMut, out: &mut BytesMut) -> io::Result<()> {
        if wire.is_empty() {
            return Ok(());
        }
        let input = wire.split();
        self.decoder.write_all(&input).map_err(invalid_data)?;
        self.decoder.flush().map_err(invalid_data)?;
        let plain = self.decoder.get_mut();
        out.extend_from_slice(plain);
        plain.clear();
        Ok(())
    }
}
