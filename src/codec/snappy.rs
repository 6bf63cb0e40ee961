//! Snappy codec - framing format over raw snappy blocks.
//!
//! ```text
//! ┌──────┬────────────────┬─────────────────────────────┐
//! │ Type │ Length         │ Data                        │
//! │ 1 B  │ 3 bytes, LE    │ Length bytes                │
//! └──────┴────────────────┴─────────────────────────────┘
//! ```
//!
//! Chunk types:
//! - `0xff` stream identifier, data `sNaPpY`
//! - `0x00` compressed: 4-byte LE masked CRC-32C of the plaintext, snappy block
//! - `0x01` uncompressed: 4-byte LE masked CRC-32C, plaintext
//! - `0x80..=0xfe` skippable
//!
//! Anything else, or a checksum mismatch, is a fatal decode error.

use std::io;

use bytes::{Buf, BufMut, BytesMut};

use super::{invalid_data, StreamCodec};

/// Largest plaintext carried by one chunk.
pub const MAX_CHUNK_SIZE: usize = 65536;

const CHUNK_HEADER_SIZE: usize = 4;
const CHECKSUM_SIZE: usize = 4;
const IDENTIFIER_BODY: &[u8] = b"sNaPpY";

mod chunk_type {
    pub const COMPRESSED: u8 = 0x00;
    pub const UNCOMPRESSED: u8 = 0x01;
    pub const IDENTIFIER: u8 = 0xff;
}

/// CRC-32C of `data`, rotated and offset as the framing format requires.
pub fn masked_crc32c(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

/// Snappy framing codec.
pub struct SnappyCodec {
    encoder: snap::raw::Encoder,
    decoder: snap::raw::Decoder,
    identifier_sent: bool,
}

impl SnappyCodec {
    /// Create a codec; the stream identifier goes out with the first write.
    pub fn new() -> Self {
        Self {
            encoder: snap::raw::Encoder::new(),
            decoder: snap::raw::Decoder::new(),
            identifier_sent: false,
        }
    }

    fn put_chunk(out: &mut BytesMut, kind: u8, checksum: Option<u32>, data: &[u8]) {
        let len = data.len() + checksum.map_or(0, |_| CHECKSUM_SIZE);
        out.reserve(CHUNK_HEADER_SIZE + len);
        out.put_u8(kind);
        out.put_slice(&(len as u32).to_le_bytes()[..3]);
        if let Some(checksum) = checksum {
            out.put_u32_le(checksum);
        }
        out.put_slice(data);
    }

    fn decode_chunk(&mut self, kind: u8, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        match kind {
            chunk_type::IDENTIFIER => {
                if data != IDENTIFIER_BODY {
                    return Err(invalid_data("bad snappy stream identifier"));
                }
            }
            chunk_type::COMPRESSED | chunk_type::UNCOMPRESSED => {
                if data.len() < CHECKSUM_SIZE {
                    return Err(invalid_data("snappy chunk shorter than its checksum"));
                }
                let expected = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                let body = &data[CHECKSUM_SIZE..];
                let plain = if kind == chunk_type::COMPRESSED {
                    self.decoder.decompress_vec(body).map_err(invalid_data)?
                } else {
                    body.to_vec()
                };
                let actual = masked_crc32c(&plain);
                if actual != expected {
                    return Err(invalid_data(format!(
                        "snappy checksum mismatch: expected {:#010x}, got {:#010x}",
                        expected, actual
                    )));
                }
                out.extend_from_slice(&plain);
            }
            0x80..=0xfe => {}
            other => {
                return Err(invalid_data(format!(
                    "unrecognized snappy chunk type {:#04x}",
                    other
                )));
            }
        }
        Ok(())
    }
}

impl Default for SnappyCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCodec for SnappyCodec {
    fn name(&self) -> &'static str {
        "snappy"
    }

    fn encode(&mut self, plain: &[u8], out: &mut BytesMut) -> io::Result<()> {
        if !self.identifier_sent {
            Self::put_chunk(out, chunk_type::IDENTIFIER, None, IDENTIFIER_BODY);
            self.identifier_sent = true;
        }
        for piece in plain.chunks(MAX_CHUNK_SIZE) {
            let checksum = masked_crc32c(piece);
            let compressed = self.encoder.compress_vec(piece).map_err(invalid_data)?;
            if compressed.len() < piece.len() {
                Self::put_chunk(out, chunk_type::COMPRESSED, Some(checksum), &compressed);
            } else {
                Self::put_chunk(out, chunk_type::UNCOMPRESSED, Some(checksum), piece);
            }
        }
        Ok(())
    }

    fn decode(&mut self, wire: &mut BytesMut, out: &mut BytesMut) -> io::Result<()> {
        while wire.len() >= CHUNK_HEADER_SIZE {
            let kind = wire[0];
            let len = u32::from_le_bytes([wire[1], wire[2], wire[3], 0]) as usize;
            if wire.len() < CHUNK_HEADER_SIZE + len {
                break;
            }
            wire.advance(CHUNK_HEADER_SIZE);
            let data = wire.split_to(len);
            self.decode_chunk(kind, &data, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(input: &[u8]) -> BytesMut {
        let mut wire = BytesMut::new();
        SnappyCodec::new().encode(input, &mut wire).unwrap();
        let mut plain = BytesMut::new();
        SnappyCodec::new().decode(&mut wire, &mut plain).unwrap();
        assert!(wire.is_empty());
        plain
    }

    #[test]
    fn test_identifier_written_once() {
        let mut codec = SnappyCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(b"a", &mut wire).unwrap();
        assert_eq!(&wire[..10], b"\xff\x06\x00\x00sNaPpY");

        let mut second = BytesMut::new();
        codec.encode(b"b", &mut second).unwrap();
        assert_ne!(second[0], chunk_type::IDENTIFIER);
    }

    #[test]
    fn test_compressible_and_incompressible_chunks() {
        let repetitive = b"NOP\n".repeat(100);
        assert_eq!(&round_trip(&repetitive)[..], &repetitive[..]);

        let short = b"x";
        assert_eq!(&round_trip(short)[..], short);
    }

    #[test]
    fn test_large_write_split_into_chunks() {
        let body: Vec<u8> = (0..(MAX_CHUNK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        assert_eq!(&round_trip(&body)[..], &body[..]);
    }

    #[test]
    fn test_partial_chunk_waits_for_more() {
        let mut wire = BytesMut::new();
        SnappyCodec::new().encode(b"partial chunk", &mut wire).unwrap();

        let mut reader = SnappyCodec::new();
        let tail = wire.split_off(wire.len() - 3);
        let mut plain = BytesMut::new();
        reader.decode(&mut wire, &mut plain).unwrap();
        assert!(plain.is_empty());

        wire.extend_from_slice(&tail);
        reader.decode(&mut wire, &mut plain).unwrap();
        assert_eq!(&plain[..], b"partial chunk");
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let mut wire = BytesMut::new();
        SnappyCodec::put_chunk(&mut wire, chunk_type::UNCOMPRESSED, Some(0xdead_beef), b"data");
        let err = SnappyCodec::new()
            .decode(&mut wire, &mut BytesMut::new())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_unrecognized_chunk_is_fatal() {
        let mut wire = BytesMut::from(&[0x05u8, 0x01, 0x00, 0x00, 0xaa][..]);
        let err = SnappyCodec::new()
            .decode(&mut wire, &mut BytesMut::new())
            .unwrap_err();
        assert!(err.to_string().contains("unrecognized"));
    }

    #[test]
    fn test_skippable_chunk_ignored() {
        let mut wire = BytesMut::from(&[0xfeu8, 0x02, 0x00, 0x00, 0x00, 0x00][..]);
        SnappyCodec::put_chunk(&mut wire, chunk_type::UNCOMPRESSED, Some(masked_crc32c(b"ok")), b"ok");
        let mut plain = BytesMut::new();
        SnappyCodec::new().decode(&mut wire, &mut plain).unwrap();
        assert_eq!(&plain[..], b"ok");
    }

    #[test]
    fn test_masked_crc_known_value() {
        // crc32c("") == 0, so the mask reduces to the constant.
        assert_eq!(masked_crc32c(b""), 0xa282_ead8);
    }
}
