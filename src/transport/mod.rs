//! Transport module - the byte stream under a connection.
//!
//! A [`Transport`] starts as a plain TCP stream and is rewrapped in place
//! as negotiation installs layers:
//!
//! ```text
//! TcpStream ─► TlsStream ─► CodecStream<Deflate|Snappy> ─► frames
//! ```
//!
//! Every layer exposes the same `AsyncRead + AsyncWrite` surface as the
//! stream it wraps, so the engine holds one [`BoxedStream`] regardless of
//! how many layers are active. At most one encrypting and one compressing
//! layer may be installed, and encryption must come first.

mod layered;
mod tcp;
mod tls;

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tracing::debug;

pub use layered::CodecStream;
pub use tcp::connect_tcp;
pub use tls::build_tls_connector;

use crate::codec::StreamCodec;
use crate::error::{NsqError, Result};

/// Bidirectional async byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Type-erased stream held by the connection.
pub type BoxedStream = Box<dyn ByteStream>;

/// Installed transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// TLS session.
    Tls,
    /// Compression codec, by name.
    Compression(&'static str),
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Tls => f.write_str("tls"),
            Layer::Compression(name) => f.write_str(name),
        }
    }
}

/// Byte stream plus the record of layers installed on it.
pub struct Transport {
    stream: BoxedStream,
    layers: Vec<Layer>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("layers", &self.layers)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Wrap an already-connected stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: ByteStream + 'static,
    {
        Self {
            stream: Box::new(stream),
            layers: Vec::new(),
        }
    }

    /// Layers installed so far, innermost first.
    #[inline]
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Check whether a compression layer is active.
    pub fn is_compressed(&self) -> bool {
        self.layers
            .iter()
            .any(|layer| matches!(layer, Layer::Compression(_)))
    }

    /// Check whether TLS is active.
    pub fn is_encrypted(&self) -> bool {
        self.layers.contains(&Layer::Tls)
    }

    /// Install a compression codec over the current stream.
    pub fn install_codec<C>(self, codec: C) -> Result<Self>
    where
        C: StreamCodec + Unpin,
    {
        if self.is_compressed() {
            return Err(NsqError::Configuration(format!(
                "cannot install {} over an existing compression layer",
                codec.name()
            )));
        }
        let layer = Layer::Compression(codec.name());
        debug!(%layer, "installing transport layer");
        let Transport { stream, layers } = self;
        Ok(Self::wrapped(CodecStream::new(stream, codec), layers, layer))
    }

    /// Mutable access to the current stream.
    #[inline]
    pub fn stream_mut(&mut self) -> &mut BoxedStream {
        &mut self.stream
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (ReadHalf<BoxedStream>, WriteHalf<BoxedStream>) {
        tokio::io::split(self.stream)
    }

    fn wrapped<S>(stream: S, mut layers: Vec<Layer>, layer: Layer) -> Self
    where
        S: ByteStream + 'static,
    {
        layers.push(layer);
        Self {
            stream: Box::new(stream),
            layers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DeflateCodec, SnappyCodec};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_layers_are_recorded() {
        let (client, _server) = duplex(1024);
        let transport = Transport::new(client).install_codec(SnappyCodec::new()).unwrap();
        assert_eq!(transport.layers(), &[Layer::Compression("snappy")]);
        assert!(transport.is_compressed());
        assert!(!transport.is_encrypted());
    }

    #[tokio::test]
    async fn test_debug_lists_layers() {
        let (client, _server) = duplex(1024);
        let transport = Transport::new(client).install_codec(SnappyCodec::new()).unwrap();
        let rendered = format!("{transport:?}");
        assert!(rendered.contains("Compression(\"snappy\")"), "{rendered}");
    }

    #[tokio::test]
    async fn test_second_compression_rejected() {
        let (client, _server) = duplex(1024);
        let transport = Transport::new(client).install_codec(DeflateCodec::default()).unwrap();
        let result = transport.install_codec(SnappyCodec::new());
        assert!(matches!(result, Err(NsqError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_compressed_transports_talk_through_split_halves() {
        let (client, server) = duplex(64 * 1024);
        let client = Transport::new(client).install_codec(DeflateCodec::new(5)).unwrap();
        let mut server = Transport::new(server).install_codec(DeflateCodec::new(5)).unwrap();

        let (_read, mut write) = client.into_split();
        write.write_all(b"SUB events archive\n").await.unwrap();
        write.flush().await.unwrap();

        let mut buf = [0u8; 19];
        server.stream_mut().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SUB events archive\n");
    }
}
