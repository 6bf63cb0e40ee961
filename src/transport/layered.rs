//! Adapter running a [`StreamCodec`] on top of another stream.
//!
//! Reads pull wire bytes from the inner stream, decode them into a
//! plaintext buffer and serve the caller from it. Writes encode into a
//! pending buffer that is drained to the inner stream; a new write is only
//! accepted once the previous output has been handed to the inner stream.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::codec::StreamCodec;

const READ_CHUNK: usize = 16 * 1024;

/// Stream whose bytes pass through a codec.
pub struct CodecStream<S, C> {
    inner: S,
    codec: C,
    wire_in: BytesMut,
    plain_in: BytesMut,
    wire_out: BytesMut,
    eof: bool,
}

impl<S, C> CodecStream<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: StreamCodec + Unpin,
{
    /// Wrap `inner` with `codec`.
    pub fn new(inner: S, codec: C) -> Self {
        Self {
            inner,
            codec,
            wire_in: BytesMut::with_capacity(READ_CHUNK),
            plain_in: BytesMut::new(),
            wire_out: BytesMut::new(),
            eof: false,
        }
    }

    /// Codec in use.
    pub fn codec(&self) -> &C {
        &self.codec
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.wire_out.is_empty() {
            let written = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.wire_out))?;
            if written == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "inner stream accepted no bytes",
                )));
            }
            self.wire_out.advance(written);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S, C> AsyncRead for CodecStream<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: StreamCodec + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plain_in.is_empty() {
                let n = this.plain_in.len().min(buf.remaining());
                buf.put_slice(&this.plain_in.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                if !this.wire_in.is_empty() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside an encoded unit",
                    )));
                }
                return Poll::Ready(Ok(()));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
            if chunk_buf.filled().is_empty() {
                this.eof = true;
                continue;
            }
            this.wire_in.extend_from_slice(chunk_buf.filled());
            this.codec.decode(&mut this.wire_in, &mut this.plain_in)?;
        }
    }
}

impl<S, C> AsyncWrite for CodecStream<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: StreamCodec + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        this.codec.encode(buf, &mut this.wire_out)?;
        if let Poll::Ready(Err(err)) = this.poll_drain(cx) {
            return Poll::Ready(Err(err));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
