//! A manually controllable read buffer for Tokio `AsyncRead` sources.
//!
//! Head parsing, body decoding, and tunnel relaying all need to look at
//! bytes before deciding what they are, and leftover bytes after a parsed
//! head must not be lost. [`BufferedReader`] accumulates input explicitly
//! and hands out either inspection slices or ready-to-frame [`Bytes`]
//! chunks.

use bytes::{Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt};

const INITIAL_CAPACITY: usize = 4 * 1024;

pub(crate) struct BufferedReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> BufferedReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Returns the unconsumed buffered bytes.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Discards `n` bytes from the front of the buffer.
    pub(crate) fn consume(&mut self, n: usize) {
        let _ = self.buf.split_to(n);
    }

    /// Reads more data from the inner reader into the buffer.
    ///
    /// Returns the number of bytes read; `0` means EOF.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        self.inner.read_buf(&mut self.buf).await
    }

    /// Takes everything currently buffered without touching the inner reader.
    pub(crate) fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Returns the next chunk of up to `max` bytes, serving buffered bytes
    /// before reading from the inner reader. An empty chunk means EOF.
    pub(crate) async fn read_chunk(&mut self, max: usize) -> io::Result<Bytes> {
        if self.buf.is_empty() && self.fill().await? == 0 {
            return Ok(Bytes::new());
        }
        let n = self.buf.len().min(max);
        Ok(self.buf.split_to(n).freeze())
    }
}
