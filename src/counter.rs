//! Byte-counting wrappers over the underlying stream.
//!
//! Archive cursors never seek; these wrappers keep the running offset that
//! `seek`-based readers would get for free, and give the truncator a place
//! to return lookahead it over-read past an entry's end.

use std::io::{self, Read, Write};

/// Wraps the archive's input stream, tracking the number of bytes consumed
/// from it and holding bytes pushed back by a lookahead reader.
#[derive(Debug)]
pub(crate) struct CountingReader<R> {
    inner: R,
    /// Bytes handed out so far — the archive offset of the next byte.
    offset: u64,
    /// Pushed-back bytes, served before the inner stream. Stored in
    /// stream order; `unread_at` indexes the next byte to serve.
    pushback: Vec<u8>,
    unread_at: usize,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            pushback: Vec::new(),
            unread_at: 0,
        }
    }

    /// The archive offset of the next byte this reader will yield.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns `bytes` to the stream; they will be yielded again, in order,
    /// before anything further from the inner stream. The offset rewinds
    /// accordingly.
    pub fn push_back(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        debug_assert!(self.offset >= bytes.len() as u64);
        self.offset -= bytes.len() as u64;
        if self.unread_at == self.pushback.len() {
            self.pushback.clear();
            self.unread_at = 0;
            self.pushback.extend_from_slice(bytes);
        } else {
            // Pushed-back bytes precede any still-pending ones.
            let mut merged = Vec::with_capacity(bytes.len() + self.pushback.len() - self.unread_at);
            merged.extend_from_slice(bytes);
            merged.extend_from_slice(&self.pushback[self.unread_at..]);
            self.pushback = merged;
            self.unread_at = 0;
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.unread_at < self.pushback.len() {
            let pending = &self.pushback[self.unread_at..];
            let n = pending.len().min(buf.len());
            buf[..n].copy_from_slice(&pending[..n]);
            self.unread_at += n;
            self.offset += n as u64;
            return Ok(n);
        }
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// Wraps the archive's output stream, tracking the number of bytes written.
#[derive(Debug)]
pub(crate) struct CountingWriter<W> {
    inner: W,
    offset: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, offset: 0 }
    }

    /// The archive offset of the next byte written.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
