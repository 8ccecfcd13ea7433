//! Turning an unbounded stream into a bounded one.
//!
//! Every entry's data is followed by more archive (the next header, the
//! central directory, ...) with nothing but the local header to say where
//! the data stops. When the header carries sizes, stopping is arithmetic.
//! When it promises a data descriptor instead, the only delimiter is the
//! descriptor's own signature, and file data may legitimately contain
//! bytes that look exactly like it — so a candidate only counts once the
//! fields after it agree with the CRC and byte counts of everything
//! yielded so far. The caller owns those tallies and renders the verdict;
//! this module finds candidates and recovers from the false ones.

use std::io::Read;

use log::*;

use crate::counter::CountingReader;
use crate::result::*;
use crate::spec::DATA_DESCRIPTOR_MAGIC;

const CHUNK: usize = 8 * 1024;
const SENTINEL_LEN: usize = DATA_DESCRIPTOR_MAGIC.len();

/// What the truncator currently has at its head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pull {
    /// Ordinary entry bytes are buffered; see [`TruncatedReader::buffered`].
    Data,
    /// A descriptor candidate sits at the head with its full validation
    /// tail buffered; see [`TruncatedReader::descriptor_tail`]. The caller
    /// must call [`TruncatedReader::accept_descriptor`] or
    /// [`TruncatedReader::reject_descriptor`] before anything else moves.
    Descriptor,
    /// The entry's bytes are exhausted.
    Eof,
}

#[derive(Debug)]
enum Mode {
    /// EOF after exactly the byte count promised by the local header.
    Fixed { unread: u64, expected: u64 },
    /// EOF at the next data descriptor that the caller validates.
    /// `tail_len` is 12 or 20 depending on the descriptor form in use.
    Sentinel { tail_len: usize },
}

/// Bounds an entry's bytes within its parent archive stream.
///
/// Exposes a `BufRead`-flavored `fill`/`consume` interface rather than
/// `Read` so the caller can feed a codec without copying, and so a
/// descriptor candidate can be surfaced, judged, and possibly rejected
/// without committing any bytes.
#[derive(Debug)]
pub(crate) struct TruncatedReader<'a, R: Read> {
    inner: &'a mut CountingReader<R>,
    mode: Mode,
    buf: Vec<u8>,
    /// Window of unconsumed bytes: `buf[start..end]`.
    start: usize,
    end: usize,
    /// Sentinel scan cursor; bytes before `scan_pos` have been examined.
    scan_pos: usize,
    /// Length of the partial signature match ending just before
    /// `scan_pos`. Persists across refills so a sentinel split between
    /// two reads is still found.
    match_len: usize,
    /// KMP failure function for the signature.
    failure: [usize; SENTINEL_LEN],
    /// Start of a complete signature match, if one is pending judgment.
    candidate: Option<usize>,
    /// Set when a candidate was rejected: the head byte must be released
    /// as plain data before scanning resumes, so the scanner can't lock
    /// onto the same position again. Cleared by the next consume.
    skip_once: bool,
    inner_eof: bool,
    eof: bool,
    yielded: u64,
}

fn failure_table(pattern: &[u8; SENTINEL_LEN]) -> [usize; SENTINEL_LEN] {
    let mut fail = [0usize; SENTINEL_LEN];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = fail[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        fail[i] = k;
    }
    fail
}

impl<'a, R: Read> TruncatedReader<'a, R> {
    /// Bounds the next `size` bytes of `inner`.
    pub fn fixed(inner: &'a mut CountingReader<R>, size: u64) -> Self {
        Self::new(inner, Mode::Fixed { unread: size, expected: size })
    }

    /// Bounds `inner` at the next data descriptor the caller accepts.
    /// `zip64` selects the 20-byte validation tail over the 12-byte one.
    pub fn sentinel(inner: &'a mut CountingReader<R>, zip64: bool) -> Self {
        let tail_len = if zip64 {
            crate::spec::DESCRIPTOR_TAIL_ZIP64
        } else {
            crate::spec::DESCRIPTOR_TAIL
        };
        Self::new(inner, Mode::Sentinel { tail_len })
    }

    fn new(inner: &'a mut CountingReader<R>, mode: Mode) -> Self {
        Self {
            inner,
            mode,
            buf: vec![0u8; CHUNK],
            start: 0,
            end: 0,
            scan_pos: 0,
            match_len: 0,
            failure: failure_table(&DATA_DESCRIPTOR_MAGIC),
            candidate: None,
            skip_once: false,
            inner_eof: false,
            eof: false,
            yielded: 0,
        }
    }

    /// Total bytes released to the caller so far.
    pub fn bytes_yielded(&self) -> u64 {
        self.yielded
    }

    /// Advances to the next head state, refilling from the underlying
    /// stream as needed.
    pub fn fill(&mut self) -> ZipResult<Pull> {
        if self.eof {
            return Ok(Pull::Eof);
        }
        match self.mode {
            Mode::Fixed { .. } => self.fill_fixed(),
            Mode::Sentinel { .. } => self.fill_sentinel(),
        }
    }

    /// The released data at the head. Only meaningful after [`fill`]
    /// returned [`Pull::Data`]; never empty then.
    ///
    /// [`fill`]: TruncatedReader::fill
    pub fn buffered(&self) -> &[u8] {
        let limit = if self.skip_once {
            self.start + 1
        } else if let Some(candidate) = self.candidate {
            candidate
        } else {
            match self.mode {
                Mode::Fixed { .. } => self.end,
                // Trailing bytes may be a partial signature; hold them.
                Mode::Sentinel { .. } => (self.scan_pos - self.match_len).max(self.start),
            }
        };
        &self.buf[self.start..limit.min(self.end)]
    }

    /// Marks `n` bytes of [`buffered`] as delivered downstream.
    ///
    /// [`buffered`]: TruncatedReader::buffered
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buffered().len());
        self.start += n;
        self.yielded += n as u64;
        if n > 0 && self.skip_once {
            // The rejected signature byte is gone; scanning may resume.
            self.skip_once = false;
        }
    }

    /// The 12- or 20-byte validation tail following the candidate
    /// signature. Only meaningful after [`fill`] returned
    /// [`Pull::Descriptor`].
    ///
    /// [`fill`]: TruncatedReader::fill
    pub fn descriptor_tail(&self) -> &[u8] {
        let Mode::Sentinel { tail_len } = self.mode else {
            unreachable!("descriptor_tail in fixed mode")
        };
        let candidate = self.candidate.expect("no descriptor candidate");
        debug_assert_eq!(candidate, self.start);
        &self.buf[candidate + SENTINEL_LEN..candidate + SENTINEL_LEN + tail_len]
    }

    /// Commits the candidate as the entry's real data descriptor: the
    /// signature and tail are consumed, surplus lookahead is returned to
    /// the archive stream, and the truncator reaches EOF.
    pub fn accept_descriptor(&mut self) {
        let Mode::Sentinel { tail_len } = self.mode else {
            unreachable!("accept_descriptor in fixed mode")
        };
        let candidate = self.candidate.take().expect("no descriptor candidate");
        debug_assert_eq!(candidate, self.start);
        let descriptor_end = candidate + SENTINEL_LEN + tail_len;
        self.inner.push_back(&self.buf[descriptor_end..self.end]);
        self.start = 0;
        self.end = 0;
        self.eof = true;
    }

    /// Declares the candidate a lookalike: its first byte becomes plain
    /// data (released before anything else) and the scan resumes one byte
    /// past where the false match began.
    pub fn reject_descriptor(&mut self) {
        let candidate = self.candidate.take().expect("no descriptor candidate");
        debug_assert_eq!(candidate, self.start);
        trace!("Rejected data descriptor lookalike after {} bytes", self.yielded);
        self.scan_pos = candidate + 1;
        self.match_len = 0;
        self.skip_once = true;
    }

    fn fill_fixed(&mut self) -> ZipResult<Pull> {
        loop {
            if self.start < self.end {
                return Ok(Pull::Data);
            }
            let Mode::Fixed { unread, expected } = self.mode else {
                unreachable!()
            };
            if unread == 0 {
                self.eof = true;
                return Ok(Pull::Eof);
            }
            if self.inner_eof || self.refill()? == 0 {
                return Err(ZipError::TruncatedData {
                    expected,
                    actual: self.yielded,
                });
            }
        }
    }

    fn fill_sentinel(&mut self) -> ZipResult<Pull> {
        let Mode::Sentinel { tail_len } = self.mode else {
            unreachable!()
        };
        loop {
            if self.skip_once {
                return Ok(Pull::Data);
            }
            self.scan();
            if let Some(candidate) = self.candidate {
                if candidate > self.start {
                    return Ok(Pull::Data);
                }
                // Candidate at the head. The caller may only judge it
                // against the complete tail; refill until it's all here.
                if self.end - self.start >= SENTINEL_LEN + tail_len {
                    return Ok(Pull::Descriptor);
                }
            } else if self.scan_pos - self.match_len > self.start {
                return Ok(Pull::Data);
            }
            if self.inner_eof {
                return Err(ZipError::SentinelNotFound {
                    scanned: self.yielded,
                });
            }
            self.refill()?;
        }
    }

    /// KMP over the unscanned window, stopping at the first complete
    /// signature match.
    fn scan(&mut self) {
        if self.candidate.is_some() {
            return;
        }
        while self.scan_pos < self.end {
            let byte = self.buf[self.scan_pos];
            while self.match_len > 0 && byte != DATA_DESCRIPTOR_MAGIC[self.match_len] {
                self.match_len = self.failure[self.match_len - 1];
            }
            if byte == DATA_DESCRIPTOR_MAGIC[self.match_len] {
                self.match_len += 1;
            }
            self.scan_pos += 1;
            if self.match_len == SENTINEL_LEN {
                self.candidate = Some(self.scan_pos - SENTINEL_LEN);
                self.match_len = 0;
                return;
            }
        }
    }

    fn refill(&mut self) -> ZipResult<usize> {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.scan_pos = self.scan_pos.saturating_sub(self.start);
            if let Some(candidate) = self.candidate.as_mut() {
                *candidate -= self.start;
            }
            self.start = 0;
        }
        let room = match self.mode {
            Mode::Fixed { unread, .. } => {
                (self.buf.len() - self.end).min(unread.min(usize::MAX as u64) as usize)
            }
            Mode::Sentinel { .. } => self.buf.len() - self.end,
        };
        if room == 0 {
            return Ok(0);
        }
        let n = self.inner.read(&mut self.buf[self.end..self.end + room])?;
        if n == 0 {
            self.inner_eof = true;
        } else {
            self.end += n;
            if let Mode::Fixed { unread, .. } = &mut self.mode {
                *unread -= n as u64;
            }
        }
        Ok(n)
    }
}
