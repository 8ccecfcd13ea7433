//! Error types and the related `Result<T>`

use thiserror::Error;

pub type ZipResult<T> = Result<T, ZipError>;

#[derive(Debug, Error)]
pub enum ZipError {
    /// An error from underlying I/O
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    /// The stream ended in the middle of a record.
    #[error("Unexpected end of stream at offset {0}")]
    UnexpectedEof(u64),

    /// A record began with the wrong magic number.
    #[error("Bad signature {found:#010x} at offset {offset}, expected {expected}")]
    BadSignature {
        expected: &'static str,
        found: u32,
        offset: u64,
    },

    /// The entry uses a compression method other than Store or Deflate.
    #[error("Unsupported compression method {0}")]
    UnsupportedCompression(u16),

    /// A timestamp outside the MS-DOS range (1980..=2107, even seconds),
    /// or a field combination no calendar accepts.
    #[error("Bad MS-DOS datetime: {0}")]
    BadDateTime(String),

    /// The stream ended before a valid data descriptor was located.
    #[error("No valid data descriptor found after {scanned} bytes")]
    SentinelNotFound { scanned: u64 },

    /// The stream ended before an entry's declared data did.
    #[error("Entry data truncated: expected {expected} bytes, got {actual}")]
    TruncatedData { expected: u64, actual: u64 },

    /// The CRC-32 of an entry's bytes disagrees with its header.
    #[error("CRC-32 mismatch: computed {computed:#010x}, declared {declared:#010x}")]
    CrcMismatch { computed: u32, declared: u32 },

    /// An entry's byte count disagrees with its header.
    #[error("Size mismatch: observed {observed} bytes, declared {declared}")]
    SizeMismatch { observed: u64, declared: u64 },

    /// Two entries share a name or a local header offset.
    #[error("Duplicate entry: {0}")]
    DuplicateEntry(String),

    /// The central directory disagrees with the local headers seen
    /// while streaming.
    #[error("Central directory inconsistent with streamed entries: {0}")]
    InconsistentCentralDirectory(String),

    /// ZIP64 was disabled by the caller but the entry needs it.
    #[error("Entry of {0} bytes requires ZIP64, which is disabled")]
    SizeTooLarge(u64),

    /// An entry name with a drive specifier, empty segment,
    /// or unexpected trailing slash.
    #[error("Invalid entry path: {0}")]
    InvalidPath(String),

    /// A write after the entry (or archive) was finished.
    #[error("Entry is already closed")]
    ClosedSink,

    /// Decoding a UTF-8 name or comment failed
    #[error("Invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// The compressor or decompressor gave up; the entry is unusable.
    #[error("Codec error: {0}")]
    Codec(String),

    /// The archive contained invalid data per APPNOTE.TXT.
    #[error("Invalid Zip archive: {0}")]
    InvalidArchive(&'static str),
}

impl ZipError {
    /// Maps `read_exact`-style EOF onto [`ZipError::UnexpectedEof`] with the
    /// archive offset where the record began.
    pub(crate) fn from_io_at(err: std::io::Error, offset: u64) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ZipError::UnexpectedEof(offset)
        } else {
            ZipError::Io(err)
        }
    }
}

impl From<ZipError> for std::io::Error {
    fn from(err: ZipError) -> Self {
        match err {
            ZipError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
