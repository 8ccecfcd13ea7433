//! Running CRC-32 and byte accounting for one side of a transfer.
//!
//! The hasher setup is the one zip-rs popularised:
//! <https://github.com/mvdnes/zip-rs/commit/b3c836d9c32efa120cdd5366280f940d3c3b985c>

use crc32fast::Hasher;

/// A CRC-32 (IEEE, final XOR with all-ones — the ZIP flavor) plus a count
/// of the bytes hashed so far.
///
/// Entry cursors keep two of these, one per side of the codec, so the
/// compressed and decompressed byte counts are available at any moment.
/// Callers must update the tally *before* surfacing the bytes onward;
/// the data-descriptor self-validation compares against it mid-stream.
#[derive(Clone, Default)]
pub(crate) struct Crc32Tally {
    hasher: Hasher,
    bytes: u64,
}

impl Crc32Tally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, buf: &[u8]) {
        self.hasher.update(buf);
        self.bytes += buf.len() as u64;
    }

    /// Count bytes without hashing them.
    ///
    /// The compressed side of an entry only needs the counter.
    pub fn count(&mut self, n: u64) {
        self.bytes += n;
    }

    /// The finalised CRC-32 of everything hashed so far.
    pub fn crc32(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl std::fmt::Debug for Crc32Tally {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crc32Tally")
            .field("crc32", &format_args!("{:#010x}", self.crc32()))
            .field("bytes", &self.bytes)
            .finish()
    }
}
