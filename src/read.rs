//! Tools for reading a ZIP archive off a non-seekable stream.
//!
//! To start reading, create an [`ArchiveReader`] from anything
//! implementing [`Read`] and pull entries out of it one at a time:
//!
//! ```no_run
//! # use std::io;
//! # use zipflow::ArchiveReader;
//! let mut archive = ArchiveReader::new(io::stdin().lock());
//! while let Some(mut entry) = archive.next_entry()? {
//!     println!("{}", entry.info().name);
//!     io::copy(&mut entry, &mut io::sink())?;
//! }
//! // Optionally reconcile everything against the central directory:
//! assert!(archive.validate()?);
//! # Ok::<(), zipflow::ZipError>(())
//! ```
//!
//! Entries are surfaced as soon as their local file header has been read,
//! long before the central directory (which a pipe only delivers at the
//! very end) is available. [`ArchiveReader::validate`] replays that
//! directory against what actually streamed by once the entries are done.
//!
//! [`Read`]: std::io::Read

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use camino::Utf8Path;
use chrono::NaiveDateTime;
use flate2::{Decompress, FlushDecompress, Status};
use log::*;

use crate::counter::CountingReader;
use crate::crc::Crc32Tally;
use crate::result::*;
use crate::spec::{self, CentralDirectoryHeader, LocalFileHeader};
use crate::truncate::{Pull, TruncatedReader};
use crate::validate;

/// The compression method used to store a file.
///
/// Anything other than these two is rejected while parsing; there is no
/// "unsupported" variant to carry around.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    /// The file is stored uncompressed.
    Store,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
}

impl CompressionMethod {
    pub(crate) fn from_u16(u: u16) -> ZipResult<Self> {
        match u {
            0 => Ok(CompressionMethod::Store),
            8 => Ok(CompressionMethod::Deflate),
            v => Err(ZipError::UnsupportedCompression(v)),
        }
    }

    pub(crate) fn to_u16(self) -> u16 {
        match self {
            CompressionMethod::Store => 0,
            CompressionMethod::Deflate => 8,
        }
    }
}

/// Metadata for a file or directory in the archive.
///
/// While streaming this comes from the entry's local file header — the
/// only record available before the data. For entries written with a data
/// descriptor, the sizes and CRC are zero until the descriptor is reached
/// at end of entry, at which point the values recorded here are replaced
/// with the descriptor's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Compression algorithm used to store the file
    pub compression_method: CompressionMethod,

    /// Compressed size of the file in bytes
    pub compressed_size: u64,

    /// Uncompressed size of the file in bytes
    pub uncompressed_size: u64,

    /// Modification time, at the 2-second resolution MS-DOS allows
    pub last_modified: NaiveDateTime,

    /// The CRC-32 of the decompressed file
    pub crc32: u32,

    /// The provided path of the file. Forward slash is the only
    /// delimiter; directories end with one.
    pub name: String,

    /// True if the sizes and CRC above were deferred to a data
    /// descriptor after the file data.
    pub descriptor_follows: bool,

    /// True if the name (and comment) were UTF-8 rather than CP437.
    pub utf8: bool,

    /// True if the header carried a Zip64 extended information field.
    pub zip64: bool,

    /// Size of the header's extra field as observed on parse.
    pub extra_field_size: u16,
}

impl FileInfo {
    /// Returns true if the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }

    /// Returns true if the entry is a file.
    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }

    /// The entry's name, viewed as a path.
    pub fn path(&self) -> &Utf8Path {
        Utf8Path::new(&self.name)
    }

    /// Extracts `FileInfo` from a parsed local file header.
    pub(crate) fn from_local(header: &LocalFileHeader) -> ZipResult<Self> {
        let utf8 = spec::is_utf8(header.flags);
        Ok(Self {
            compression_method: CompressionMethod::from_u16(header.compression_method)?,
            compressed_size: header.compressed_size,
            uncompressed_size: header.uncompressed_size,
            last_modified: spec::dos_datetime(header.last_modified_date, header.last_modified_time)?,
            crc32: header.crc32,
            name: spec::decode_text(&header.name, utf8)?,
            descriptor_follows: spec::has_data_descriptor(header.flags),
            utf8,
            zip64: header.zip64,
            extra_field_size: header.extra_field_len,
        })
    }
}

/// One central directory record: a [`FileInfo`] plus the fields only the
/// directory carries.
#[derive(Debug, Clone)]
pub struct CdEntry {
    pub info: FileInfo,
    /// Byte position of the entry's local file header in the archive.
    pub offset: u64,
    /// Per-entry comment.
    pub comment: String,
    /// Directory bit from the external attributes, or a trailing slash.
    pub is_directory: bool,
}

impl CdEntry {
    pub(crate) fn from_central(header: &CentralDirectoryHeader) -> ZipResult<Self> {
        let utf8 = spec::is_utf8(header.flags);
        let name = spec::decode_text(&header.name, utf8)?;
        let is_directory = header.external_attributes & 0x10 != 0 || name.ends_with('/');
        Ok(Self {
            info: FileInfo {
                compression_method: CompressionMethod::from_u16(header.compression_method)?,
                compressed_size: header.compressed_size,
                uncompressed_size: header.uncompressed_size,
                last_modified: spec::dos_datetime(
                    header.last_modified_date,
                    header.last_modified_time,
                )?,
                crc32: header.crc32,
                name,
                descriptor_follows: spec::has_data_descriptor(header.flags),
                utf8,
                zip64: header.zip64,
                extra_field_size: header.extra_field_len,
            },
            offset: header.header_offset,
            comment: spec::decode_text(&header.comment, utf8)?,
            is_directory,
        })
    }
}

/// What the inter-entry signature hunt ran into.
enum Found {
    /// A local file header begins at the given archive offset.
    LocalFile(u64),
    /// The first central directory header: no more files.
    CentralDirectory,
}

/// A ZIP archive being read front to back off a stream.
///
/// Never seeks; never trusts the central directory for iteration. Each
/// local file header is parsed as it floats by and handed out as an
/// [`EntryReader`]. Once the central directory signature is seen the
/// iteration ends, and [`validate`] can reconcile the directory against
/// everything observed.
///
/// [`validate`]: ArchiveReader::validate
pub struct ArchiveReader<R: Read> {
    reader: CountingReader<R>,
    entries: Vec<FileInfo>,
    offsets: Vec<u64>,
    no_more_files: bool,
    /// An entry was dropped mid-data; the stream position is unknowable
    /// without a seek, so the cursor refuses to continue.
    poisoned: bool,
    /// AND of the verdicts of every per-entry validation run so far.
    entries_ok: bool,
    verdict: Option<bool>,
}

impl ArchiveReader<BufReader<File>> {
    /// Opens an archive file for streaming. The file is read strictly
    /// front to back; no seeking happens even though a file could.
    pub fn open<P: AsRef<Path>>(path: P) -> ZipResult<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: Read> ArchiveReader<R> {
    /// Starts reading a ZIP archive from `reader`. Pass `&mut stream` to
    /// keep ownership of the stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader: CountingReader::new(reader),
            entries: Vec::new(),
            offsets: Vec::new(),
            no_more_files: false,
            poisoned: false,
            entries_ok: true,
            verdict: None,
        }
    }

    /// The `FileInfo` of every local header seen so far, in stream order.
    /// Includes directory entries the iterator skipped.
    pub fn entries(&self) -> &[FileInfo] {
        &self.entries
    }

    /// Archive offsets of the headers in [`entries`](ArchiveReader::entries).
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Total bytes consumed from the underlying stream.
    pub fn offset(&self) -> u64 {
        self.reader.offset()
    }

    /// Returns the underlying stream.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    /// Advances to the next file in the archive, or `None` once the
    /// central directory begins. Directory entries are recorded but
    /// skipped. The previous entry must have been read to EOF (or
    /// validated) first; a half-read entry poisons the cursor.
    pub fn next_entry(&mut self) -> ZipResult<Option<EntryReader<'_, R>>> {
        if self.poisoned {
            return Err(ZipError::InvalidArchive(
                "an entry was abandoned mid-data; the archive cursor is unusable",
            ));
        }
        if self.no_more_files {
            return Ok(None);
        }
        loop {
            match self.scan_signature()? {
                Found::CentralDirectory => {
                    self.no_more_files = true;
                    return Ok(None);
                }
                Found::LocalFile(offset) => {
                    let (header, _) = LocalFileHeader::parse(&mut self.reader, offset)?;
                    let info = FileInfo::from_local(&header)?;
                    debug!("{info:?} at offset {offset}");
                    self.offsets.push(offset);
                    self.entries.push(info);
                    let info = self.entries.last().unwrap();
                    if info.is_dir() {
                        trace!("Skipping directory entry {:?}", info.name);
                        continue;
                    }
                    break;
                }
            }
        }

        let ArchiveReader {
            reader,
            entries,
            poisoned,
            entries_ok,
            ..
        } = self;
        let info = entries.last_mut().unwrap();
        let trunc = if info.descriptor_follows {
            TruncatedReader::sentinel(reader, info.zip64)
        } else {
            TruncatedReader::fixed(reader, info.compressed_size)
        };
        let codec = match info.compression_method {
            CompressionMethod::Store => Codec::Store,
            CompressionMethod::Deflate => Codec::Deflate {
                decomp: Box::new(Decompress::new(false)),
                done: false,
            },
        };
        Ok(Some(EntryReader {
            trunc,
            codec,
            crc: Crc32Tally::new(),
            raw: Crc32Tally::new(),
            info,
            poisoned,
            entries_ok,
            eof: false,
            verdict: None,
        }))
    }

    /// Drains any remaining entries (validating each into `sink`), then
    /// reads the central directory and reconciles it against every local
    /// header observed. `true` means everything matched. The verdict is
    /// cached; a second call does no I/O.
    pub fn validate_into<W: Write>(&mut self, sink: &mut W) -> ZipResult<bool> {
        if let Some(verdict) = self.verdict {
            return Ok(verdict);
        }
        while let Some(mut entry) = self.next_entry()? {
            entry.validate_into(sink)?;
        }
        let directory_ok = validate::reconcile(&mut self.reader, &self.entries, &self.offsets)?;
        let verdict = directory_ok && self.entries_ok;
        self.verdict = Some(verdict);
        Ok(verdict)
    }

    /// [`validate_into`](ArchiveReader::validate_into) with remaining
    /// entry data discarded.
    pub fn validate(&mut self) -> ZipResult<bool> {
        self.validate_into(&mut io::sink())
    }

    /// Hunts for the next record signature: bytes between entries
    /// (alignment junk, descriptors of streams we skipped, ...) are
    /// discarded until a local file header or central directory header
    /// turns up.
    fn scan_signature(&mut self) -> ZipResult<Found> {
        let mut window = [0u8; 4];
        let start = self.reader.offset();
        self.reader
            .read_exact(&mut window)
            .map_err(|e| ZipError::from_io_at(e, start))?;
        let mut skipped = 0u64;
        loop {
            if window[..2] == [b'P', b'K'] {
                let found = match (window[2], window[3]) {
                    (3, 4) => Some(Found::LocalFile(self.reader.offset() - 4)),
                    // An archive with zero entries has no central
                    // directory header either; its end records are the
                    // first thing the scan runs into.
                    (1, 2) | (5, 6) | (6, 6) => Some(Found::CentralDirectory),
                    _ => None,
                };
                if let Some(found) = found {
                    if skipped > 0 {
                        debug!(
                            "Skipped {skipped} bytes of inter-entry garbage before offset {}",
                            self.reader.offset() - 4
                        );
                    }
                    // Give the signature back; record parsers read it.
                    self.reader.push_back(&window);
                    return Ok(found);
                }
            }
            // Slide to the next possible signature start.
            let shift = match memchr::memchr(b'P', &window[1..]) {
                Some(p) => p + 1,
                None => window.len(),
            };
            window.copy_within(shift.., 0);
            let refill_at = window.len() - shift;
            let offset = self.reader.offset();
            self.reader
                .read_exact(&mut window[refill_at..])
                .map_err(|e| ZipError::from_io_at(e, offset))?;
            skipped += shift as u64;
        }
    }
}

/// The decompression side of one entry's pipeline.
///
/// The raw [`Decompress`] state machine is driven by hand (rather than
/// through `flate2`'s reader adapters) because sentinel-mode entries need
/// to pause at a descriptor candidate and *resume* if it turns out to be
/// file data — an adapter treats that pause as EOF and errors out.
#[derive(Debug)]
enum Codec {
    Store,
    Deflate { decomp: Box<Decompress>, done: bool },
}

impl Codec {
    fn quiescent(&self) -> bool {
        match self {
            Codec::Store => true,
            Codec::Deflate { done, .. } => *done,
        }
    }
}

/// Reads one entry's decompressed bytes.
///
/// The pipeline is truncator → codec → CRC/byte tallies; the tallies are
/// updated before bytes reach the caller, and in sentinel mode they are
/// exactly what a descriptor candidate is validated against. Implements
/// [`Read`]; after EOF, [`validate`](EntryReader::validate) renders a
/// verdict against the entry's header (or its descriptor).
///
/// Dropping an `EntryReader` before EOF leaves the archive stream pointed
/// into the middle of the entry's data, which a non-seekable cursor can
/// never recover from; the parent archive refuses further iteration.
#[derive(Debug)]
pub struct EntryReader<'a, R: Read> {
    trunc: TruncatedReader<'a, R>,
    codec: Codec,
    /// CRC and count of decompressed bytes surfaced to the caller.
    crc: Crc32Tally,
    /// Count of compressed bytes consumed from the truncator.
    raw: Crc32Tally,
    info: &'a mut FileInfo,
    poisoned: &'a mut bool,
    entries_ok: &'a mut bool,
    eof: bool,
    verdict: Option<bool>,
}

impl<R: Read> EntryReader<'_, R> {
    /// The entry's metadata. For descriptor entries the sizes and CRC
    /// become authoritative only once the entry has been read to EOF.
    pub fn info(&self) -> &FileInfo {
        self.info
    }

    /// Compressed bytes consumed so far.
    pub fn bytes_in(&self) -> u64 {
        self.raw.bytes()
    }

    /// Decompressed bytes produced so far.
    pub fn bytes_out(&self) -> u64 {
        self.crc.bytes()
    }

    fn read_inner(&mut self, out: &mut [u8]) -> ZipResult<usize> {
        if out.is_empty() || self.eof {
            return Ok(0);
        }
        loop {
            match self.trunc.fill()? {
                Pull::Data => match &mut self.codec {
                    Codec::Store => {
                        let input = self.trunc.buffered();
                        let n = input.len().min(out.len());
                        out[..n].copy_from_slice(&input[..n]);
                        self.raw.count(n as u64);
                        self.crc.update(&out[..n]);
                        self.trunc.consume(n);
                        return Ok(n);
                    }
                    Codec::Deflate { decomp, done } => {
                        if *done {
                            // Entry bytes past the end of the deflate
                            // stream: count them, surface nothing.
                            let surplus = self.trunc.buffered().len();
                            self.raw.count(surplus as u64);
                            self.trunc.consume(surplus);
                            continue;
                        }
                        let input = self.trunc.buffered();
                        let before_in = decomp.total_in();
                        let before_out = decomp.total_out();
                        let status = decomp
                            .decompress(input, out, FlushDecompress::None)
                            .map_err(|e| ZipError::Codec(format!("inflate: {e}")))?;
                        let consumed = (decomp.total_in() - before_in) as usize;
                        let produced = (decomp.total_out() - before_out) as usize;
                        if status == Status::StreamEnd {
                            *done = true;
                        }
                        self.raw.count(consumed as u64);
                        self.crc.update(&out[..produced]);
                        self.trunc.consume(consumed);
                        if produced > 0 {
                            return Ok(produced);
                        }
                        if consumed == 0 && !*done {
                            return Err(ZipError::Codec(
                                "inflate made no progress".to_owned(),
                            ));
                        }
                    }
                },
                Pull::Descriptor => {
                    if let Codec::Deflate { decomp, done } = &mut self.codec {
                        if !*done {
                            // Flush whatever output the codec still owes
                            // before the tallies are compared to anything.
                            let before_out = decomp.total_out();
                            let status = decomp
                                .decompress(&[], out, FlushDecompress::None)
                                .map_err(|e| ZipError::Codec(format!("inflate: {e}")))?;
                            let produced = (decomp.total_out() - before_out) as usize;
                            if status == Status::StreamEnd {
                                *done = true;
                            }
                            if produced > 0 {
                                self.crc.update(&out[..produced]);
                                return Ok(produced);
                            }
                        }
                    }
                    let mut tail = [0u8; spec::DESCRIPTOR_TAIL_ZIP64];
                    let tail_len = {
                        let slice = self.trunc.descriptor_tail();
                        tail[..slice.len()].copy_from_slice(slice);
                        slice.len()
                    };
                    match self.judge_descriptor(&tail[..tail_len]) {
                        Some((crc32, compressed, uncompressed)) => {
                            self.trunc.accept_descriptor();
                            // The descriptor is the authority; the local
                            // header's zeros get replaced for good.
                            self.info.crc32 = crc32;
                            self.info.compressed_size = compressed;
                            self.info.uncompressed_size = uncompressed;
                            self.eof = true;
                            return Ok(0);
                        }
                        None => self.trunc.reject_descriptor(),
                    }
                }
                Pull::Eof => {
                    if let Codec::Deflate { decomp, done } = &mut self.codec {
                        if !*done {
                            let before_out = decomp.total_out();
                            let status = decomp
                                .decompress(&[], out, FlushDecompress::Finish)
                                .map_err(|e| ZipError::Codec(format!("inflate: {e}")))?;
                            let produced = (decomp.total_out() - before_out) as usize;
                            if status == Status::StreamEnd {
                                *done = true;
                            }
                            if produced > 0 {
                                self.crc.update(&out[..produced]);
                                return Ok(produced);
                            }
                            if !*done {
                                return Err(ZipError::Codec(
                                    "deflate stream ended prematurely".to_owned(),
                                ));
                            }
                        }
                    }
                    self.eof = true;
                    return Ok(0);
                }
            }
        }
    }

    /// A descriptor candidate is real exactly when the codec has no bytes
    /// in flight and the descriptor's CRC and sizes equal the running
    /// tallies of what already streamed past.
    fn judge_descriptor(&self, tail: &[u8]) -> Option<(u32, u64, u64)> {
        let crc32 = u32::from_le_bytes(tail[..4].try_into().unwrap());
        let (compressed, uncompressed) = if tail.len() == spec::DESCRIPTOR_TAIL_ZIP64 {
            (
                u64::from_le_bytes(tail[4..12].try_into().unwrap()),
                u64::from_le_bytes(tail[12..20].try_into().unwrap()),
            )
        } else {
            (
                u32::from_le_bytes(tail[4..8].try_into().unwrap()) as u64,
                u32::from_le_bytes(tail[8..12].try_into().unwrap()) as u64,
            )
        };
        (self.codec.quiescent()
            && crc32 == self.crc.crc32()
            && compressed == self.raw.bytes()
            && uncompressed == self.crc.bytes())
        .then_some((crc32, compressed, uncompressed))
    }

    /// Drains the rest of the entry into `sink` and renders a verdict.
    ///
    /// For fixed-size entries the byte counts and CRC must match the
    /// local header; each mismatch is logged as a warning. For descriptor
    /// entries, reaching EOF at all means the descriptor validated
    /// against the stream, and its values have replaced the header's.
    /// The verdict is cached; repeated calls re-read nothing.
    pub fn validate_into<W: Write>(&mut self, sink: &mut W) -> ZipResult<bool> {
        if let Some(verdict) = self.verdict {
            return Ok(verdict);
        }
        let mut buf = [0u8; 8 * 1024];
        loop {
            let n = self.read_inner(&mut buf)?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])?;
        }
        let verdict = if self.info.descriptor_follows {
            true
        } else {
            let mut ok = true;
            if self.raw.bytes() != self.info.compressed_size {
                warn!(
                    "{:?}: {}",
                    self.info.name,
                    ZipError::SizeMismatch {
                        observed: self.raw.bytes(),
                        declared: self.info.compressed_size,
                    }
                );
                ok = false;
            }
            if self.crc.bytes() != self.info.uncompressed_size {
                warn!(
                    "{:?}: {}",
                    self.info.name,
                    ZipError::SizeMismatch {
                        observed: self.crc.bytes(),
                        declared: self.info.uncompressed_size,
                    }
                );
                ok = false;
            }
            if self.crc.crc32() != self.info.crc32 {
                warn!(
                    "{:?}: {}",
                    self.info.name,
                    ZipError::CrcMismatch {
                        computed: self.crc.crc32(),
                        declared: self.info.crc32,
                    }
                );
                ok = false;
            }
            ok
        };
        self.verdict = Some(verdict);
        *self.entries_ok &= verdict;
        Ok(verdict)
    }

    /// [`validate_into`](EntryReader::validate_into) with the remaining
    /// data discarded.
    pub fn validate(&mut self) -> ZipResult<bool> {
        self.validate_into(&mut io::sink())
    }
}

impl<R: Read> Read for EntryReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_inner(buf).map_err(Into::into)
    }
}

impl<R: Read> Drop for EntryReader<'_, R> {
    fn drop(&mut self) {
        if !self.eof {
            warn!(
                "Entry {:?} dropped before its data was exhausted; \
                 the archive cursor can no longer be used",
                self.info.name
            );
            *self.poisoned = true;
        }
    }
}
