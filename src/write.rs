//! Tools for writing a ZIP archive onto a non-seekable stream.
//!
//! Nothing here ever back-patches a header, so the output can go straight
//! into a socket or pipe. Streamed entries get their sizes and CRC from a
//! data descriptor after the data; the central directory and its end
//! record are emitted when the archive is finished:
//!
//! ```no_run
//! # use std::io::Write;
//! # use zipflow::{ArchiveWriter, EntryOptions};
//! let mut archive = ArchiveWriter::new(Vec::new());
//! let mut entry = archive.create_entry("hello.txt", &EntryOptions::default())?;
//! entry.write_all(b"Hello!")?;
//! entry.finish()?;
//! let bytes = archive.finish()?;
//! # Ok::<(), zipflow::ZipError>(())
//! ```

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use chrono::NaiveDateTime;
use flate2::{Compress, Compression, FlushCompress, Status};
use log::*;

use crate::counter::CountingWriter;
use crate::crc::Crc32Tally;
use crate::read::{CdEntry, CompressionMethod, FileInfo};
use crate::result::*;
use crate::spec::{self, CentralDirectoryHeader, LocalFileHeader};

/// When to emit Zip64 structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Zip64Mode {
    /// Promote whenever a size, offset, or count outgrows its classical
    /// field.
    #[default]
    Auto,
    /// Emit Zip64 records unconditionally.
    Always,
    /// Refuse with [`ZipError::SizeTooLarge`] instead of promoting.
    /// Streamed entries still carry their (placeholder) Zip64 extra
    /// field, since their descriptors always use 64-bit sizes.
    Never,
}

/// Archive-wide settings.
#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    /// Comment stored in the end-of-central-directory record.
    pub comment: String,
    pub zip64: Zip64Mode,
}

/// Per-entry settings.
#[derive(Debug, Clone)]
pub struct EntryOptions {
    pub compression: CompressionMethod,
    /// Encode the name (and comment) as UTF-8 instead of CP437. Names
    /// CP437 can't express are promoted to UTF-8 regardless.
    pub utf8: bool,
    /// Materialise missing parent directories instead of rejecting the
    /// entry.
    pub make_path: bool,
    /// Per-entry comment for the central directory.
    pub comment: String,
    /// Modification time; the current time when `None`.
    pub last_modified: Option<NaiveDateTime>,
}

impl Default for EntryOptions {
    fn default() -> Self {
        Self {
            compression: CompressionMethod::Deflate,
            utf8: false,
            make_path: false,
            comment: String::new(),
            last_modified: None,
        }
    }
}

impl EntryOptions {
    fn timestamp(&self) -> NaiveDateTime {
        self.last_modified
            .unwrap_or_else(|| chrono::Local::now().naive_local())
    }
}

/// Collapses slash runs and checks every segment, per APPNOTE 4.4.17:
/// forward slashes only, no leading slash, no drive letters. `.` and `..`
/// are ordinary names in an archive, not navigation.
fn normalize_name(name: &str, directory: bool) -> ZipResult<String> {
    let mut collapsed = String::with_capacity(name.len());
    let mut last_slash = false;
    for c in name.chars() {
        if c == '/' {
            if last_slash {
                continue;
            }
            last_slash = true;
        } else {
            last_slash = false;
        }
        collapsed.push(c);
    }

    let stem = match collapsed.strip_suffix('/') {
        Some(stem) if directory => stem,
        Some(_) => {
            return Err(ZipError::InvalidPath(format!(
                "file name {name:?} ends with a slash"
            )));
        }
        None => &collapsed,
    };
    if stem.is_empty() {
        return Err(ZipError::InvalidPath(format!("empty entry name {name:?}")));
    }
    for segment in stem.split('/') {
        if segment.is_empty() {
            return Err(ZipError::InvalidPath(format!(
                "empty path segment in {name:?}"
            )));
        }
        if segment.contains(':') {
            return Err(ZipError::InvalidPath(format!(
                "drive or device specifier in {name:?}"
            )));
        }
    }
    Ok(collapsed)
}

/// A ZIP archive being written front to back onto a stream.
///
/// At most one [`EntryWriter`] is open at a time (the borrow checker
/// enforces it); an entry dropped without [`EntryWriter::finish`] is
/// closed implicitly with a warning. [`finish`](ArchiveWriter::finish)
/// emits the central directory and end records and hands the stream back.
pub struct ArchiveWriter<W: Write> {
    writer: CountingWriter<W>,
    directory: Vec<CdEntry>,
    materialised: HashSet<String>,
    options: ArchiveOptions,
    entry_open: bool,
}

impl ArchiveWriter<BufWriter<File>> {
    /// Creates an archive file and writes it front to back.
    pub fn create<P: AsRef<Path>>(path: P) -> ZipResult<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> ArchiveWriter<W> {
    /// Starts an archive with default options. Pass `&mut stream` to keep
    /// ownership of the stream.
    pub fn new(writer: W) -> Self {
        Self::with_options(writer, ArchiveOptions::default())
    }

    pub fn with_options(writer: W, options: ArchiveOptions) -> Self {
        Self {
            writer: CountingWriter::new(writer),
            directory: Vec::new(),
            materialised: HashSet::new(),
            options,
            entry_open: false,
        }
    }

    /// Total bytes written to the underlying stream.
    pub fn offset(&self) -> u64 {
        self.writer.offset()
    }

    /// Central directory entries recorded so far.
    pub fn directory(&self) -> &[CdEntry] {
        &self.directory
    }

    /// Opens a streamed entry. Its local header promises a data
    /// descriptor, so nothing about the data needs to be known up front;
    /// the entry must be [`finish`](EntryWriter::finish)ed before the
    /// archive can continue.
    pub fn create_entry(&mut self, name: &str, options: &EntryOptions) -> ZipResult<EntryWriter<'_, W>> {
        let name = self.prepare_entry(name, options)?;
        if self.entry_open {
            // Only reachable if a previous writer leaked without running
            // its destructor; its descriptor never got written.
            warn!("Opening {name:?} while another entry is still open");
        }
        let info = FileInfo {
            compression_method: options.compression,
            compressed_size: 0,
            uncompressed_size: 0,
            last_modified: options.timestamp(),
            crc32: 0,
            name,
            descriptor_follows: true,
            utf8: options.utf8,
            // Streamed entries always carry the Zip64 placeholder; the
            // descriptor uses 64-bit sizes no matter how small the data.
            zip64: true,
            extra_field_size: 0,
        };
        let offset = self.writer.offset();
        LocalFileHeader::write(&mut self.writer, &info, self.options.zip64)?;
        let data_start = self.writer.offset();
        self.entry_open = true;
        let codec = match options.compression {
            CompressionMethod::Store => WriteCodec::Store,
            CompressionMethod::Deflate => {
                WriteCodec::Deflate(Box::new(Compress::new(Compression::default(), false)))
            }
        };
        Ok(EntryWriter {
            writer: &mut self.writer,
            directory: &mut self.directory,
            entry_open: &mut self.entry_open,
            info: Some(info),
            comment: options.comment.clone(),
            offset,
            data_start,
            crc: Crc32Tally::new(),
            codec,
            scratch: vec![0u8; 8 * 1024].into_boxed_slice(),
            finished: false,
        })
    }

    /// Writes a complete entry in one shot. With the data in hand the
    /// sizes and CRC go straight into the local header — no descriptor,
    /// and no Zip64 unless the data demands it.
    pub fn add_entry(&mut self, name: &str, data: &[u8], options: &EntryOptions) -> ZipResult<()> {
        let name = self.prepare_entry(name, options)?;
        let mut tally = Crc32Tally::new();
        tally.update(data);
        let compressed: Vec<u8>;
        let payload: &[u8] = match options.compression {
            CompressionMethod::Store => data,
            CompressionMethod::Deflate => {
                let mut encoder =
                    flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                compressed = encoder.finish()?;
                &compressed
            }
        };
        let info = FileInfo {
            compression_method: options.compression,
            compressed_size: payload.len() as u64,
            uncompressed_size: data.len() as u64,
            last_modified: options.timestamp(),
            crc32: tally.crc32(),
            name,
            descriptor_follows: false,
            utf8: options.utf8,
            zip64: false,
            extra_field_size: 0,
        };
        let offset = self.writer.offset();
        LocalFileHeader::write(&mut self.writer, &info, self.options.zip64)?;
        self.writer.write_all(payload)?;
        self.directory.push(CdEntry {
            info,
            offset,
            comment: options.comment.clone(),
            is_directory: false,
        });
        Ok(())
    }

    /// Materialises one directory entry (a trailing slash is appended if
    /// missing). Re-creating an existing directory is a no-op.
    pub fn create_directory(&mut self, name: &str, options: &EntryOptions) -> ZipResult<()> {
        let mut name = normalize_name(name, true)?;
        if !name.ends_with('/') {
            name.push('/');
        }
        self.ensure_parents(&name, options)?;
        self.emit_directory(name, options)
    }

    /// Normalizes a file name and makes sure its parent directories exist
    /// in the archive.
    fn prepare_entry(&mut self, name: &str, options: &EntryOptions) -> ZipResult<String> {
        let name = normalize_name(name, false)?;
        self.ensure_parents(&name, options)?;
        Ok(name)
    }

    fn ensure_parents(&mut self, name: &str, options: &EntryOptions) -> ZipResult<()> {
        // Walk "a/b/c.txt" through "a/" and "a/b/".
        let mut from = 0usize;
        while let Some(slash) = name[from..].find('/') {
            let end = from + slash + 1;
            if end == name.len() {
                break; // the trailing slash of a directory name itself
            }
            let ancestor = &name[..end];
            if !self.materialised.contains(ancestor) {
                if !options.make_path {
                    return Err(ZipError::InvalidPath(format!(
                        "parent directory {ancestor:?} has not been created \
                         (set make_path to create it)"
                    )));
                }
                self.emit_directory(ancestor.to_owned(), options)?;
            }
            from = end;
        }
        Ok(())
    }

    fn emit_directory(&mut self, name: String, options: &EntryOptions) -> ZipResult<()> {
        if self.materialised.contains(&name) {
            return Ok(());
        }
        let info = FileInfo {
            compression_method: CompressionMethod::Store,
            compressed_size: 0,
            uncompressed_size: 0,
            last_modified: options.timestamp(),
            crc32: 0,
            name: name.clone(),
            descriptor_follows: false,
            utf8: options.utf8,
            zip64: false,
            extra_field_size: 0,
        };
        let offset = self.writer.offset();
        LocalFileHeader::write(&mut self.writer, &info, self.options.zip64)?;
        self.directory.push(CdEntry {
            info,
            offset,
            comment: String::new(),
            is_directory: true,
        });
        self.materialised.insert(name);
        Ok(())
    }

    /// Emits the central directory and the (Zip64-promoting) end records,
    /// flushes, and returns the underlying stream.
    pub fn finish(mut self) -> ZipResult<W> {
        let cd_offset = self.writer.offset();
        for entry in &self.directory {
            CentralDirectoryHeader::write(&mut self.writer, entry, self.options.zip64)?;
        }
        let cd_size = self.writer.offset() - cd_offset;
        let (comment, _) = spec::encode_text(&self.options.comment, false);
        spec::write_eocd(
            &mut self.writer,
            self.directory.len() as u64,
            cd_size,
            cd_offset,
            &comment,
            self.options.zip64,
        )?;
        self.writer.flush()?;
        Ok(self.writer.into_inner())
    }
}

/// The compression side of one entry's pipeline. Driven as a raw state
/// machine for symmetry with the reading side.
#[derive(Debug)]
enum WriteCodec {
    Store,
    Deflate(Box<Compress>),
}

/// Writes one entry's bytes into the archive.
///
/// User bytes are tallied (CRC + count) before the codec sees them; the
/// codec's output lands in the archive and is counted there. Implements
/// [`Write`]. [`finish`](EntryWriter::finish) flushes the codec, emits
/// the data descriptor (sizes always in 64-bit form), and registers the
/// central directory entry. Writes after that fail with
/// [`ZipError::ClosedSink`].
#[derive(Debug)]
pub struct EntryWriter<'a, W: Write> {
    writer: &'a mut CountingWriter<W>,
    directory: &'a mut Vec<CdEntry>,
    entry_open: &'a mut bool,
    info: Option<FileInfo>,
    comment: String,
    offset: u64,
    data_start: u64,
    crc: Crc32Tally,
    codec: WriteCodec,
    scratch: Box<[u8]>,
    finished: bool,
}

impl<W: Write> EntryWriter<'_, W> {
    /// Compressed bytes emitted so far (codec buffering excluded).
    pub fn bytes_out(&self) -> u64 {
        self.writer.offset() - self.data_start
    }

    /// Uncompressed bytes accepted so far.
    pub fn bytes_in(&self) -> u64 {
        self.crc.bytes()
    }

    fn write_inner(&mut self, buf: &[u8]) -> ZipResult<usize> {
        if self.finished {
            return Err(ZipError::ClosedSink);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        match &mut self.codec {
            WriteCodec::Store => {
                let n = self.writer.write(buf)?;
                self.crc.update(&buf[..n]);
                Ok(n)
            }
            WriteCodec::Deflate(compress) => loop {
                let before_in = compress.total_in();
                let before_out = compress.total_out();
                compress
                    .compress(buf, &mut self.scratch, FlushCompress::None)
                    .map_err(|e| ZipError::Codec(format!("deflate: {e}")))?;
                let consumed = (compress.total_in() - before_in) as usize;
                let produced = (compress.total_out() - before_out) as usize;
                self.writer.write_all(&self.scratch[..produced])?;
                if consumed > 0 {
                    self.crc.update(&buf[..consumed]);
                    return Ok(consumed);
                }
                if produced == 0 {
                    return Err(ZipError::Codec("deflate made no progress".to_owned()));
                }
            },
        }
    }

    fn finish_inner(&mut self) -> ZipResult<()> {
        if self.finished {
            return Ok(());
        }
        if let WriteCodec::Deflate(compress) = &mut self.codec {
            loop {
                let before_out = compress.total_out();
                let status = compress
                    .compress(&[], &mut self.scratch, FlushCompress::Finish)
                    .map_err(|e| ZipError::Codec(format!("deflate: {e}")))?;
                let produced = (compress.total_out() - before_out) as usize;
                self.writer.write_all(&self.scratch[..produced])?;
                if status == Status::StreamEnd {
                    break;
                }
                if produced == 0 {
                    return Err(ZipError::Codec("deflate failed to finish".to_owned()));
                }
            }
        }
        self.finished = true;
        *self.entry_open = false;

        let compressed = self.writer.offset() - self.data_start;
        let uncompressed = self.crc.bytes();
        let crc32 = self.crc.crc32();

        // Data descriptor, always with 64-bit sizes — matching the Zip64
        // placeholder the local header carries.
        self.writer.write_all(&spec::DATA_DESCRIPTOR_MAGIC)?;
        spec::write_u32(self.writer, crc32)?;
        spec::write_u64(self.writer, compressed)?;
        spec::write_u64(self.writer, uncompressed)?;

        let mut info = self.info.take().expect("entry finished twice");
        info.crc32 = crc32;
        info.compressed_size = compressed;
        info.uncompressed_size = uncompressed;
        self.directory.push(CdEntry {
            info,
            offset: self.offset,
            comment: std::mem::take(&mut self.comment),
            is_directory: false,
        });
        Ok(())
    }

    /// Flushes the codec, emits the data descriptor, and registers the
    /// entry in the central directory. Mandatory before anything else
    /// happens on the archive; dropping the writer does this implicitly
    /// (with a warning, swallowing errors). Writes after `finish` fail
    /// with [`ZipError::ClosedSink`].
    pub fn finish(&mut self) -> ZipResult<()> {
        self.finish_inner()
    }
}

impl<W: Write> Write for EntryWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_inner(buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<W: Write> Drop for EntryWriter<'_, W> {
    fn drop(&mut self) {
        if !self.finished {
            let name = self.info.as_ref().map(|i| i.name.clone()).unwrap_or_default();
            warn!("Entry {name:?} dropped while open; closing it implicitly");
            if let Err(err) = self.finish_inner() {
                warn!("Implicit close of {name:?} failed: {err}");
            }
        }
    }
}
