//! zipflow reads and writes ZIP archives over non-seekable,
//! one-directional byte streams — sockets, pipes, stdin/stdout — where
//! the usual trick of jumping to the central directory at the end of the
//! file is off the table.
//!
//! Reading pulls entries out as soon as their local file headers float
//! by:
//!
//! ```no_run
//! # use std::io::{self, Read};
//! # use zipflow::ArchiveReader;
//! let mut archive = ArchiveReader::new(io::stdin().lock());
//! while let Some(mut entry) = archive.next_entry()? {
//!     let mut contents = Vec::new();
//!     entry.read_to_end(&mut contents)?;
//!     println!("{}: {} bytes", entry.info().name, contents.len());
//! }
//! // The central directory has now streamed past; cross-check it.
//! assert!(archive.validate()?);
//! # Ok::<(), zipflow::ZipError>(())
//! ```
//!
//! Writing streams each entry through its codec and settles the sizes in
//! a trailing data descriptor, so no header is ever revisited:
//!
//! ```no_run
//! # use std::io::{self, Write};
//! # use zipflow::{ArchiveWriter, EntryOptions};
//! let mut archive = ArchiveWriter::new(io::stdout().lock());
//! let mut entry = archive.create_entry("logs/today.txt", &EntryOptions {
//!     make_path: true,
//!     ..EntryOptions::default()
//! })?;
//! entry.write_all(b"all quiet\n")?;
//! entry.finish()?;
//! archive.finish()?;
//! # Ok::<(), zipflow::ZipError>(())
//! ```
//!
//! Trusting local headers instead of the central directory cuts both
//! ways: it is what makes streaming possible, and it means a hostile or
//! sloppy writer can make the two disagree. [`ArchiveReader::validate`]
//! reconciles everything once the stream is exhausted — duplicate names,
//! phantom entries, mismatched sizes and CRCs — without ever seeking.

pub mod read;
pub mod result;
pub mod write;

pub use read::{ArchiveReader, CdEntry, CompressionMethod, EntryReader, FileInfo};
pub use result::{ZipError, ZipResult};
pub use write::{ArchiveOptions, ArchiveWriter, EntryOptions, EntryWriter, Zip64Mode};

mod counter;
mod crc;
mod spec;
mod truncate;
mod validate;
