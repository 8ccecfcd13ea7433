//! Post-stream reconciliation of the central directory.
//!
//! While streaming, the local file headers were the only authority
//! available. Once the entries are exhausted the central directory — the
//! record every conventional reader trusts — finally arrives, and this
//! pass checks that the two accounts agree: every streamed header has
//! exactly one directory entry at its offset, nothing is duplicated, and
//! each matched pair is field-for-field consistent. Discrepancies are
//! logged as warnings and folded into a single boolean verdict; only
//! malformed records (unreadable headers, a truncated stream) are errors.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::io::Read;

use log::*;

use crate::counter::CountingReader;
use crate::read::{CdEntry, FileInfo};
use crate::result::*;
use crate::spec::{
    self, CentralDirectoryHeader, EndOfCentralDirectory, Zip64EndOfCentralDirectory,
    Zip64EndOfCentralDirectoryLocator,
};

/// Reads central directory headers until some other record begins, then
/// cross-checks them against the observed local headers. Returns the
/// aggregate verdict.
pub(crate) fn reconcile<R: Read>(
    reader: &mut CountingReader<R>,
    locals: &[FileInfo],
    offsets: &[u64],
) -> ZipResult<bool> {
    let cd_start = reader.offset();
    let mut directory = Vec::new();
    while peek4(reader)? == Some(spec::CENTRAL_DIRECTORY_MAGIC) {
        let offset = reader.offset();
        let header = CentralDirectoryHeader::parse(reader, offset)?;
        directory.push(CdEntry::from_central(&header)?);
    }
    let cd_size = reader.offset() - cd_start;
    debug!(
        "Reconciling {} central directory entries against {} streamed headers",
        directory.len(),
        locals.len()
    );

    let mut ok = true;

    // Each local header offset may be claimed exactly once.
    let mut by_offset: HashMap<u64, &CdEntry> = HashMap::new();
    for entry in &directory {
        match by_offset.entry(entry.offset) {
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
            Entry::Occupied(_) => {
                warn!(
                    "{}",
                    ZipError::DuplicateEntry(format!(
                        "central directory claims offset {} twice ({:?})",
                        entry.offset, entry.info.name
                    ))
                );
                ok = false;
            }
        }
    }

    ok &= no_duplicate_names(directory.iter().map(|e| e.info.name.as_str()), "central directory");
    ok &= no_duplicate_names(locals.iter().map(|info| info.name.as_str()), "streamed headers");

    // Every streamed header needs its directory entry, and vice versa.
    let mut matched: HashSet<u64> = HashSet::new();
    for (local, offset) in locals.iter().zip(offsets) {
        match by_offset.get(offset) {
            None => {
                warn!(
                    "{}",
                    ZipError::InconsistentCentralDirectory(format!(
                        "no central directory entry for {:?} streamed at offset {offset}",
                        local.name
                    ))
                );
                ok = false;
            }
            Some(entry) => {
                matched.insert(*offset);
                if !spec::is_consistent(local, entry, true) {
                    warn!(
                        "{}",
                        ZipError::InconsistentCentralDirectory(format!(
                            "directory entry for {:?} at offset {offset} disagrees with \
                             its local header",
                            entry.info.name
                        ))
                    );
                    ok = false;
                }
            }
        }
    }
    for entry in &directory {
        if !matched.contains(&entry.offset) {
            warn!(
                "{}",
                ZipError::InconsistentCentralDirectory(format!(
                    "directory entry {:?} points at offset {}, where no header streamed",
                    entry.info.name, entry.offset
                ))
            );
            ok = false;
        }
    }

    ok &= check_tail(reader, directory.len() as u64, cd_start, cd_size)?;

    Ok(ok)
}

fn no_duplicate_names<'a>(names: impl Iterator<Item = &'a str>, what: &str) -> bool {
    let mut seen = HashSet::new();
    let mut ok = true;
    for name in names {
        if !seen.insert(name) {
            warn!(
                "{}",
                ZipError::DuplicateEntry(format!("{name:?} appears twice in the {what}"))
            );
            ok = false;
        }
    }
    ok
}

/// Reads whatever end-of-central-directory records follow and compares
/// their entry count with the directory just parsed. A count that
/// disagrees fails the verdict; recorded sizes and offsets that disagree
/// with observation, odd disk numbers, and a misplaced Zip64 locator are
/// warned about but tolerated (archives with junk between sections move
/// everything without rewriting these records). Records missing entirely
/// (a stream cut off after the directory) only rate a debug line.
fn check_tail<R: Read>(
    reader: &mut CountingReader<R>,
    parsed: u64,
    cd_start: u64,
    cd_size: u64,
) -> ZipResult<bool> {
    let mut recorded: Option<u64> = None;
    match peek4(reader)? {
        Some(sig) if sig == spec::ZIP64_EOCDR_MAGIC => {
            let record_at = reader.offset();
            let zip64 = Zip64EndOfCentralDirectory::parse(reader, record_at)?;
            trace!(
                "Zip64 end of central directory: made by version {}, needs version {}",
                zip64.version_made_by,
                zip64.version_needed
            );
            recorded = Some(zip64.entries);
            if zip64.entries_on_this_disk != zip64.entries
                || zip64.disk_number != zip64.disk_with_central_directory
            {
                warn!("Zip64 end record describes a split archive; treating it as one disk");
            }
            if zip64.central_directory_size != cd_size {
                warn!(
                    "Zip64 end record sizes the central directory at {} bytes; {} observed",
                    zip64.central_directory_size, cd_size
                );
            }
            if zip64.central_directory_offset != cd_start {
                warn!(
                    "Zip64 end record places the central directory at offset {}; seen at {}",
                    zip64.central_directory_offset, cd_start
                );
            }
            if peek4(reader)? == Some(spec::ZIP64_EOCDR_LOCATOR_MAGIC) {
                let offset = reader.offset();
                let locator = Zip64EndOfCentralDirectoryLocator::parse(reader, offset)?;
                if locator.zip64_eocdr_offset != record_at {
                    warn!(
                        "Zip64 locator points at offset {}; the record was at {record_at}",
                        locator.zip64_eocdr_offset
                    );
                }
                if locator.disks != 1 || locator.disk_with_central_directory != 0 {
                    warn!("Zip64 locator describes a split archive; treating it as one disk");
                }
            }
            if peek4(reader)? == Some(spec::EOCDR_MAGIC) {
                let offset = reader.offset();
                EndOfCentralDirectory::parse(reader, offset)?;
            }
        }
        Some(sig) if sig == spec::EOCDR_MAGIC => {
            let offset = reader.offset();
            let eocd = EndOfCentralDirectory::parse(reader, offset)?;
            if eocd.entries != u16::MAX {
                recorded = Some(eocd.entries as u64);
            }
            if eocd.entries_on_this_disk != eocd.entries
                || eocd.disk_number != eocd.disk_with_central_directory
            {
                warn!("End record describes a split archive; treating it as one disk");
            }
            if eocd.central_directory_size != u32::MAX && eocd.central_directory_size as u64 != cd_size
            {
                warn!(
                    "End record sizes the central directory at {} bytes; {} observed",
                    eocd.central_directory_size, cd_size
                );
            }
            if eocd.central_directory_offset != u32::MAX
                && eocd.central_directory_offset as u64 != cd_start
            {
                warn!(
                    "End record places the central directory at offset {}; seen at {}",
                    eocd.central_directory_offset, cd_start
                );
            }
            if !eocd.comment.is_empty() {
                trace!(
                    "Archive comment: {:?}",
                    spec::decode_text(&eocd.comment, false)?
                );
            }
        }
        Some(other) => {
            debug!("Central directory followed by unrecognized record {other:02x?}");
        }
        None => {
            debug!("Stream ended without an end-of-central-directory record");
        }
    }
    if let Some(recorded) = recorded {
        if recorded != parsed {
            warn!(
                "{}",
                ZipError::InconsistentCentralDirectory(format!(
                    "end record counts {recorded} entries, directory holds {parsed}"
                ))
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// Peeks the next four bytes without consuming them. `None` if the
/// stream has fewer than four bytes left.
fn peek4<R: Read>(reader: &mut CountingReader<R>) -> ZipResult<Option<[u8; 4]>> {
    let mut sig = [0u8; 4];
    let mut got = 0;
    while got < sig.len() {
        let n = reader.read(&mut sig[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    reader.push_back(&sig[..got]);
    Ok(if got == sig.len() { Some(sig) } else { None })
}
