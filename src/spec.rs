//! Code specific to the ZIP file format specification.
//!
//! We try to keep the nitty gritty here,
//! and higher-level stuff in the [`read`] and [`write`] modules.
//!
//! Most comments quote the ZIP spec, [`APPNOTE.TXT`].
//!
//! [`read`]: ../read/index.html
//! [`write`]: ../write/index.html
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT

use std::borrow::Cow;
use std::io::{Read, Write};

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use codepage_437::*;
use log::*;

use crate::read::{CdEntry, FileInfo};
use crate::result::*;
use crate::write::Zip64Mode;

// Magic numbers denoting various sections of a ZIP archive

/// Local file header magic number
pub(crate) const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];
/// Central directory magic number
pub(crate) const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Data descriptor magic number — the sentinel the truncator hunts for
pub(crate) const DATA_DESCRIPTOR_MAGIC: [u8; 4] = [b'P', b'K', 7, 8];
/// End of central directory magic number
pub(crate) const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Zip64 end of central directory magic number
pub(crate) const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Zip64 end of central directory locator magic number
pub(crate) const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];

/// Header ID of the Zip64 extended information extra field
pub(crate) const ZIP64_EXTRA_ID: u16 = 0x0001;

/// Bit 3: sizes and CRC-32 are zero in the local header and follow the
/// file data in a data descriptor.
pub(crate) const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
/// Bit 11: Language encoding flag (EFS). If this bit is set,
/// the filename and comment fields for this file
/// MUST be encoded using UTF-8. (see APPENDIX D)
pub(crate) const FLAG_UTF8: u16 = 1 << 11;

/// "version needed to extract" for plain Store/Deflate entries
pub(crate) const VERSION_DEFAULT: u16 = 20;
/// "version needed to extract" once Zip64 structures are involved
pub(crate) const VERSION_ZIP64: u16 = 45;

/// Data descriptor tail after the signature: CRC-32 plus two 32-bit sizes.
pub(crate) const DESCRIPTOR_TAIL: usize = 12;
/// Zip64 data descriptor tail after the signature: CRC-32 plus two
/// 64-bit sizes.
pub(crate) const DESCRIPTOR_TAIL_ZIP64: usize = 20;

// Integer plumbing. Unlike a slice-based reader we can't split_at() our
// way through a mapping; every field comes off the stream via read_exact.

/// Reads a little-endian u16 from the stream.
pub(crate) fn read_u16<R: Read>(reader: &mut R) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

/// Reads a little-endian u32 from the stream.
pub(crate) fn read_u32<R: Read>(reader: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Reads a little-endian u64 from the stream.
pub(crate) fn read_u64<R: Read>(reader: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn write_u16<W: Write>(writer: &mut W, v: u16) -> std::io::Result<()> {
    writer.write_all(&v.to_le_bytes())
}

pub(crate) fn write_u32<W: Write>(writer: &mut W, v: u32) -> std::io::Result<()> {
    writer.write_all(&v.to_le_bytes())
}

pub(crate) fn write_u64<W: Write>(writer: &mut W, v: u64) -> std::io::Result<()> {
    writer.write_all(&v.to_le_bytes())
}

/// Decodes an MS-DOS date/time pair into a calendar datetime.
///
/// Date: bits 0-4 day (1-31), 5-8 month (1-12), 9-15 years since 1980.
/// Time: bits 0-4 second/2 (0-29), 5-10 minute, 11-15 hour.
///
/// Zero days and months, month 13+, hour 24+, minute 60+, and the
/// second-60/62 corner the /2 encoding allows are all rejected;
/// the format has no way to say "unknown".
pub(crate) fn dos_datetime(date: u16, time: u16) -> ZipResult<NaiveDateTime> {
    let seconds = (time & 0b0000_0000_0001_1111) as u32 * 2;
    let minutes = (time & 0b0000_0111_1110_0000) as u32 >> 5;
    let hours = (time & 0b1111_1000_0000_0000) as u32 >> 11;

    let days = (date & 0b0000_0000_0001_1111) as u32;
    let months = (date & 0b0000_0001_1110_0000) as u32 >> 5;
    // Years since 1980, always interpreted as a positive value
    let years = ((date & 0b1111_1110_0000_0000) >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(years, months, days)
        .and_then(|d| d.and_hms_opt(hours, minutes, seconds))
        .ok_or_else(|| {
            ZipError::BadDateTime(format!(
                "{years:04}-{months:02}-{days:02} {hours:02}:{minutes:02}:{seconds:02}"
            ))
        })
}

/// Encodes a calendar datetime as an MS-DOS (date, time) pair.
///
/// Odd seconds are truncated to the 2-second resolution of the format.
/// Years outside 1980..=2107 don't fit the seven-bit year field.
pub(crate) fn datetime_to_dos(datetime: &NaiveDateTime) -> ZipResult<(u16, u16)> {
    let year = datetime.year();
    if !(1980..=2107).contains(&year) {
        return Err(ZipError::BadDateTime(format!(
            "year {year} outside 1980..=2107"
        )));
    }
    let date =
        (((year - 1980) as u16) << 9) | ((datetime.month() as u16) << 5) | datetime.day() as u16;
    let time = ((datetime.hour() as u16) << 11)
        | ((datetime.minute() as u16) << 5)
        | (datetime.second() as u16 / 2);
    Ok((date, time))
}

/// Extracts the "is this text UTF-8?" bit from the 16-bit flags field.
///
/// If false, text is assumed to be CP437.
pub(crate) fn is_utf8(flags: u16) -> bool {
    flags & FLAG_UTF8 != 0
}

/// Extracts the "sizes follow the data" bit from the 16-bit flags field.
pub(crate) fn has_data_descriptor(flags: u16) -> bool {
    flags & FLAG_DATA_DESCRIPTOR != 0
}

/// Decodes header text: strict UTF-8 when the EFS flag was set,
/// CP437 otherwise (a total function — every byte maps somewhere).
pub(crate) fn decode_text(bytes: &[u8], utf8: bool) -> ZipResult<String> {
    if utf8 {
        Ok(std::str::from_utf8(bytes)?.to_owned())
    } else {
        let cow: Cow<str> = Cow::borrow_from_cp437(bytes, &CP437_CONTROL);
        Ok(cow.into_owned())
    }
}

/// Encodes header text, returning the bytes and the EFS flag value that
/// describes them. A caller asking for CP437 but handing us text CP437
/// can't express gets UTF-8 with a warning instead of mangled bytes.
pub(crate) fn encode_text(text: &str, utf8: bool) -> (Vec<u8>, bool) {
    if utf8 {
        return (text.as_bytes().to_vec(), true);
    }
    match text.to_cp437(&CP437_CONTROL) {
        Ok(cow) => (cow.into_owned(), false),
        Err(_) => {
            warn!("{text:?} doesn't fit CP437; encoding it as UTF-8 instead");
            (text.as_bytes().to_vec(), true)
        }
    }
}

/// Warn about general-purpose flag bits we don't understand.
/// They're unusual, not fatal; we emit all-zero extras ourselves.
fn check_flags(flags: u16, what: &str, offset: u64) {
    let unknown = flags & !(FLAG_DATA_DESCRIPTOR | FLAG_UTF8);
    if unknown != 0 {
        warn!("Unknown flag bits {unknown:#06x} in {what} at offset {offset}");
    }
}

fn check_version(version_needed: u16, what: &str, offset: u64) {
    if version_needed > VERSION_ZIP64 {
        warn!(
            "{what} at offset {offset} wants version {version_needed} to extract; \
             we only know {VERSION_ZIP64}"
        );
    }
}

/// One pass over an extra field, pulling u64 overrides out of the Zip64
/// extended information block.
///
/// `wants` lists the 32-bit fields that were saturated in the classical
/// header, in the fixed order the Zip64 block stores them. Each saturated
/// field consumes eight bytes of the block's payload. Returns whether a
/// Zip64 block was seen; a later duplicate block is ignored with a warning.
fn parse_extra_field(
    extra_field: &[u8],
    wants: &mut [(&mut u64, bool)],
    what: &str,
    offset: u64,
) -> bool {
    // 4.5.1 In order to allow different programs and different types
    // of information to be stored in the 'extra' field in .ZIP
    // files, the following structure MUST be used for all
    // programs storing data in this field:
    //
    //     header1+data1 + header2+data2 . . .
    //
    // Each header MUST consist of:
    //
    //     Header ID - 2 bytes
    //     Data Size - 2 bytes
    let mut rest = extra_field;
    let mut seen_zip64 = false;
    while rest.len() >= 4 {
        let kind = u16::from_le_bytes([rest[0], rest[1]]);
        let field_len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if field_len > rest.len() {
            warn!("Extra field in {what} at offset {offset} overruns its container; ignoring it");
            return seen_zip64;
        }
        let (mut payload, after) = rest.split_at(field_len);
        rest = after;

        if kind != ZIP64_EXTRA_ID {
            trace!("Skipping extra field {kind:#06x} ({field_len} bytes) in {what}");
            continue;
        }
        if seen_zip64 {
            warn!("Duplicate Zip64 extra field in {what} at offset {offset}; ignoring it");
            continue;
        }
        seen_zip64 = true;

        for (value, saturated) in wants.iter_mut() {
            if !*saturated {
                continue;
            }
            if payload.len() < 8 {
                // A descriptor-mode local header legitimately carries a
                // zeroed or even empty payload; the descriptor has the
                // real numbers.
                break;
            }
            let (bytes, after) = payload.split_at(8);
            **value = u64::from_le_bytes(bytes.try_into().unwrap());
            payload = after;
        }
        if !payload.is_empty() {
            trace!(
                "{} unread bytes in the Zip64 block of {what} at offset {offset}",
                payload.len()
            );
        }
    }
    if !rest.is_empty() {
        warn!(
            "{} trailing bytes in {what} extra field at offset {offset}",
            rest.len()
        );
    }
    seen_zip64
}

/// Data from a local file header
///
/// Each file's actual contents is preceded by this header. Conventional
/// readers ignore these in favor of the central directory; on a one-way
/// stream the directory doesn't arrive until it's too late to matter, so
/// this record is what we trust while reading.
#[derive(Debug)]
pub(crate) struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub zip64: bool,
    pub name: Vec<u8>,
    pub extra_field_len: u16,
}

impl LocalFileHeader {
    /// Parses a local file header, signature included, from the stream.
    /// Returns the header and the number of bytes consumed.
    ///
    /// `offset` is the archive position of the signature, for diagnostics.
    pub fn parse<R: Read>(reader: &mut R, offset: u64) -> ZipResult<(Self, u64)> {
        // 4.3.7  Local file header:
        //
        // local file header signature     4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name (variable size)
        // extra field (variable size)
        let at = |e| ZipError::from_io_at(e, offset);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(at)?;
        if magic != LOCAL_FILE_HEADER_MAGIC {
            return Err(ZipError::BadSignature {
                expected: "local file header",
                found: u32::from_le_bytes(magic),
                offset,
            });
        }
        let version_needed = read_u16(reader).map_err(at)?;
        let flags = read_u16(reader).map_err(at)?;
        let compression_method = read_u16(reader).map_err(at)?;
        let last_modified_time = read_u16(reader).map_err(at)?;
        let last_modified_date = read_u16(reader).map_err(at)?;
        let crc32 = read_u32(reader).map_err(at)?;
        let compressed_size_32 = read_u32(reader).map_err(at)?;
        let uncompressed_size_32 = read_u32(reader).map_err(at)?;
        let name_len = read_u16(reader).map_err(at)? as usize;
        let extra_field_len = read_u16(reader).map_err(at)?;

        let mut name = vec![0u8; name_len];
        reader.read_exact(&mut name).map_err(at)?;
        let mut extra_field = vec![0u8; extra_field_len as usize];
        reader.read_exact(&mut extra_field).map_err(at)?;

        let mut compressed_size = compressed_size_32 as u64;
        let mut uncompressed_size = uncompressed_size_32 as u64;
        // 4.5.3: the local header Zip64 block covers only the two sizes,
        // original (uncompressed) size first.
        let zip64 = parse_extra_field(
            &extra_field,
            &mut [
                (&mut uncompressed_size, uncompressed_size_32 == u32::MAX),
                (&mut compressed_size, compressed_size_32 == u32::MAX),
            ],
            "local file header",
            offset,
        );

        let header = Self {
            version_needed,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            zip64,
            name,
            extra_field_len,
        };
        check_flags(header.flags, "local file header", offset);
        check_version(header.version_needed, "local file header", offset);
        if has_data_descriptor(header.flags)
            && (header.crc32 != 0 || compressed_size_32 != 0 || uncompressed_size_32 != 0)
        {
            // Zip64 writers conventionally saturate the sizes instead of
            // zeroing them; anything else is merely suspect.
            warn!(
                "Local file header at offset {offset} promises a data descriptor but carries \
                 CRC {crc32:#010x} and sizes {compressed_size_32}/{uncompressed_size_32}"
            );
        }

        let consumed = 30 + name_len as u64 + extra_field_len as u64;
        Ok((header, consumed))
    }

    /// Emits a local file header for `info`, promoting to Zip64 when the
    /// sizes demand it (or `zip64` forces it). Returns the bytes written.
    pub fn write<W: Write>(writer: &mut W, info: &FileInfo, zip64: Zip64Mode) -> ZipResult<u64> {
        let oversize =
            info.compressed_size > u32::MAX as u64 || info.uncompressed_size > u32::MAX as u64;
        if oversize && zip64 == Zip64Mode::Never {
            return Err(ZipError::SizeTooLarge(
                info.compressed_size.max(info.uncompressed_size),
            ));
        }
        let use_zip64 = info.zip64 || oversize || zip64 == Zip64Mode::Always;

        let (name, utf8) = encode_text(&info.name, info.utf8);
        let mut flags = 0u16;
        if info.descriptor_follows {
            flags |= FLAG_DATA_DESCRIPTOR;
        }
        if utf8 {
            flags |= FLAG_UTF8;
        }
        let (date, time) = datetime_to_dos(&info.last_modified)?;

        // Under a data descriptor the classical fields are zero and the
        // Zip64 block, if any, is a zeroed placeholder (the descriptor is
        // authoritative). Otherwise a Zip64 entry saturates the classical
        // fields and the block carries the real numbers.
        let (crc32, size_fields, extra_sizes) = if info.descriptor_follows {
            (0u32, (0u32, 0u32), (0u64, 0u64))
        } else if use_zip64 {
            (
                info.crc32,
                (u32::MAX, u32::MAX),
                (info.compressed_size, info.uncompressed_size),
            )
        } else {
            (
                info.crc32,
                (info.compressed_size as u32, info.uncompressed_size as u32),
                (0, 0),
            )
        };

        let extra_field_len: u16 = if use_zip64 { 4 + 16 } else { 0 };

        writer.write_all(&LOCAL_FILE_HEADER_MAGIC)?;
        write_u16(
            writer,
            if use_zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT },
        )?;
        write_u16(writer, flags)?;
        write_u16(writer, info.compression_method.to_u16())?;
        write_u16(writer, time)?;
        write_u16(writer, date)?;
        write_u32(writer, crc32)?;
        write_u32(writer, size_fields.0)?;
        write_u32(writer, size_fields.1)?;
        write_u16(writer, name.len() as u16)?;
        write_u16(writer, extra_field_len)?;
        writer.write_all(&name)?;
        if use_zip64 {
            write_u16(writer, ZIP64_EXTRA_ID)?;
            write_u16(writer, 16)?;
            // 4.5.3 stores the original size first
            write_u64(writer, extra_sizes.1)?;
            write_u64(writer, extra_sizes.0)?;
        }

        Ok(30 + name.len() as u64 + extra_field_len as u64)
    }
}

/// Data from a central directory entry
///
/// Each of these records contains information about a file or folder
/// stored in the archive; conforming readers treat them as authoritative,
/// which is exactly what the post-stream validation pass checks.
#[derive(Debug)]
pub(crate) struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub disk_number: u16,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    pub header_offset: u64,
    pub zip64: bool,
    pub name: Vec<u8>,
    pub extra_field_len: u16,
    pub comment: Vec<u8>,
}

impl CentralDirectoryHeader {
    /// Parses one central directory entry, signature included.
    pub fn parse<R: Read>(reader: &mut R, offset: u64) -> ZipResult<Self> {
        // 4.3.12  Central directory structure:
        //
        //   central file header signature   4 bytes  (0x02014b50)
        //   version made by                 2 bytes
        //   version needed to extract       2 bytes
        //   general purpose bit flag        2 bytes
        //   compression method              2 bytes
        //   last mod file time              2 bytes
        //   last mod file date              2 bytes
        //   crc-32                          4 bytes
        //   compressed size                 4 bytes
        //   uncompressed size               4 bytes
        //   file name length                2 bytes
        //   extra field length              2 bytes
        //   file comment length             2 bytes
        //   disk number start               2 bytes
        //   internal file attributes        2 bytes
        //   external file attributes        4 bytes
        //   relative offset of local header 4 bytes
        //
        //   file name (variable size)
        //   extra field (variable size)
        //   file comment (variable size)
        let at = |e| ZipError::from_io_at(e, offset);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(at)?;
        if magic != CENTRAL_DIRECTORY_MAGIC {
            return Err(ZipError::BadSignature {
                expected: "central directory header",
                found: u32::from_le_bytes(magic),
                offset,
            });
        }
        let version_made_by = read_u16(reader).map_err(at)?;
        let version_needed = read_u16(reader).map_err(at)?;
        let flags = read_u16(reader).map_err(at)?;
        let compression_method = read_u16(reader).map_err(at)?;
        let last_modified_time = read_u16(reader).map_err(at)?;
        let last_modified_date = read_u16(reader).map_err(at)?;
        let crc32 = read_u32(reader).map_err(at)?;
        let compressed_size_32 = read_u32(reader).map_err(at)?;
        let uncompressed_size_32 = read_u32(reader).map_err(at)?;
        let name_len = read_u16(reader).map_err(at)? as usize;
        let extra_field_len = read_u16(reader).map_err(at)?;
        let comment_len = read_u16(reader).map_err(at)? as usize;
        let disk_number = read_u16(reader).map_err(at)?;
        let internal_attributes = read_u16(reader).map_err(at)?;
        let external_attributes = read_u32(reader).map_err(at)?;
        let header_offset_32 = read_u32(reader).map_err(at)?;

        let mut name = vec![0u8; name_len];
        reader.read_exact(&mut name).map_err(at)?;
        let mut extra_field = vec![0u8; extra_field_len as usize];
        reader.read_exact(&mut extra_field).map_err(at)?;
        let mut comment = vec![0u8; comment_len];
        reader.read_exact(&mut comment).map_err(at)?;

        let mut compressed_size = compressed_size_32 as u64;
        let mut uncompressed_size = uncompressed_size_32 as u64;
        let mut header_offset = header_offset_32 as u64;
        // 4.5.3: uncompressed size, then compressed size, then offset,
        // then (for split archives) a disk number; each present only when
        // its classical field is saturated.
        let zip64 = parse_extra_field(
            &extra_field,
            &mut [
                (&mut uncompressed_size, uncompressed_size_32 == u32::MAX),
                (&mut compressed_size, compressed_size_32 == u32::MAX),
                (&mut header_offset, header_offset_32 == u32::MAX),
            ],
            "central directory header",
            offset,
        );

        let header = Self {
            version_made_by,
            version_needed,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            internal_attributes,
            external_attributes,
            header_offset,
            zip64,
            name,
            extra_field_len,
            comment,
        };
        check_flags(header.flags, "central directory header", offset);
        check_version(header.version_needed, "central directory header", offset);
        trace!(
            "Central directory header at offset {offset}: made by version {}, \
             internal attributes {:#06x}",
            header.version_made_by,
            header.internal_attributes
        );
        if header.disk_number > 1 {
            warn!(
                "Central directory header at offset {offset} claims disk {}; \
                 split archives aren't supported, assuming a single disk",
                header.disk_number
            );
        }

        Ok(header)
    }

    /// Emits one central directory entry for a finished file.
    /// Returns the bytes written.
    pub fn write<W: Write>(writer: &mut W, entry: &CdEntry, zip64: Zip64Mode) -> ZipResult<u64> {
        let info = &entry.info;
        let need_sizes =
            info.compressed_size > u32::MAX as u64 || info.uncompressed_size > u32::MAX as u64;
        let need_offset = entry.offset > u32::MAX as u64;
        if (need_sizes || need_offset) && zip64 == Zip64Mode::Never {
            return Err(ZipError::SizeTooLarge(
                info.compressed_size
                    .max(info.uncompressed_size)
                    .max(entry.offset),
            ));
        }
        let use_zip64 = need_sizes || need_offset || zip64 == Zip64Mode::Always;

        let (name, utf8) = encode_text(&info.name, info.utf8);
        let (comment, _) = encode_text(&entry.comment, utf8);
        let mut flags = 0u16;
        if info.descriptor_follows {
            flags |= FLAG_DATA_DESCRIPTOR;
        }
        if utf8 {
            flags |= FLAG_UTF8;
        }
        let (date, time) = datetime_to_dos(&info.last_modified)?;

        // All three overrides travel together once we promote; readers
        // accept the full block and it keeps the fixed order obvious.
        let mut extra_payload = Vec::new();
        let (uncompressed_field, compressed_field, offset_field) = if use_zip64 {
            extra_payload.extend_from_slice(&info.uncompressed_size.to_le_bytes());
            extra_payload.extend_from_slice(&info.compressed_size.to_le_bytes());
            extra_payload.extend_from_slice(&entry.offset.to_le_bytes());
            (u32::MAX, u32::MAX, u32::MAX)
        } else {
            (
                info.uncompressed_size as u32,
                info.compressed_size as u32,
                entry.offset as u32,
            )
        };
        let extra_field_len: u16 = if extra_payload.is_empty() {
            0
        } else {
            4 + extra_payload.len() as u16
        };

        let external_attributes: u32 = if entry.is_directory { 0x10 } else { 0 };
        let version = if use_zip64 || info.zip64 {
            VERSION_ZIP64
        } else {
            VERSION_DEFAULT
        };

        writer.write_all(&CENTRAL_DIRECTORY_MAGIC)?;
        write_u16(writer, version)?; // version made by
        write_u16(writer, version)?;
        write_u16(writer, flags)?;
        write_u16(writer, info.compression_method.to_u16())?;
        write_u16(writer, time)?;
        write_u16(writer, date)?;
        write_u32(writer, info.crc32)?;
        write_u32(writer, compressed_field)?;
        write_u32(writer, uncompressed_field)?;
        write_u16(writer, name.len() as u16)?;
        write_u16(writer, extra_field_len)?;
        write_u16(writer, comment.len() as u16)?;
        write_u16(writer, 0)?; // disk number start
        write_u16(writer, 0)?; // internal attributes
        write_u32(writer, external_attributes)?;
        write_u32(writer, offset_field)?;
        writer.write_all(&name)?;
        if extra_field_len != 0 {
            write_u16(writer, ZIP64_EXTRA_ID)?;
            write_u16(writer, extra_payload.len() as u16)?;
            writer.write_all(&extra_payload)?;
        }
        writer.write_all(&comment)?;

        Ok(46 + name.len() as u64 + extra_field_len as u64 + comment.len() as u64)
    }
}

/// Data from the End of central directory record
///
/// Found at the back of the archive; provides offsets for finding the
/// central directory, along with lots of stuff that stopped being relevant
/// when we stopped breaking ZIP archives onto multiple floppies.
#[derive(Debug)]
pub(crate) struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub comment: Vec<u8>,
}

impl EndOfCentralDirectory {
    pub fn parse<R: Read>(reader: &mut R, offset: u64) -> ZipResult<Self> {
        // 4.3.16  End of central directory record:
        //
        // end of central dir signature    4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // number of the disk with the
        // start of the central directory  2 bytes
        // total number of entries in
        // the central dir on this disk    2 bytes
        // total number of entries in
        // the central dir                 2 bytes
        // size of the central directory   4 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        4 bytes
        // zipfile comment length          2 bytes
        let at = |e| ZipError::from_io_at(e, offset);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(at)?;
        if magic != EOCDR_MAGIC {
            return Err(ZipError::BadSignature {
                expected: "end of central directory record",
                found: u32::from_le_bytes(magic),
                offset,
            });
        }
        let disk_number = read_u16(reader).map_err(at)?;
        let disk_with_central_directory = read_u16(reader).map_err(at)?;
        let entries_on_this_disk = read_u16(reader).map_err(at)?;
        let entries = read_u16(reader).map_err(at)?;
        let central_directory_size = read_u32(reader).map_err(at)?;
        let central_directory_offset = read_u32(reader).map_err(at)?;
        let comment_len = read_u16(reader).map_err(at)? as usize;
        let mut comment = vec![0u8; comment_len];
        reader.read_exact(&mut comment).map_err(at)?;

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            comment,
        })
    }
}

/// Data from the Zip64 end of central directory record
#[derive(Debug)]
pub(crate) struct Zip64EndOfCentralDirectory {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub entries_on_this_disk: u64,
    pub entries: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
}

impl Zip64EndOfCentralDirectory {
    pub fn parse<R: Read>(reader: &mut R, offset: u64) -> ZipResult<Self> {
        // 4.3.14  Zip64 end of central directory record
        //
        // zip64 end of central dir
        // signature                       4 bytes  (0x06064b50)
        // size of zip64 end of central
        // directory record                8 bytes
        // version made by                 2 bytes
        // version needed to extract       2 bytes
        // number of this disk             4 bytes
        // number of the disk with the
        // start of the central directory  4 bytes
        // total number of entries in the
        // central directory on this disk  8 bytes
        // total number of entries in the
        // central directory               8 bytes
        // size of the central directory   8 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        8 bytes
        // zip64 extensible data sector    (variable size)
        let at = |e| ZipError::from_io_at(e, offset);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(at)?;
        if magic != ZIP64_EOCDR_MAGIC {
            return Err(ZipError::BadSignature {
                expected: "zip64 end of central directory record",
                found: u32::from_le_bytes(magic),
                offset,
            });
        }
        let record_size = read_u64(reader).map_err(at)?;
        let version_made_by = read_u16(reader).map_err(at)?;
        let version_needed = read_u16(reader).map_err(at)?;
        let disk_number = read_u32(reader).map_err(at)?;
        let disk_with_central_directory = read_u32(reader).map_err(at)?;
        let entries_on_this_disk = read_u64(reader).map_err(at)?;
        let entries = read_u64(reader).map_err(at)?;
        let central_directory_size = read_u64(reader).map_err(at)?;
        let central_directory_offset = read_u64(reader).map_err(at)?;

        // 4.3.14.1: Size = SizeOfFixedFields + SizeOfVariableData - 12.
        // Anything past the 44 fixed bytes is extensible data; skip it.
        match record_size.checked_sub(44) {
            Some(0) => {}
            Some(extensible) => {
                trace!("Skipping {extensible} bytes of zip64 extensible data");
                std::io::copy(&mut reader.take(extensible), &mut std::io::sink()).map_err(at)?;
            }
            None => {
                return Err(ZipError::InvalidArchive(
                    "Zip64 End Of Central Directory Record too short",
                ));
            }
        }

        let record = Self {
            version_made_by,
            version_needed,
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
        };
        check_version(record.version_needed, "zip64 end of central directory", offset);
        Ok(record)
    }
}

/// Data from the Zip64 end of central directory locator
#[derive(Debug)]
pub(crate) struct Zip64EndOfCentralDirectoryLocator {
    pub disk_with_central_directory: u32,
    pub zip64_eocdr_offset: u64,
    pub disks: u32,
}

impl Zip64EndOfCentralDirectoryLocator {
    pub fn parse<R: Read>(reader: &mut R, offset: u64) -> ZipResult<Self> {
        // 4.3.15 Zip64 end of central directory locator
        //
        // zip64 end of central dir locator
        // signature                       4 bytes  (0x07064b50)
        // number of the disk with the
        // start of the zip64 end of
        // central directory               4 bytes
        // relative offset of the zip64
        // end of central directory record 8 bytes
        // total number of disks           4 bytes
        let at = |e| ZipError::from_io_at(e, offset);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(at)?;
        if magic != ZIP64_EOCDR_LOCATOR_MAGIC {
            return Err(ZipError::BadSignature {
                expected: "zip64 end of central directory locator",
                found: u32::from_le_bytes(magic),
                offset,
            });
        }
        let disk_with_central_directory = read_u32(reader).map_err(at)?;
        let zip64_eocdr_offset = read_u64(reader).map_err(at)?;
        let disks = read_u32(reader).map_err(at)?;

        Ok(Self {
            disk_with_central_directory,
            zip64_eocdr_offset,
            disks,
        })
    }
}

/// Emits the end-of-central-directory epilogue: when any counter outgrows
/// its classical field (or the caller forces Zip64), the Zip64 EOCD record
/// and its locator come first and the classical record carries saturated
/// values. Returns the bytes written.
pub(crate) fn write_eocd<W: Write>(
    writer: &mut W,
    entries: u64,
    cd_size: u64,
    cd_offset: u64,
    comment: &[u8],
    zip64: Zip64Mode,
) -> ZipResult<u64> {
    let need_zip64 =
        entries >= u16::MAX as u64 || cd_size >= u32::MAX as u64 || cd_offset >= u32::MAX as u64;
    if need_zip64 && zip64 == Zip64Mode::Never {
        return Err(ZipError::SizeTooLarge(entries.max(cd_size).max(cd_offset)));
    }
    let use_zip64 = need_zip64 || zip64 == Zip64Mode::Always;
    let mut written = 0u64;

    if use_zip64 {
        writer.write_all(&ZIP64_EOCDR_MAGIC)?;
        write_u64(writer, 44)?; // size of the remaining record
        write_u16(writer, VERSION_ZIP64)?;
        write_u16(writer, VERSION_ZIP64)?;
        write_u32(writer, 0)?; // this disk
        write_u32(writer, 0)?; // disk with the central directory
        write_u64(writer, entries)?;
        write_u64(writer, entries)?;
        write_u64(writer, cd_size)?;
        write_u64(writer, cd_offset)?;

        writer.write_all(&ZIP64_EOCDR_LOCATOR_MAGIC)?;
        write_u32(writer, 0)?; // disk with the zip64 EOCD
        write_u64(writer, cd_offset + cd_size)?;
        write_u32(writer, 1)?; // total disks
        written += 56 + 20;
    }

    let (entries_field, size_field, offset_field) = (
        if entries >= u16::MAX as u64 {
            u16::MAX
        } else {
            entries as u16
        },
        if cd_size >= u32::MAX as u64 {
            u32::MAX
        } else {
            cd_size as u32
        },
        if cd_offset >= u32::MAX as u64 {
            u32::MAX
        } else {
            cd_offset as u32
        },
    );

    writer.write_all(&EOCDR_MAGIC)?;
    write_u16(writer, 0)?; // this disk
    write_u16(writer, 0)?; // disk with the central directory
    write_u16(writer, entries_field)?;
    write_u16(writer, entries_field)?;
    write_u32(writer, size_field)?;
    write_u32(writer, offset_field)?;
    write_u16(writer, comment.len() as u16)?;
    writer.write_all(comment)?;
    written += 22 + comment.len() as u64;

    Ok(written)
}

/// Compares a streamed local header against the central directory entry
/// claiming the same offset. Method, text encoding, name, descriptor flag,
/// and modification time (2-second resolution) must agree; with
/// `check_sizes`, so must both sizes and the CRC-32.
pub(crate) fn is_consistent(local: &FileInfo, central: &CdEntry, check_sizes: bool) -> bool {
    let info = &central.info;
    let mut consistent = local.compression_method == info.compression_method
        && local.utf8 == info.utf8
        && local.name == info.name
        && local.descriptor_follows == info.descriptor_follows
        && local.last_modified == info.last_modified;
    if check_sizes {
        consistent = consistent
            && local.compressed_size == info.compressed_size
            && local.uncompressed_size == info.uncompressed_size
            && local.crc32 == info.crc32;
    }
    consistent
}
