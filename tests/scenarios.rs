//! End-to-end scenarios pinned to exact wire layouts: a minimal stored
//! archive, descriptor streaming, an embedded descriptor lookalike, and
//! archives corrupted one field at a time to prove the validator notices.

use std::io::{Read, Write};

use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};

use zipflow::read::ArchiveReader;
use zipflow::write::{ArchiveOptions, ArchiveWriter, EntryOptions};
use zipflow::CompressionMethod;

const HELLO: &[u8] = b"Hello, Julia!\n";
const HELLO_CRC: u32 = 0xFE69594D;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn stamp() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 6)
        .unwrap()
        .and_hms_opt(7, 8, 10)
        .unwrap()
}

fn options(compression: CompressionMethod) -> EntryOptions {
    EntryOptions {
        compression,
        last_modified: Some(stamp()),
        ..EntryOptions::default()
    }
}

/// Byte offset of the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .expect("pattern not found")
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

/// S1 — a minimal stored archive, field by field.
#[test]
fn minimal_store_layout() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::with_options(
        Vec::new(),
        ArchiveOptions {
            comment: "Archive comment".to_owned(),
            ..ArchiveOptions::default()
        },
    );
    archive.add_entry("hello.txt", HELLO, &options(CompressionMethod::Store))?;
    let bytes = archive.finish()?;

    // Local file header at offset 0.
    assert_eq!(&bytes[0..4], b"PK\x03\x04");
    assert_eq!(&bytes[6..8], [0, 0], "no flag bits for a plain entry");
    assert_eq!(&bytes[8..10], [0, 0], "method Store");
    assert_eq!(u32_at(&bytes, 14), HELLO_CRC);
    assert_eq!(u32_at(&bytes, 18), HELLO.len() as u32);
    assert_eq!(u32_at(&bytes, 22), HELLO.len() as u32);
    // Name, then the raw payload.
    let data_at = 30 + "hello.txt".len();
    assert_eq!(&bytes[30..data_at], b"hello.txt");
    assert_eq!(&bytes[data_at..data_at + HELLO.len()], HELLO);

    // Central directory entry points back at offset 0.
    let cd_at = find(&bytes, b"PK\x01\x02");
    assert_eq!(u32_at(&bytes, cd_at + 16), HELLO_CRC);
    assert_eq!(u32_at(&bytes, cd_at + 42), 0, "header offset");

    // EOCD carries one entry and the archive comment.
    let eocd_at = find(&bytes, b"PK\x05\x06");
    assert_eq!(&bytes[eocd_at + 10..eocd_at + 12], [1, 0]);
    assert!(bytes.ends_with(b"Archive comment"));

    // And it reads back clean.
    let mut archive = ArchiveReader::new(&bytes[..]);
    let mut entry = archive.next_entry()?.expect("one entry");
    assert_eq!(entry.info().name, "hello.txt");
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents)?;
    assert_eq!(contents, HELLO);
    drop(entry);
    assert!(archive.next_entry()?.is_none());
    assert!(archive.validate()?);
    Ok(())
}

/// S2 — Deflate behind a data descriptor.
#[test]
fn deflate_with_descriptor() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    let mut entry = archive.create_entry("hello.txt", &options(CompressionMethod::Deflate))?;
    entry.write_all(HELLO)?;
    entry.finish()?;
    drop(entry);
    let bytes = archive.finish()?;

    // The local header defers everything to the descriptor.
    assert_eq!(bytes[6] & 0x08, 0x08, "descriptor flag");
    assert_eq!(&bytes[8..10], [8, 0], "method Deflate");
    assert_eq!(u32_at(&bytes, 14), 0, "CRC deferred");
    assert_eq!(u32_at(&bytes, 18), 0, "sizes deferred");
    assert_eq!(u32_at(&bytes, 22), 0);

    // The descriptor carries the real numbers in 64-bit form.
    let desc_at = find(&bytes, b"PK\x07\x08");
    assert_eq!(u32_at(&bytes, desc_at + 4), HELLO_CRC);
    let compressed = u64_at(&bytes, desc_at + 8);
    assert_eq!(u64_at(&bytes, desc_at + 16), HELLO.len() as u64);

    // The central directory agrees.
    let cd_at = find(&bytes, b"PK\x01\x02");
    assert_eq!(u32_at(&bytes, cd_at + 16), HELLO_CRC);
    assert_eq!(u32_at(&bytes, cd_at + 20), compressed as u32);
    assert_eq!(u32_at(&bytes, cd_at + 24), HELLO.len() as u32);

    let mut archive = ArchiveReader::new(&bytes[..]);
    let mut entry = archive.next_entry()?.expect("one entry");
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents)?;
    assert_eq!(contents, HELLO);
    assert_eq!(entry.info().compressed_size, compressed);
    drop(entry);
    assert!(archive.validate()?);
    Ok(())
}

/// S3 — a payload carrying a forged descriptor for itself.
#[test]
fn embedded_sentinel_is_rejected() -> Result<()> {
    init_logs();

    // D ‖ sig ‖ crc32(D) ‖ len ‖ len ‖ D: after the first 14 bytes the
    // forgery's CRC matches the running CRC exactly; only the size
    // fields give it away.
    let mut payload = HELLO.to_vec();
    payload.extend_from_slice(b"PK\x07\x08");
    payload.extend_from_slice(&HELLO_CRC.to_le_bytes());
    payload.extend_from_slice(&(HELLO.len() as u32).to_le_bytes());
    payload.extend_from_slice(&(HELLO.len() as u32).to_le_bytes());
    payload.extend_from_slice(HELLO);
    assert_eq!(payload.len(), 60);

    let mut archive = ArchiveWriter::new(Vec::new());
    let mut entry = archive.create_entry("trap.bin", &options(CompressionMethod::Store))?;
    entry.write_all(&payload)?;
    entry.finish()?;
    drop(entry);
    let bytes = archive.finish()?;

    let mut archive = ArchiveReader::new(&bytes[..]);
    let mut entry = archive.next_entry()?.expect("one entry");
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents)?;
    assert_eq!(contents, payload, "the forged descriptor must read as data");
    drop(entry);
    assert!(archive.validate()?);
    Ok(())
}

/// S4 — files, a subdirectory, and the silently-skipped directory entry.
#[test]
fn multi_entry_with_subdirectory() -> Result<()> {
    init_logs();

    let opts = options(CompressionMethod::Deflate);
    let mut archive = ArchiveWriter::new(Vec::new());
    let mut entry = archive.create_entry("hello.txt", &opts)?;
    entry.write_all(HELLO)?;
    entry.finish()?;
    drop(entry);
    archive.create_directory("subdir", &opts)?;
    let mut entry = archive.create_entry("subdir/hello.txt", &opts)?;
    entry.write_all(HELLO)?;
    entry.finish()?;
    drop(entry);
    let bytes = archive.finish()?;

    let mut archive = ArchiveReader::new(&bytes[..]);
    let mut yielded = Vec::new();
    while let Some(mut entry) = archive.next_entry()? {
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        assert_eq!(contents, HELLO);
        yielded.push(entry.info().name.clone());
    }
    assert_eq!(yielded, ["hello.txt", "subdir/hello.txt"]);
    assert_eq!(archive.entries().len(), 3, "the directory is still recorded");
    assert!(archive.validate()?);
    Ok(())
}

/// S5 — the central directory lies about a CRC; only the archive-level
/// validator can tell.
#[test]
fn central_directory_crc_lie() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    archive.add_entry("hello.txt", HELLO, &options(CompressionMethod::Store))?;
    let mut bytes = archive.finish()?;

    let cd_at = find(&bytes, b"PK\x01\x02");
    bytes[cd_at + 16..cd_at + 20].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());

    let mut archive = ArchiveReader::new(&bytes[..]);
    let mut entry = archive.next_entry()?.expect("one entry");
    assert!(entry.validate()?, "the data matches its local header");
    drop(entry);
    assert!(!archive.validate()?, "the central directory does not");
    Ok(())
}

/// S6 — the local header lies about the uncompressed size.
#[test]
fn local_header_size_lie() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    archive.add_entry("hello.txt", HELLO, &options(CompressionMethod::Store))?;
    let mut bytes = archive.finish()?;

    // Uncompressed size field of the local header at offset 0.
    bytes[22..26].copy_from_slice(&15u32.to_le_bytes());

    let mut archive = ArchiveReader::new(&bytes[..]);
    let mut entry = archive.next_entry()?.expect("one entry");
    assert!(!entry.validate()?, "observed 14 bytes, header declares 15");
    Ok(())
}

/// A foreign streaming writer that uses the classical 12-byte descriptor
/// (no Zip64 extra field anywhere), assembled by hand.
#[test]
fn foreign_archive_with_32bit_descriptor() -> Result<()> {
    init_logs();

    let data = b"foreign data!";
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    let crc = hasher.finalize();
    let date: u16 = (44 << 9) | (5 << 5) | 6; // 2024-05-06
    let time: u16 = (7 << 11) | (8 << 5) | 5; // 07:08:10

    let mut bytes: Vec<u8> = Vec::new();
    let u16le = |v: u16| v.to_le_bytes();
    let u32le = |v: u32| v.to_le_bytes();

    // Local file header: Store, descriptor flag, everything deferred.
    bytes.extend_from_slice(b"PK\x03\x04");
    bytes.extend_from_slice(&u16le(20)); // version needed
    bytes.extend_from_slice(&u16le(0x0008)); // flags
    bytes.extend_from_slice(&u16le(0)); // method
    bytes.extend_from_slice(&u16le(time));
    bytes.extend_from_slice(&u16le(date));
    bytes.extend_from_slice(&u32le(0)); // crc
    bytes.extend_from_slice(&u32le(0)); // compressed
    bytes.extend_from_slice(&u32le(0)); // uncompressed
    bytes.extend_from_slice(&u16le(3)); // name length
    bytes.extend_from_slice(&u16le(0)); // extra length
    bytes.extend_from_slice(b"foo");
    bytes.extend_from_slice(data);
    // Classical data descriptor with 32-bit sizes.
    bytes.extend_from_slice(b"PK\x07\x08");
    bytes.extend_from_slice(&u32le(crc));
    bytes.extend_from_slice(&u32le(data.len() as u32));
    bytes.extend_from_slice(&u32le(data.len() as u32));

    let cd_offset = bytes.len() as u32;
    bytes.extend_from_slice(b"PK\x01\x02");
    bytes.extend_from_slice(&u16le(20)); // version made by
    bytes.extend_from_slice(&u16le(20)); // version needed
    bytes.extend_from_slice(&u16le(0x0008));
    bytes.extend_from_slice(&u16le(0));
    bytes.extend_from_slice(&u16le(time));
    bytes.extend_from_slice(&u16le(date));
    bytes.extend_from_slice(&u32le(crc));
    bytes.extend_from_slice(&u32le(data.len() as u32));
    bytes.extend_from_slice(&u32le(data.len() as u32));
    bytes.extend_from_slice(&u16le(3));
    bytes.extend_from_slice(&u16le(0)); // extra
    bytes.extend_from_slice(&u16le(0)); // comment
    bytes.extend_from_slice(&u16le(0)); // disk
    bytes.extend_from_slice(&u16le(0)); // internal attrs
    bytes.extend_from_slice(&u32le(0)); // external attrs
    bytes.extend_from_slice(&u32le(0)); // header offset
    bytes.extend_from_slice(b"foo");
    let cd_size = bytes.len() as u32 - cd_offset;

    bytes.extend_from_slice(b"PK\x05\x06");
    bytes.extend_from_slice(&u16le(0));
    bytes.extend_from_slice(&u16le(0));
    bytes.extend_from_slice(&u16le(1));
    bytes.extend_from_slice(&u16le(1));
    bytes.extend_from_slice(&u32le(cd_size));
    bytes.extend_from_slice(&u32le(cd_offset));
    bytes.extend_from_slice(&u16le(0));

    let mut archive = ArchiveReader::new(&bytes[..]);
    let mut entry = archive.next_entry()?.expect("one entry");
    assert_eq!(entry.info().name, "foo");
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents)?;
    assert_eq!(contents, data);
    assert_eq!(entry.info().crc32, crc, "descriptor values take over");
    drop(entry);
    assert!(archive.validate()?);
    Ok(())
}

/// Junk between the last entry and the central directory (leftovers from
/// sloppy streaming writers) is skipped, not fatal.
#[test]
fn garbage_before_central_directory_is_skipped() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    archive.add_entry("a.txt", b"alpha", &options(CompressionMethod::Store))?;
    archive.add_entry("b.txt", b"beta", &options(CompressionMethod::Store))?;
    let mut bytes = archive.finish()?;

    let cd_at = find(&bytes, b"PK\x01\x02");
    bytes.splice(cd_at..cd_at, b"........".iter().copied());

    let mut archive = ArchiveReader::new(&bytes[..]);
    let mut names = Vec::new();
    while let Some(mut entry) = archive.next_entry()? {
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        names.push(entry.info().name.clone());
    }
    assert_eq!(names, ["a.txt", "b.txt"]);
    assert!(archive.validate()?, "entry offsets were unaffected");
    Ok(())
}

#[test]
fn validator_flags_bad_local_crc() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    archive.add_entry("hello.txt", HELLO, &options(CompressionMethod::Store))?;
    let mut bytes = archive.finish()?;

    bytes[14..18].copy_from_slice(&0x12345678u32.to_le_bytes());

    // validate() drains the entry itself; the per-entry CRC failure must
    // surface in the archive verdict.
    let mut archive = ArchiveReader::new(&bytes[..]);
    assert!(!archive.validate()?);
    Ok(())
}

#[test]
fn validator_flags_duplicate_names() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    archive.add_entry("twin.txt", b"one", &options(CompressionMethod::Store))?;
    archive.add_entry("twin.txt", b"two", &options(CompressionMethod::Store))?;
    let bytes = archive.finish()?;

    let mut archive = ArchiveReader::new(&bytes[..]);
    assert!(!archive.validate()?);
    Ok(())
}

#[test]
fn validator_flags_entry_count_lie() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    archive.add_entry("hello.txt", HELLO, &options(CompressionMethod::Store))?;
    let mut bytes = archive.finish()?;

    let eocd_at = find(&bytes, b"PK\x05\x06");
    bytes[eocd_at + 8..eocd_at + 10].copy_from_slice(&9u16.to_le_bytes());
    bytes[eocd_at + 10..eocd_at + 12].copy_from_slice(&9u16.to_le_bytes());

    let mut archive = ArchiveReader::new(&bytes[..]);
    assert!(!archive.validate()?);
    Ok(())
}

#[test]
fn validator_flags_missing_central_entry() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    archive.add_entry("keep.txt", b"kept", &options(CompressionMethod::Store))?;
    archive.add_entry("lost.txt", b"lost", &options(CompressionMethod::Store))?;
    let mut bytes = archive.finish()?;

    // Cut the second entry's central directory record out wholesale.
    let first_cd = find(&bytes, b"PK\x01\x02");
    let second_cd = first_cd + 4 + find(&bytes[first_cd + 4..], b"PK\x01\x02");
    let eocd = find(&bytes, b"PK\x05\x06");
    bytes.drain(second_cd..eocd);

    let mut archive = ArchiveReader::new(&bytes[..]);
    assert!(!archive.validate()?);
    Ok(())
}

#[test]
fn validator_flags_phantom_central_entry() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    archive.add_entry("real.txt", b"real", &options(CompressionMethod::Store))?;
    let mut bytes = archive.finish()?;

    // Duplicate the central directory record: same name, same offset,
    // twice in the directory.
    let cd_at = find(&bytes, b"PK\x01\x02");
    let eocd_at = find(&bytes, b"PK\x05\x06");
    let record: Vec<u8> = bytes[cd_at..eocd_at].to_vec();
    bytes.splice(eocd_at..eocd_at, record);

    let mut archive = ArchiveReader::new(&bytes[..]);
    assert!(!archive.validate()?);
    Ok(())
}
