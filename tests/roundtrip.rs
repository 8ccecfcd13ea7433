use std::io::{Read, Write};

use anyhow::Result;
use chrono::NaiveDate;

use zipflow::read::ArchiveReader;
use zipflow::result::ZipError;
use zipflow::write::{ArchiveWriter, EntryOptions};
use zipflow::CompressionMethod;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn options(compression: CompressionMethod) -> EntryOptions {
    EntryOptions {
        compression,
        last_modified: NaiveDate::from_ymd_opt(2024, 5, 6)
            .unwrap()
            .and_hms_opt(7, 8, 10),
        ..EntryOptions::default()
    }
}

/// Deterministic junk that compresses poorly.
fn pseudo_random(len: usize) -> Vec<u8> {
    let mut state = 0x2545f491_4f6cdd1du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

/// Reads every file out of `bytes`, returning (name, contents) pairs and
/// the archive's validation verdict.
fn read_back(bytes: &[u8]) -> Result<(Vec<(String, Vec<u8>)>, bool)> {
    let mut archive = ArchiveReader::new(bytes);
    let mut files = Vec::new();
    while let Some(mut entry) = archive.next_entry()? {
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        files.push((entry.info().name.clone(), contents));
    }
    let verdict = archive.validate()?;
    Ok((files, verdict))
}

#[test]
fn streamed_round_trip() -> Result<()> {
    init_logs();

    let payloads: Vec<Vec<u8>> = vec![
        Vec::new(),
        b"x".to_vec(),
        b"Hello, Julia!\n".to_vec(),
        vec![b'a'; 100_000],
        pseudo_random(65_536),
    ];

    for method in [CompressionMethod::Store, CompressionMethod::Deflate] {
        let mut archive = ArchiveWriter::new(Vec::new());
        for (i, payload) in payloads.iter().enumerate() {
            let mut entry = archive.create_entry(&format!("file-{i}"), &options(method))?;
            entry.write_all(payload)?;
            entry.finish()?;
        }
        let bytes = archive.finish()?;

        let (files, verdict) = read_back(&bytes)?;
        assert!(verdict, "clean archive must validate ({method:?})");
        assert_eq!(files.len(), payloads.len());
        for (i, payload) in payloads.iter().enumerate() {
            assert_eq!(files[i].0, format!("file-{i}"));
            assert_eq!(&files[i].1, payload, "payload {i} differs ({method:?})");
        }
    }
    Ok(())
}

#[test]
fn one_shot_round_trip() -> Result<()> {
    init_logs();

    for method in [CompressionMethod::Store, CompressionMethod::Deflate] {
        let mut archive = ArchiveWriter::new(Vec::new());
        archive.add_entry("a.bin", &pseudo_random(5000), &options(method))?;
        archive.add_entry("b.bin", b"tiny", &options(method))?;
        let bytes = archive.finish()?;

        let (files, verdict) = read_back(&bytes)?;
        assert!(verdict);
        assert_eq!(files[0].1, pseudo_random(5000));
        assert_eq!(files[1].1, b"tiny");
    }
    Ok(())
}

#[test]
fn empty_archive_round_trip() -> Result<()> {
    init_logs();

    let bytes = ArchiveWriter::new(Vec::new()).finish()?;
    let mut archive = ArchiveReader::new(&bytes[..]);
    assert!(archive.next_entry()?.is_none());
    assert!(archive.entries().is_empty());
    assert!(archive.validate()?);
    Ok(())
}

#[test]
fn iteration_preserves_stream_order() -> Result<()> {
    init_logs();

    let names = ["zebra", "apple", "mango", "01-first", "zz-last"];
    let mut archive = ArchiveWriter::new(Vec::new());
    for name in names {
        archive.add_entry(name, name.as_bytes(), &options(CompressionMethod::Store))?;
    }
    let bytes = archive.finish()?;

    let (files, _) = read_back(&bytes)?;
    let read_names: Vec<&str> = files.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(read_names, names);
    Ok(())
}

#[test]
fn sentinel_lookalike_stress() -> Result<()> {
    init_logs();

    // A payload that is almost nothing but descriptor signatures, stored
    // uncompressed behind a data descriptor. Every one of them must be
    // rejected by self-validation except the real one at the end.
    let mut payload = Vec::new();
    for _ in 0..1000 {
        payload.extend_from_slice(&[0x50, 0x4B, 0x07, 0x08]);
    }

    let mut archive = ArchiveWriter::new(Vec::new());
    let mut entry = archive.create_entry("sigs.bin", &options(CompressionMethod::Store))?;
    entry.write_all(&payload)?;
    entry.finish()?;
    drop(entry);
    let bytes = archive.finish()?;

    let (files, verdict) = read_back(&bytes)?;
    assert!(verdict);
    assert_eq!(files[0].1, payload);
    Ok(())
}

#[test]
fn byte_counters_settle_at_eof() -> Result<()> {
    init_logs();

    let payload = pseudo_random(10_000);
    let mut archive = ArchiveWriter::new(Vec::new());
    let mut entry = archive.create_entry("counted", &options(CompressionMethod::Deflate))?;
    entry.write_all(&payload)?;
    entry.finish()?;
    drop(entry);
    let bytes = archive.finish()?;

    let mut archive = ArchiveReader::new(&bytes[..]);
    let mut entry = archive.next_entry()?.expect("one entry");
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents)?;
    // After EOF the descriptor's numbers are in the metadata, and the
    // live counters agree with them exactly.
    assert_eq!(entry.bytes_out(), payload.len() as u64);
    assert_eq!(entry.info().uncompressed_size, payload.len() as u64);
    assert_eq!(entry.bytes_in(), entry.info().compressed_size);
    assert!(entry.validate()?);
    Ok(())
}

#[test]
fn directories_are_materialised_and_skipped() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    let opts = EntryOptions {
        make_path: true,
        ..options(CompressionMethod::Deflate)
    };
    let mut entry = archive.create_entry("deep/nested/tree/leaf.txt", &opts)?;
    entry.write_all(b"leaf")?;
    entry.finish()?;
    drop(entry);
    let bytes = archive.finish()?;

    let mut archive = ArchiveReader::new(&bytes[..]);
    let mut yielded = Vec::new();
    while let Some(mut entry) = archive.next_entry()? {
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        yielded.push(entry.info().name.clone());
    }
    // Only the file comes out of the iterator...
    assert_eq!(yielded, ["deep/nested/tree/leaf.txt"]);
    // ...but every ancestor directory was observed in the stream.
    let all: Vec<&str> = archive.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(
        all,
        ["deep/", "deep/nested/", "deep/nested/tree/", "deep/nested/tree/leaf.txt"]
    );
    assert!(archive.validate()?);
    Ok(())
}

#[test]
fn missing_parent_is_rejected() {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    let err = archive
        .create_entry("no/such/dir.txt", &options(CompressionMethod::Store))
        .unwrap_err();
    assert!(matches!(err, ZipError::InvalidPath(_)), "{err:?}");
}

#[test]
fn name_encodings_round_trip() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    // Fits CP437: stays CP437, no EFS flag.
    archive.add_entry("café.txt", b"cp437", &options(CompressionMethod::Store))?;
    // Doesn't fit CP437: promoted to UTF-8 with the flag set.
    archive.add_entry("☃.txt", b"utf8", &options(CompressionMethod::Store))?;
    let bytes = archive.finish()?;

    let (files, verdict) = read_back(&bytes)?;
    assert!(verdict);
    assert_eq!(files[0].0, "café.txt");
    assert_eq!(files[1].0, "☃.txt");

    let mut archive = ArchiveReader::new(&bytes[..]);
    while let Some(mut entry) = archive.next_entry()? {
        entry.validate()?;
    }
    assert!(!archive.entries()[0].utf8);
    assert!(archive.entries()[1].utf8);
    Ok(())
}

#[test]
fn modification_times_survive() -> Result<()> {
    init_logs();

    let stamp = NaiveDate::from_ymd_opt(1999, 12, 31)
        .unwrap()
        .and_hms_opt(23, 59, 58)
        .unwrap();
    let opts = EntryOptions {
        last_modified: Some(stamp),
        ..options(CompressionMethod::Store)
    };
    let mut archive = ArchiveWriter::new(Vec::new());
    archive.add_entry("stamped", b"", &opts)?;
    let bytes = archive.finish()?;

    let mut archive = ArchiveReader::new(&bytes[..]);
    let entry = archive.next_entry()?.expect("one entry");
    assert_eq!(entry.info().last_modified, stamp);
    Ok(())
}

#[test]
fn borrowed_streams_work() -> Result<()> {
    init_logs();

    let mut sink = Vec::new();
    {
        let mut archive = ArchiveWriter::new(&mut sink);
        archive.add_entry("borrowed", b"data", &options(CompressionMethod::Store))?;
        archive.finish()?;
    }
    // The caller kept ownership of the sink the whole time.
    let mut source = &sink[..];
    let (files, verdict) = {
        let mut archive = ArchiveReader::new(&mut source);
        let mut files = Vec::new();
        while let Some(mut entry) = archive.next_entry()? {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            files.push(contents);
        }
        (files, archive.validate()?)
    };
    assert!(verdict);
    assert_eq!(files, [b"data"]);
    Ok(())
}

#[test]
fn file_backed_archives() -> Result<()> {
    init_logs();

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("round.zip");

    let mut archive = ArchiveWriter::create(&path)?;
    let mut entry = archive.create_entry("on-disk.bin", &options(CompressionMethod::Deflate))?;
    entry.write_all(&pseudo_random(20_000))?;
    entry.finish()?;
    drop(entry);
    archive.finish()?;

    let mut archive = ArchiveReader::open(&path)?;
    let mut entry = archive.next_entry()?.expect("one entry");
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents)?;
    assert_eq!(contents, pseudo_random(20_000));
    drop(entry);
    assert!(archive.validate()?);
    Ok(())
}

#[test]
fn abandoned_entry_poisons_the_cursor() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    archive.add_entry("first", &[0u8; 1000], &options(CompressionMethod::Store))?;
    archive.add_entry("second", b"ok", &options(CompressionMethod::Store))?;
    let bytes = archive.finish()?;

    let mut archive = ArchiveReader::new(&bytes[..]);
    {
        let mut entry = archive.next_entry()?.expect("first entry");
        let mut partial = [0u8; 10];
        entry.read_exact(&mut partial)?;
        // Dropped with 990 bytes unread.
    }
    match archive.next_entry() {
        Err(ZipError::InvalidArchive(_)) => {}
        other => panic!("poisoned cursor must refuse iteration, got {other:?}"),
    }
    Ok(())
}

#[test]
fn closed_sink_rejects_writes() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    let mut entry = archive.create_entry("once", &options(CompressionMethod::Store))?;
    entry.write_all(b"payload")?;
    entry.finish()?;
    let err = entry.write_all(b"more").unwrap_err();
    let inner = err.get_ref().and_then(|e| e.downcast_ref::<ZipError>());
    assert!(matches!(inner, Some(ZipError::ClosedSink)), "{err:?}");
    drop(entry);
    archive.finish()?;
    Ok(())
}

#[test]
fn dropped_entry_is_closed_implicitly() -> Result<()> {
    init_logs();

    let mut archive = ArchiveWriter::new(Vec::new());
    {
        let mut entry = archive.create_entry("forgotten", &options(CompressionMethod::Deflate))?;
        entry.write_all(b"still ends up in the archive")?;
        // No finish(); the drop emits the descriptor.
    }
    archive.add_entry("after", b"fine", &options(CompressionMethod::Store))?;
    let bytes = archive.finish()?;

    let (files, verdict) = read_back(&bytes)?;
    assert!(verdict);
    assert_eq!(files[0].0, "forgotten");
    assert_eq!(files[0].1, b"still ends up in the archive");
    assert_eq!(files[1].0, "after");
    Ok(())
}
