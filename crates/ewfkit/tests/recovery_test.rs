//! Reading damaged containers: table fallbacks, chunk checksum errors and
//! structural rejection

#![allow(clippy::expect_used)]

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::{Path, PathBuf};

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use ewfkit::section::SECTION_DESCRIPTOR_LEN;
use ewfkit::segment::FILE_HEADER_LEN;
use ewfkit::{ErrorKind, EwfHandle, FormatVariant, WriterConfig, header_ids, naming};

const CHUNK: usize = 2048;

/// Writer configuration with a small geometry so tests stay fast
fn small_config() -> WriterConfig {
    WriterConfig {
        bytes_per_sector: 512,
        sectors_per_chunk: 4,
        segment_file_size: 64 * 1024,
        ..WriterConfig::default()
    }
}

/// Deterministic incompressible bytes
fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// Media that alternates compressible and incompressible chunks
fn mixed_media(chunks: usize) -> Vec<u8> {
    let mut media = Vec::with_capacity(chunks * CHUNK);
    for index in 0..chunks {
        if index % 2 == 0 {
            media.extend(std::iter::repeat_n(0x5au8, CHUNK));
        } else {
            media.extend(random_bytes(CHUNK, 0xd1b5_4a32 + index as u64));
        }
    }
    media
}

/// Acquire `media` into a fresh container and return the first segment path
fn acquire(dir: &Path, config: &WriterConfig, media: &[u8]) -> PathBuf {
    let base = dir.join("evidence");
    let mut handle = EwfHandle::create(&base, config).expect("create container");
    assert_eq!(handle.write_buffer(media).expect("write media"), media.len());
    handle.write_finalize().expect("finalize");
    handle.close().expect("close writer");
    base.with_extension("E01")
}

/// One section descriptor as laid out in a segment file
struct RawSection {
    name: String,
    offset: u64,
    size: u64,
}

/// Walk the section descriptors of a segment file from the front
fn walk_sections(path: &Path) -> Vec<RawSection> {
    let mut file = File::open(path).expect("open segment file");
    let file_len = file.metadata().expect("segment metadata").len();
    let mut sections = Vec::new();
    let mut offset = FILE_HEADER_LEN;
    while offset + SECTION_DESCRIPTOR_LEN <= file_len {
        let mut descriptor = [0u8; SECTION_DESCRIPTOR_LEN as usize];
        file.seek(SeekFrom::Start(offset)).expect("seek descriptor");
        file.read_exact(&mut descriptor).expect("read descriptor");
        let tag_len = descriptor[..16].iter().position(|b| *b == 0).unwrap_or(16);
        let name = String::from_utf8_lossy(&descriptor[..tag_len]).into_owned();
        let next = u64::from_le_bytes(descriptor[16..24].try_into().expect("next field"));
        let size = u64::from_le_bytes(descriptor[24..32].try_into().expect("size field"));
        sections.push(RawSection { name, offset, size });
        if next <= offset {
            break;
        }
        offset = next;
    }
    sections
}

/// Locate the `nth` section named `name` in a segment file
fn find_section(path: &Path, name: &str, nth: usize) -> RawSection {
    walk_sections(path)
        .into_iter()
        .filter(|section| section.name == name)
        .nth(nth)
        .expect("section present")
}

/// Invert one byte of a file in place
fn flip_byte(path: &Path, offset: u64) {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .expect("open for corruption");
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).expect("seek byte");
    file.read_exact(&mut byte).expect("read byte");
    byte[0] ^= 0x55;
    file.seek(SeekFrom::Start(offset)).expect("seek back");
    file.write_all(&byte).expect("write byte");
}

/// Read the whole media back through random access
fn read_all(handle: &mut EwfHandle) -> Vec<u8> {
    let mut media = vec![0u8; usize::try_from(handle.media_size()).expect("media size")];
    let read = handle.read_at(0, &mut media).expect("read media");
    assert_eq!(read, media.len());
    media
}

#[test]
fn test_damaged_table_falls_back_to_backup() {
    let dir = tempdir().expect("tempdir");
    let media = mixed_media(8);
    let first = acquire(dir.path(), &small_config(), &media);

    // Invert the trailing entry checksum so the primary table fails to
    // parse.
    let table = find_section(&first, "table", 0);
    flip_byte(&first, table.offset + table.size - 1);

    let mut handle = EwfHandle::open_base(&first).expect("open with damaged table");
    assert_eq!(handle.chunk_count(), 8);
    assert_eq!(read_all(&mut handle), media);
    assert_eq!(handle.crc_error_count(), 0);
    handle.close().expect("close reader");
}

#[test]
fn test_damaged_tables_rebuild_from_chunk_scan() {
    let dir = tempdir().expect("tempdir");
    let media = mixed_media(8);
    let first = acquire(dir.path(), &small_config(), &media);

    let table = find_section(&first, "table", 0);
    let backup = find_section(&first, "table2", 0);
    flip_byte(&first, table.offset + table.size - 1);
    flip_byte(&first, backup.offset + backup.size - 1);

    let mut handle = EwfHandle::open_base(&first).expect("open with damaged tables");
    assert_eq!(handle.chunk_count(), 8);
    assert_eq!(read_all(&mut handle), media);
    handle.close().expect("close reader");
}

#[test]
fn test_chunk_checksum_error_wipes_and_records() {
    let dir = tempdir().expect("tempdir");
    let media = mixed_media(8);
    let first = acquire(dir.path(), &small_config(), &media);

    // Find chunk 2 on disk through a clean handle first.
    let clean = EwfHandle::open_base(&first).expect("open container");
    let descriptor = clean.chunk_descriptor(2).expect("descriptor");
    clean.close().expect("close");
    assert_eq!(descriptor.segment_number, 1);
    flip_byte(&first, descriptor.file_offset + 5);

    let mut handle = EwfHandle::open_base(&first).expect("open container");
    assert!(handle.wipe_on_error());
    let got = read_all(&mut handle);

    let mut expected = media.clone();
    expected[2 * CHUNK..3 * CHUNK].fill(0);
    assert_eq!(got, expected);

    assert_eq!(handle.crc_error_count(), 1);
    let entry = handle.crc_error(0).expect("recorded range");
    assert_eq!(entry.first_sector, 8);
    assert_eq!(entry.sector_count, 4);
    handle.close().expect("close reader");
}

#[test]
fn test_chunk_checksum_error_fails_reads_without_wipe() {
    let dir = tempdir().expect("tempdir");
    let media = mixed_media(8);
    let first = acquire(dir.path(), &small_config(), &media);

    let clean = EwfHandle::open_base(&first).expect("open container");
    let descriptor = clean.chunk_descriptor(2).expect("descriptor");
    clean.close().expect("close");
    flip_byte(&first, descriptor.file_offset + 5);

    let mut handle = EwfHandle::open_base(&first).expect("open container");
    handle.set_wipe_on_error(false);

    let mut buf = vec![0u8; CHUNK];
    let err = handle
        .read_at(2 * CHUNK as u64, &mut buf)
        .expect_err("corrupt chunk");
    assert!(matches!(err.kind(), ErrorKind::Codec(_)));

    // The failure is still recorded and other chunks still read.
    assert_eq!(handle.crc_error_count(), 1);
    let mut head = vec![0u8; 2 * CHUNK];
    handle.read_at(0, &mut head).expect("read intact chunks");
    assert_eq!(&head[..], &media[..2 * CHUNK]);
    handle.close().expect("close reader");
}

#[test]
fn test_damaged_header2_falls_back_to_header() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("evidence");
    let mut handle = EwfHandle::create(&base, &small_config()).expect("create container");
    handle
        .set_header_value(header_ids::CASE_NUMBER, "X-9")
        .expect("set value");
    handle.write_buffer(&mixed_media(2)).expect("write media");
    handle.write_finalize().expect("finalize");
    handle.close().expect("close writer");

    // Damage the header2 body; parsing must fall through to the header
    // section and still produce the values.
    let first = base.with_extension("E01");
    let header2 = find_section(&first, "header2", 0);
    flip_byte(&first, header2.offset + SECTION_DESCRIPTOR_LEN + 10);

    let mut handle = EwfHandle::open_base(&first).expect("open container");
    assert_eq!(
        handle
            .header_value(header_ids::CASE_NUMBER)
            .expect("header value")
            .as_deref(),
        Some("X-9")
    );
    handle.close().expect("close reader");
}

#[test]
fn test_xheader_is_parsed_before_other_header_sections() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("evidence");
    let config = WriterConfig {
        variant: FormatVariant::Wide64,
        ..small_config()
    };
    let mut handle = EwfHandle::create(&base, &config).expect("create container");
    handle
        .set_header_value(header_ids::CASE_NUMBER, "X-10")
        .expect("set value");
    handle.write_buffer(&mixed_media(2)).expect("write media");
    handle.write_finalize().expect("finalize");
    handle.close().expect("close writer");

    // With both fallback encodings damaged, values can only have come from
    // the xheader section at the head of the ladder.
    let first = base.with_extension("E01");
    for name in ["header2", "header"] {
        let section = find_section(&first, name, 0);
        flip_byte(&first, section.offset + SECTION_DESCRIPTOR_LEN + 10);
    }

    let mut handle = EwfHandle::open_base(&first).expect("open container");
    assert_eq!(
        handle
            .header_value(header_ids::CASE_NUMBER)
            .expect("header value")
            .as_deref(),
        Some("X-10")
    );
    handle.close().expect("close reader");
}

#[test]
fn test_missing_segment_file_is_reported() {
    let dir = tempdir().expect("tempdir");
    let media = random_bytes(40 * CHUNK, 0x1234_5678_9abc_def1);
    let first = acquire(dir.path(), &small_config(), &media);

    let second = naming::sibling_path(&first, 2).expect("second path");
    assert!(second.is_file());
    std::fs::remove_file(&second).expect("remove segment");

    let err = EwfHandle::open_base(&first).err().expect("missing segment");
    assert!(matches!(err.kind(), ErrorKind::MissingSegment(2)));
}

#[test]
fn test_truncated_final_segment_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let media = mixed_media(4);
    let first = acquire(dir.path(), &small_config(), &media);

    let len = std::fs::metadata(&first).expect("metadata").len();
    let file = OpenOptions::new()
        .write(true)
        .open(&first)
        .expect("open for truncation");
    file.set_len(len - 40).expect("truncate");
    drop(file);

    let err = EwfHandle::open_base(&first)
        .err()
        .expect("truncated container");
    assert!(matches!(err.kind(), ErrorKind::MissingDoneSection));
}

#[test]
fn test_damaged_volume_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let media = mixed_media(4);
    let first = acquire(dir.path(), &small_config(), &media);

    let volume = find_section(&first, "volume", 0);
    flip_byte(&first, volume.offset + SECTION_DESCRIPTOR_LEN + 30);

    let err = EwfHandle::open_base(&first).err().expect("damaged volume");
    assert!(matches!(err.kind(), ErrorKind::ChecksumMismatch { .. }));
}

#[test]
fn test_segment_layout_matches_container_conventions() {
    let dir = tempdir().expect("tempdir");
    let media = random_bytes(40 * CHUNK, 0x8888_4444_2222_1111);
    let first = acquire(dir.path(), &small_config(), &media);

    let names: Vec<String> = walk_sections(&first)
        .into_iter()
        .map(|section| section.name)
        .collect();
    assert_eq!(names[..3], ["header2", "header", "volume"]);
    assert_eq!(names.last().map(String::as_str), Some("next"));
    let runs = names.iter().filter(|name| name.as_str() == "sectors").count();
    assert!(runs >= 1);
    assert_eq!(
        names.iter().filter(|name| name.as_str() == "table").count(),
        runs
    );
    assert_eq!(
        names.iter().filter(|name| name.as_str() == "table2").count(),
        runs
    );

    // Later segments open with a data section and the last one closes the
    // container.
    let second = naming::sibling_path(&first, 2).expect("second path");
    let names: Vec<String> = walk_sections(&second)
        .into_iter()
        .map(|section| section.name)
        .collect();
    assert_eq!(names.first().map(String::as_str), Some("data"));
    assert_eq!(names.last().map(String::as_str), Some("done"));
}
