//! Header values, hash values, range trackers and volume metadata

#![allow(clippy::expect_used)]

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use ewfkit::{
    CompressionLevel, ErrorKind, EwfHandle, HeaderCodepage, MediaFlags, MediaType, ParseOutcome,
    WriterConfig, header_ids, hash_ids,
};

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

#[test]
fn test_header_values_roundtrip() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("case");
    let mut handle = EwfHandle::create(&base, &small_config()).expect("create container");
    handle
        .set_header_value(header_ids::CASE_NUMBER, "2031-044")
        .expect("set value");
    handle
        .set_header_value(header_ids::EXAMINER_NAME, "J. Moreau")
        .expect("set value");
    handle
        .set_header_value(header_ids::NOTES, "imaged behind the write blocker")
        .expect("set value");
    handle.write_chunk(&[0x11u8; CHUNK]).expect("write chunk");
    handle.write_finalize().expect("finalize");
    handle.close().expect("close writer");

    let mut handle = EwfHandle::open_base(&base.with_extension("E01")).expect("open container");
    assert_eq!(
        handle.parse_header_values().expect("parse"),
        ParseOutcome::Parsed
    );
    assert_eq!(
        handle.parse_header_values().expect("parse again"),
        ParseOutcome::AlreadyParsed
    );
    assert_eq!(
        handle
            .header_value(header_ids::CASE_NUMBER)
            .expect("value")
            .as_deref(),
        Some("2031-044")
    );
    assert_eq!(
        handle
            .header_value(header_ids::EXAMINER_NAME)
            .expect("value")
            .as_deref(),
        Some("J. Moreau")
    );
    assert_eq!(
        handle
            .header_value(header_ids::NOTES)
            .expect("value")
            .as_deref(),
        Some("imaged behind the write blocker")
    );
    assert_eq!(handle.header_value(header_ids::MODEL).expect("value"), None);

    let identifiers = handle.header_value_identifiers().expect("identifiers");
    assert!(identifiers.iter().any(|id| id == header_ids::CASE_NUMBER));
    handle.close().expect("close reader");
}

#[test]
fn test_header_values_freeze_once_data_is_written() {
    let dir = tempdir().expect("tempdir");
    let mut handle =
        EwfHandle::create(&dir.path().join("frozen"), &small_config()).expect("create container");
    handle
        .set_header_value(header_ids::CASE_NUMBER, "before")
        .expect("set before start");

    handle.write_chunk(&[0x22u8; CHUNK]).expect("write chunk");
    let err = handle
        .set_header_value(header_ids::CASE_NUMBER, "after")
        .expect_err("values are frozen");
    assert!(matches!(err.kind(), ErrorKind::Frozen(_)));

    // The frozen value is still readable on the writing handle.
    assert_eq!(
        handle
            .header_value(header_ids::CASE_NUMBER)
            .expect("value")
            .as_deref(),
        Some("before")
    );
    handle.write_finalize().expect("finalize");
    handle.close().expect("close writer");
}

#[test]
fn test_hash_values_roundtrip() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("digests");
    let md5: [u8; 16] = [
        0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa,
        0xbb,
    ];
    let sha1: [u8; 20] = [
        0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x10, 0x32, 0x54, 0x76, 0x98, 0xba, 0xdc,
        0xfe, 0x0f, 0x1e, 0x2d, 0x3c,
    ];

    let mut handle = EwfHandle::create(&base, &small_config()).expect("create container");
    handle.write_chunk(&[0x33u8; CHUNK]).expect("write chunk");
    // Digests become known once the stream has been hashed, so they may be
    // set right up to finalize.
    handle.set_md5_hash(&md5).expect("set md5");
    handle.set_sha1_hash(&sha1).expect("set sha1");
    handle.write_finalize().expect("finalize");

    let err = handle.set_md5_hash(&md5).expect_err("finalized");
    assert!(matches!(err.kind(), ErrorKind::AlreadyFinalized));
    handle.close().expect("close writer");

    let mut handle = EwfHandle::open_base(&base.with_extension("E01")).expect("open container");
    assert_eq!(handle.md5_hash().expect("md5"), Some(md5));
    assert_eq!(handle.sha1_hash().expect("sha1"), Some(sha1));
    assert_eq!(
        handle.parse_hash_values().expect("already parsed"),
        ParseOutcome::AlreadyParsed
    );
    assert_eq!(
        handle.hash_value(hash_ids::MD5).expect("value").as_deref(),
        Some("deadbeef00112233445566778899aabb")
    );
    handle.close().expect("close reader");
}

#[test]
fn test_absent_hashes_parse_to_nothing() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("plain");
    let mut handle = EwfHandle::create(&base, &small_config()).expect("create container");
    handle.write_chunk(&[0x44u8; CHUNK]).expect("write chunk");
    handle.write_finalize().expect("finalize");
    handle.close().expect("close writer");

    let mut handle = EwfHandle::open_base(&base.with_extension("E01")).expect("open container");
    assert_eq!(
        handle.parse_hash_values().expect("nothing stored"),
        ParseOutcome::NothingToParse
    );
    assert_eq!(handle.md5_hash().expect("md5"), None);
    assert_eq!(handle.sha1_hash().expect("sha1"), None);
    handle.close().expect("close reader");
}

#[test]
fn test_trackers_keep_blind_append_order() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("ranges");
    let mut handle = EwfHandle::create(&base, &small_config()).expect("create container");

    // Appends are kept verbatim: out of order, duplicated, uncoalesced.
    handle.add_acquiry_error(100, 5).expect("add error");
    handle.add_acquiry_error(10, 2).expect("add error");
    handle.add_acquiry_error(100, 5).expect("add duplicate");
    handle.add_session(0, 64).expect("add session");
    handle.add_session(64, 64).expect("add session");

    handle.write_chunk(&[0x55u8; CHUNK]).expect("write chunk");
    handle.write_finalize().expect("finalize");
    handle.close().expect("close writer");

    let handle = EwfHandle::open_base(&base.with_extension("E01")).expect("open container");
    assert_eq!(handle.acquiry_error_count(), 3);
    let ranges: Vec<(u64, u64)> = (0..3)
        .map(|index| {
            let entry = handle.acquiry_error(index).expect("entry");
            (entry.first_sector, entry.sector_count)
        })
        .collect();
    assert_eq!(ranges, [(100, 5), (10, 2), (100, 5)]);

    assert_eq!(handle.session_count(), 2);
    assert_eq!(handle.session(1).expect("session").first_sector, 64);
    assert_eq!(handle.crc_error_count(), 0);

    let err = handle.acquiry_error(3).expect_err("out of range");
    assert!(matches!(err.kind(), ErrorKind::OutOfRange { .. }));
    handle.close().expect("close reader");
}

#[test]
fn test_volume_metadata_roundtrip() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("volume");
    let guid = [7u8; 16];

    let mut handle = EwfHandle::create(&base, &small_config()).expect("create container");
    handle.set_media_type(MediaType::Optical).expect("set type");
    handle
        .set_media_flags(MediaFlags {
            is_image: true,
            is_physical: false,
        })
        .expect("set flags");
    handle.set_guid(guid).expect("set guid");
    handle.set_error_granularity(2).expect("set granularity");
    handle
        .set_header_codepage(HeaderCodepage::Latin1)
        .expect("set codepage");
    assert_eq!(handle.header_codepage(), HeaderCodepage::Latin1);
    handle
        .set_media_size(4 * CHUNK as u64)
        .expect("set media size");
    assert_eq!(handle.media_size(), 4 * CHUNK as u64);
    handle
        .set_segment_file_size(128 * 1024)
        .expect("set segment size");
    assert_eq!(handle.segment_file_size(), 128 * 1024);
    let err = handle.set_segment_file_size(1024).expect_err("below minimum");
    assert!(matches!(err.kind(), ErrorKind::Argument(_)));

    handle.write_chunk(&[0x66u8; CHUNK]).expect("write chunk");
    handle.write_finalize().expect("finalize");
    handle.close().expect("close writer");

    let handle = EwfHandle::open_base(&base.with_extension("E01")).expect("open container");
    assert_eq!(handle.media_type(), MediaType::Optical);
    assert!(handle.media_flags().is_image);
    assert!(!handle.media_flags().is_physical);
    assert_eq!(handle.guid(), guid);
    assert_eq!(handle.error_granularity(), 2);
    assert_eq!(handle.compression_level(), CompressionLevel::Fast);
    // The declared size was provisional; the written stream fixed it.
    assert_eq!(handle.media_size(), CHUNK as u64);
    handle.close().expect("close reader");
}

#[test]
fn test_volume_metadata_freezes_once_started() {
    let dir = tempdir().expect("tempdir");
    let mut handle =
        EwfHandle::create(&dir.path().join("locked"), &small_config()).expect("create container");

    // Everything is still mutable before the first chunk lands.
    handle.set_media_type(MediaType::Memory).expect("set type");
    handle.set_bytes_per_sector(4096).expect("set sector size");
    handle.set_bytes_per_sector(512).expect("set back");

    handle.write_chunk(&[0x77u8; CHUNK]).expect("write chunk");

    let err = handle
        .set_media_type(MediaType::Fixed)
        .expect_err("volume frozen");
    assert!(matches!(err.kind(), ErrorKind::Frozen(_)));
    let err = handle
        .set_bytes_per_sector(4096)
        .expect_err("geometry frozen");
    assert!(matches!(err.kind(), ErrorKind::Frozen(_)));
    let err = handle.set_guid([1u8; 16]).expect_err("volume frozen");
    assert!(matches!(err.kind(), ErrorKind::Frozen(_)));
    let err = handle.set_media_size(0).expect_err("volume frozen");
    assert!(matches!(err.kind(), ErrorKind::Frozen(_)));
    let err = handle
        .set_segment_file_size(256 * 1024)
        .expect_err("volume frozen");
    assert!(matches!(err.kind(), ErrorKind::Frozen(_)));

    // Compression and the wipe policy stay adjustable.
    handle
        .set_compression(CompressionLevel::Best, ewfkit::CompressionPolicy::Always)
        .expect("set compression");
    handle.set_wipe_on_error(false);

    handle.write_finalize().expect("finalize");
    handle.close().expect("close writer");
}

#[test]
fn test_read_handles_reject_mutation() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("sealed");
    let mut handle = EwfHandle::create(&base, &small_config()).expect("create container");
    handle.write_chunk(&[0x88u8; CHUNK]).expect("write chunk");
    handle.write_finalize().expect("finalize");
    handle.close().expect("close writer");

    let mut handle = EwfHandle::open_base(&base.with_extension("E01")).expect("open container");
    assert!(handle.write_chunk(&[0u8; CHUNK]).is_err());
    assert!(handle.write_buffer(&[0u8; 16]).is_err());
    assert!(handle.write_finalize().is_err());
    assert!(handle.set_media_type(MediaType::Fixed).is_err());
    assert!(
        handle
            .set_header_value(header_ids::CASE_NUMBER, "late")
            .is_err()
    );
    assert!(handle.add_acquiry_error(0, 1).is_err());

    // The wipe policy is a read-side knob.
    handle.set_wipe_on_error(false);
    assert!(!handle.wipe_on_error());
    handle.close().expect("close reader");
}

#[test]
fn test_abort_interrupts_io_but_not_finalize() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("aborted");
    let mut handle = EwfHandle::create(&base, &small_config()).expect("create container");
    handle.write_chunk(&[0x99u8; CHUNK]).expect("write chunk");

    let abort = handle.abort_handle();
    assert!(!abort.is_signaled());
    abort.signal();
    assert!(handle.aborted());

    let err = handle.write_chunk(&[0x99u8; CHUNK]).expect_err("aborted");
    assert!(err.is_aborted());
    let err = handle.write_buffer(&[0x99u8; CHUNK]).expect_err("aborted");
    assert!(err.is_aborted());

    // Finalize still runs so the interrupted container stays readable.
    handle.write_finalize().expect("finalize");
    handle.close().expect("close writer");

    let mut handle = EwfHandle::open_base(&base.with_extension("E01")).expect("open container");
    assert_eq!(handle.chunk_count(), 1);
    handle.signal_abort();
    let mut buf = [0u8; 16];
    let err = handle.read_at(0, &mut buf).expect_err("aborted read");
    assert!(err.is_aborted());
    handle.close().expect("close reader");
}
