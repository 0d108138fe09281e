//! Segment files and the ordered segment table
//!
//! A container is one or more segment files. Each starts with a 13-byte
//! file header naming the format variant and the file's 1-based position;
//! the rest is the section chain. Every file of a set carries the same
//! signature and the numbering is dense from 1.

use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::io::{FilePool, FileStore, SegmentStore};
use crate::{Context, Error, ErrorKind, Result};

/// On-disk length of the segment file header
pub const FILE_HEADER_LEN: u64 = 13;

/// Format variant of a container, selected by the file signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatVariant {
    /// 31-bit table offsets, 2 GiB segment files
    #[default]
    Classic,
    /// 63-bit table offsets for very large segment files
    Wide64,
}

impl FormatVariant {
    /// File signature bytes identifying the variant
    pub fn signature(self) -> [u8; 8] {
        match self {
            Self::Classic => *b"EVF\x09\x0d\x0a\xff\x00",
            Self::Wide64 => *b"XVF\x09\x0d\x0a\xff\x00",
        }
    }

    /// Recognize a file signature
    pub fn from_signature(signature: &[u8; 8]) -> Option<Self> {
        if *signature == Self::Classic.signature() {
            Some(Self::Classic)
        } else if *signature == Self::Wide64.signature() {
            Some(Self::Wide64)
        } else {
            None
        }
    }

    /// Largest segment file size the variant's table offsets can address
    pub fn max_segment_size(self) -> u64 {
        match self {
            Self::Classic => i32::MAX as u64,
            Self::Wide64 => i64::MAX as u64,
        }
    }

    /// Bytes per packed table entry
    pub(crate) fn table_entry_len(self) -> usize {
        match self {
            Self::Classic => 4,
            Self::Wide64 => 8,
        }
    }
}

/// Write the 13-byte file header of a segment file
pub fn write_file_header(
    store: &mut dyn SegmentStore,
    variant: FormatVariant,
    segment_number: u16,
) -> Result<()> {
    let mut raw = [0u8; FILE_HEADER_LEN as usize];
    raw[..8].copy_from_slice(&variant.signature());
    raw[8] = 0x01;
    LittleEndian::write_u16(&mut raw[9..11], segment_number);

    store
        .write_all_at(0, &raw)
        .with_context(|| format!("writing file header of segment {segment_number}"))
}

/// Read and validate the 13-byte file header of a segment file
pub fn read_file_header(store: &mut dyn SegmentStore) -> Result<(FormatVariant, u16)> {
    if store.len()? < FILE_HEADER_LEN {
        return Err(Error::corrupt("file too short for a segment header"));
    }
    let mut raw = [0u8; FILE_HEADER_LEN as usize];
    store.read_exact_at(0, &mut raw)?;

    let mut signature = [0u8; 8];
    signature.copy_from_slice(&raw[..8]);
    let variant = FormatVariant::from_signature(&signature)
        .ok_or(ErrorKind::SignatureMismatch(signature))?;

    if raw[8] != 0x01 || raw[11] != 0 || raw[12] != 0 {
        return Err(Error::corrupt("malformed segment header fields"));
    }
    Ok((variant, LittleEndian::read_u16(&raw[9..11])))
}

/// One segment file of a container
#[derive(Debug, Clone)]
pub struct Segment {
    /// 1-based position in the set
    pub number: u16,
    /// Path of the backing file
    pub path: PathBuf,
    /// Current file length in bytes
    pub size: u64,
}

impl Segment {
    /// Whether `incoming` more bytes fit under `limit`, keeping `reserve`
    /// bytes for the sections that close the segment
    pub fn has_room(&self, incoming: u64, reserve: u64, limit: u64) -> bool {
        self.size.saturating_add(incoming).saturating_add(reserve) <= limit
    }
}

/// Ordered set of segment files forming one logical container
#[derive(Debug)]
pub struct SegmentTable {
    variant: FormatVariant,
    segments: Vec<Segment>,
    pool: FilePool,
}

impl SegmentTable {
    /// Create an empty writable table for a new container
    pub fn create(variant: FormatVariant, max_open: usize) -> Result<Self> {
        Ok(Self {
            variant,
            segments: Vec::new(),
            pool: FilePool::new(max_open, true)?,
        })
    }

    /// Open an ordered file set, validating signatures and numbering
    ///
    /// The first file fixes the variant; every file must match it and carry
    /// the number of its position.
    pub fn open(paths: &[PathBuf], max_open: usize, writable: bool) -> Result<Self> {
        if paths.is_empty() {
            return Err(Error::argument("no segment files given"));
        }

        let mut pool = FilePool::new(max_open, writable)?;
        let mut segments = Vec::with_capacity(paths.len());
        let mut variant = None;

        for (index, path) in paths.iter().enumerate() {
            let number = u16::try_from(index + 1)
                .map_err(|_| Error::argument("too many segment files"))?;
            pool.register(number, path.clone());

            let store = pool.store(number)?;
            let (file_variant, stored_number) = read_file_header(store)
                .with_context(|| format!("segment file {} ({})", number, path.display()))?;
            let size = store.len()?;

            match variant {
                None => variant = Some(file_variant),
                Some(expected) if expected != file_variant => {
                    return Err(Error::value_mismatch(format!(
                        "segment file {number} has a different format signature"
                    )));
                }
                Some(_) => {}
            }
            if stored_number != number {
                return Err(Error::value_mismatch(format!(
                    "segment file {} carries number {stored_number}, expected {number}",
                    path.display()
                )));
            }

            segments.push(Segment {
                number,
                path: path.clone(),
                size,
            });
        }

        let variant = variant.ok_or_else(|| Error::runtime("no segment variant resolved"))?;
        debug!("opened {} segment file(s), {variant:?}", segments.len());
        Ok(Self {
            variant,
            segments,
            pool,
        })
    }

    /// Format variant shared by the set
    pub fn variant(&self) -> FormatVariant {
        self.variant
    }

    /// Number of segment files
    pub fn count(&self) -> u16 {
        self.segments.len() as u16
    }

    /// Segments in order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segment by 1-based number
    pub fn get(&self, number: u16) -> Result<&Segment> {
        self.segments
            .get(usize::from(number).wrapping_sub(1))
            .ok_or_else(|| ErrorKind::MissingSegment(number).into())
    }

    /// Last segment of the set
    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    /// Open store of a segment file
    pub fn store(&mut self, number: u16) -> Result<&mut FileStore> {
        self.pool.store(number)
    }

    /// Create the next segment file and write its file header
    pub fn create_next(&mut self, path: PathBuf) -> Result<u16> {
        let number = u16::try_from(self.segments.len() + 1)
            .map_err(|_| Error::argument("too many segment files"))?;
        let variant = self.variant;

        let store = self.pool.create(number, path.clone())?;
        write_file_header(store, variant, number)?;

        debug!("started segment file {number} ({})", path.display());
        self.segments.push(Segment {
            number,
            path,
            size: FILE_HEADER_LEN,
        });
        Ok(number)
    }

    /// Record the current size of a segment file
    pub fn set_size(&mut self, number: u16, size: u64) -> Result<()> {
        let segment = self
            .segments
            .get_mut(usize::from(number).wrapping_sub(1))
            .ok_or(ErrorKind::MissingSegment(number))?;
        segment.size = size;
        Ok(())
    }

    /// Drop every segment past `count`, closing their pooled stores
    ///
    /// The files themselves are left on disk; callers resuming a write
    /// remove them before recreating the numbers.
    pub(crate) fn truncate_to(&mut self, count: u16) {
        while self.segments.len() > usize::from(count) {
            if let Some(segment) = self.segments.pop() {
                self.pool.forget(segment.number);
            }
        }
    }

    /// Registered path of a segment number
    pub(crate) fn path(&self, number: u16) -> Option<&Path> {
        self.pool.path(number)
    }

    /// Flush every open segment file
    pub fn flush_all(&mut self) -> Result<()> {
        self.pool.flush_all()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::io::MemoryStore;

    #[test]
    fn file_header_roundtrip() {
        let mut store = MemoryStore::new();
        write_file_header(&mut store, FormatVariant::Classic, 7).expect("write");

        let (variant, number) = read_file_header(&mut store).expect("read");
        assert_eq!(variant, FormatVariant::Classic);
        assert_eq!(number, 7);
    }

    #[test]
    fn wide_signature_is_distinct() {
        let mut store = MemoryStore::new();
        write_file_header(&mut store, FormatVariant::Wide64, 1).expect("write");

        let (variant, _) = read_file_header(&mut store).expect("read");
        assert_eq!(variant, FormatVariant::Wide64);
    }

    #[test]
    fn foreign_signature_rejected() {
        let mut store = MemoryStore::from_vec(b"NOTEVF\x00\x00\x01\x01\x00\x00\x00".to_vec());

        let err = read_file_header(&mut store).expect_err("bad signature");
        assert!(matches!(err.kind(), ErrorKind::SignatureMismatch(_)));
    }

    #[test]
    fn table_open_validates_numbering() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut paths = Vec::new();
        for number in 1..=2u16 {
            let path = dir.path().join(format!("img.E{number:02}"));
            let mut store = FileStore::create(&path).expect("create");
            // Both files claim to be segment 1.
            write_file_header(&mut store, FormatVariant::Classic, 1).expect("header");
            paths.push(path);
        }

        let err = SegmentTable::open(&paths, 4, false).expect_err("bad numbering");
        assert!(matches!(err.kind(), ErrorKind::ValueMismatch(_)));
    }

    #[test]
    fn table_open_and_create_next() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut table = SegmentTable::create(FormatVariant::Classic, 4).expect("table");

        let first = dir.path().join("img.E01");
        let second = dir.path().join("img.E02");
        assert_eq!(table.create_next(first.clone()).expect("seg 1"), 1);
        assert_eq!(table.create_next(second.clone()).expect("seg 2"), 2);
        table.flush_all().expect("flush");

        let reopened = SegmentTable::open(&[first, second], 4, false).expect("open");
        assert_eq!(reopened.count(), 2);
        assert_eq!(reopened.variant(), FormatVariant::Classic);
        assert_eq!(reopened.get(2).expect("segment 2").size, FILE_HEADER_LEN);
        assert!(matches!(
            reopened.get(3).expect_err("no segment 3").kind(),
            ErrorKind::MissingSegment(3)
        ));
    }

    #[test]
    fn segment_room_accounting() {
        let segment = Segment {
            number: 1,
            path: PathBuf::from("img.E01"),
            size: 1000,
        };
        assert!(segment.has_room(100, 50, 1150));
        assert!(!segment.has_room(100, 51, 1150));
    }
}
