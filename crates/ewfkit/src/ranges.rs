//! Sector-range trackers
//!
//! Acquisition errors, read checksum errors and optical sessions all share
//! one shape: an insertion-ordered list of (first sector, sector count)
//! ranges. Appends are blind; nothing sorts, merges or de-overlaps, and
//! lookups are by insertion index, mirroring how the flat section records
//! persist. Acquisition errors and sessions are stored in `error2` and
//! `session` sections; checksum errors exist only at runtime.

use byteorder::{ByteOrder, LittleEndian};

use ewfkit_codec::checksum::crc32;

use crate::section::verify_stored_crc;
use crate::{Error, Result};

const ENTRY_LEN: usize = 12;

/// One sector range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeEntry {
    /// First sector of the range
    pub first_sector: u64,
    /// Number of sectors covered
    pub sector_count: u64,
}

/// Insertion-ordered list of sector ranges
#[derive(Debug, Clone)]
pub struct RangeTracker {
    what: &'static str,
    entries: Vec<RangeEntry>,
}

impl RangeTracker {
    pub(crate) fn new(what: &'static str) -> Self {
        Self {
            what,
            entries: Vec::new(),
        }
    }

    /// Append a range
    ///
    /// Zero-length ranges are rejected, as are counts beyond what the wire
    /// encoding stores.
    pub fn add(&mut self, first_sector: u64, sector_count: u64) -> Result<()> {
        if sector_count == 0 {
            return Err(Error::argument(format!(
                "{} range must cover at least one sector",
                self.what
            )));
        }
        if sector_count > u64::from(u32::MAX) {
            return Err(Error::argument(format!(
                "{} range of {sector_count} sectors exceeds the storable limit",
                self.what
            )));
        }
        self.entries.push(RangeEntry {
            first_sector,
            sector_count,
        });
        Ok(())
    }

    /// Number of ranges recorded
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Whether no ranges are recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Range by insertion index
    pub fn get(&self, index: u64) -> Result<RangeEntry> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i))
            .copied()
            .ok_or_else(|| Error::out_of_range(self.what, index, self.len()))
    }

    /// Ranges in insertion order
    pub fn entries(&self) -> &[RangeEntry] {
        &self.entries
    }

    /// Iterate the ranges in insertion order
    pub fn iter(&self) -> impl Iterator<Item = RangeEntry> + '_ {
        self.entries.iter().copied()
    }
}

/// Body shape of a persisted range section; the two differ only in the
/// reserved area of their header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RangeBodyKind {
    /// `error2` section
    AcquiryErrors,
    /// `session` section
    Sessions,
}

impl RangeBodyKind {
    fn reserved_len(self) -> usize {
        match self {
            Self::AcquiryErrors => 512,
            Self::Sessions => 28,
        }
    }

    fn header_len(self) -> usize {
        4 + self.reserved_len() + 4
    }
}

/// Encode a tracker as a range section body
pub(crate) fn encode_range_body(kind: RangeBodyKind, tracker: &RangeTracker) -> Result<Vec<u8>> {
    let count = u32::try_from(tracker.len())
        .map_err(|_| Error::argument(format!("too many {} ranges to store", tracker.what)))?;

    let header_len = kind.header_len();
    let entries_end = header_len + tracker.entries.len() * ENTRY_LEN;
    let mut body = vec![0u8; entries_end + 4];

    LittleEndian::write_u32(&mut body[0..4], count);
    let header_crc = crc32(&body[..header_len - 4]);
    LittleEndian::write_u32(&mut body[header_len - 4..header_len], header_crc);

    let mut at = header_len;
    for entry in &tracker.entries {
        LittleEndian::write_u64(&mut body[at..at + 8], entry.first_sector);
        LittleEndian::write_u32(&mut body[at + 8..at + 12], entry.sector_count as u32);
        at += ENTRY_LEN;
    }
    let entries_crc = crc32(&body[header_len..at]);
    LittleEndian::write_u32(&mut body[at..at + 4], entries_crc);
    Ok(body)
}

/// Decode a range section body into a tracker named `what`
pub(crate) fn decode_range_body(
    kind: RangeBodyKind,
    body: &[u8],
    what: &'static str,
) -> Result<RangeTracker> {
    let header_len = kind.header_len();
    if body.len() < header_len {
        return Err(Error::corrupt("range section body shorter than its header"));
    }

    let count = LittleEndian::read_u32(&body[0..4]);
    let stored_crc = LittleEndian::read_u32(&body[header_len - 4..header_len]);
    verify_stored_crc("range header", &body[..header_len - 4], stored_crc)?;

    let entries_end = header_len + count as usize * ENTRY_LEN;
    if body.len() < entries_end + 4 {
        return Err(Error::corrupt("range section body truncated"));
    }
    let entries_bytes = &body[header_len..entries_end];
    let stored_crc = LittleEndian::read_u32(&body[entries_end..entries_end + 4]);
    verify_stored_crc("range entries", entries_bytes, stored_crc)?;

    let mut tracker = RangeTracker::new(what);
    for raw in entries_bytes.chunks_exact(ENTRY_LEN) {
        tracker.entries.push(RangeEntry {
            first_sector: LittleEndian::read_u64(&raw[0..8]),
            sector_count: u64::from(LittleEndian::read_u32(&raw[8..12])),
        });
    }
    Ok(tracker)
}
