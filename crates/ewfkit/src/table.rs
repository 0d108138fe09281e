//! Chunk offset tables
//!
//! Each `sectors` section is followed by a `table` section mapping chunk
//! indexes to stored offsets, usually shadowed by an identical `table2`
//! backup. A table body is a 24-byte header (entry count, base offset,
//! header CRC32), the packed entries and a CRC32 over the entries. Entries
//! are offsets relative to the base with the top bit flagging compression;
//! stored chunk sizes are implicit in consecutive offsets, the last chunk
//! bounded by the end of the sectors section.
//!
//! When both tables of a group fail to validate, the chunk layout is
//! rebuilt by scanning the sectors data itself.

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use ewfkit_codec::checksum::crc32;
use ewfkit_codec::compress::decompress_prefix;

use crate::io::SegmentStore;
use crate::media::MediaGeometry;
use crate::section::{SectionDescriptor, verify_stored_crc};
use crate::segment::FormatVariant;
use crate::{Error, Result};

/// Most entries one table section may hold
pub const MAX_TABLE_ENTRIES: u32 = 16_375;

pub(crate) const TABLE_HEADER_LEN: usize = 24;

const MAX_TABLE_BODY_LEN: u64 = (TABLE_HEADER_LEN + MAX_TABLE_ENTRIES as usize * 8 + 4) as u64;

/// Storage location of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Segment file holding the chunk
    pub segment_number: u16,
    /// Absolute offset of the stored payload in that file
    pub file_offset: u64,
    /// Stored length in bytes, trailing checksum included
    pub stored_size: u32,
    /// Whether the stored payload is a zlib stream
    pub is_compressed: bool,
}

/// Container-wide chunk index, merged across all segment files
#[derive(Debug, Default)]
pub(crate) struct ChunkOffsetTable {
    descriptors: Vec<ChunkDescriptor>,
}

impl ChunkOffsetTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> u64 {
        self.descriptors.len() as u64
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub(crate) fn get(&self, index: u64) -> Result<&ChunkDescriptor> {
        let len = self.len();
        usize::try_from(index)
            .ok()
            .and_then(|i| self.descriptors.get(i))
            .ok_or_else(|| Error::out_of_range("chunk", index, len))
    }

    pub(crate) fn extend(&mut self, descriptors: impl IntoIterator<Item = ChunkDescriptor>) {
        self.descriptors.extend(descriptors);
    }

    pub(crate) fn truncate(&mut self, len: u64) {
        if let Ok(len) = usize::try_from(len) {
            self.descriptors.truncate(len);
        }
    }
}

/// Encode a table body from absolute chunk offsets
///
/// Offsets become base-relative on the wire. The classic variant packs each
/// into 31 bits, so the caller keeps segment files below 2 GiB.
pub(crate) fn encode_table_body(
    variant: FormatVariant,
    base_offset: u64,
    entries: &[(u64, bool)],
) -> Result<Vec<u8>> {
    if entries.len() > MAX_TABLE_ENTRIES as usize {
        return Err(Error::argument(format!(
            "{} entries exceed the per-table limit of {MAX_TABLE_ENTRIES}",
            entries.len()
        )));
    }

    let entry_len = variant.table_entry_len();
    let entries_end = TABLE_HEADER_LEN + entries.len() * entry_len;
    let mut body = vec![0u8; entries_end + 4];

    LittleEndian::write_u32(&mut body[0..4], entries.len() as u32);
    LittleEndian::write_u64(&mut body[8..16], base_offset);
    let header_crc = crc32(&body[..20]);
    LittleEndian::write_u32(&mut body[20..24], header_crc);

    let mut at = TABLE_HEADER_LEN;
    for &(offset, is_compressed) in entries {
        let relative = offset
            .checked_sub(base_offset)
            .ok_or_else(|| Error::argument("chunk offset before the table base"))?;
        match variant {
            FormatVariant::Classic => {
                if relative > 0x7FFF_FFFF {
                    return Err(Error::argument(format!(
                        "chunk offset {relative} beyond the 31-bit table range"
                    )));
                }
                let mut packed = relative as u32;
                if is_compressed {
                    packed |= 0x8000_0000;
                }
                LittleEndian::write_u32(&mut body[at..at + 4], packed);
            }
            FormatVariant::Wide64 => {
                if relative >= 1 << 63 {
                    return Err(Error::argument(format!(
                        "chunk offset {relative} beyond the 63-bit table range"
                    )));
                }
                let mut packed = relative;
                if is_compressed {
                    packed |= 1 << 63;
                }
                LittleEndian::write_u64(&mut body[at..at + 8], packed);
            }
        }
        at += entry_len;
    }

    let entries_crc = crc32(&body[TABLE_HEADER_LEN..at]);
    LittleEndian::write_u32(&mut body[at..at + 4], entries_crc);
    Ok(body)
}

/// Decode a table body into its base offset and absolute entries
pub(crate) fn decode_table_body(
    variant: FormatVariant,
    body: &[u8],
) -> Result<(u64, Vec<(u64, bool)>)> {
    if body.len() < TABLE_HEADER_LEN {
        return Err(Error::corrupt("table body shorter than its header"));
    }

    let count = LittleEndian::read_u32(&body[0..4]);
    let base_offset = LittleEndian::read_u64(&body[8..16]);
    let stored_crc = LittleEndian::read_u32(&body[20..24]);
    verify_stored_crc("table header", &body[..20], stored_crc)?;

    if count > MAX_TABLE_ENTRIES {
        return Err(Error::corrupt(format!(
            "table entry count {count} exceeds the limit of {MAX_TABLE_ENTRIES}"
        )));
    }

    let entry_len = variant.table_entry_len();
    let entries_end = TABLE_HEADER_LEN + count as usize * entry_len;
    if body.len() < entries_end + 4 {
        return Err(Error::corrupt("table body truncated"));
    }
    let entries_bytes = &body[TABLE_HEADER_LEN..entries_end];
    let stored_crc = LittleEndian::read_u32(&body[entries_end..entries_end + 4]);
    verify_stored_crc("table entries", entries_bytes, stored_crc)?;

    let mut entries = Vec::with_capacity(count as usize);
    for raw in entries_bytes.chunks_exact(entry_len) {
        let (relative, is_compressed) = match variant {
            FormatVariant::Classic => {
                let packed = LittleEndian::read_u32(raw);
                (u64::from(packed & 0x7FFF_FFFF), packed & 0x8000_0000 != 0)
            }
            FormatVariant::Wide64 => {
                let packed = LittleEndian::read_u64(raw);
                (packed & !(1 << 63), packed & (1 << 63) != 0)
            }
        };
        entries.push((base_offset + relative, is_compressed));
    }
    Ok((base_offset, entries))
}

/// One sectors section with its table and optional backup table
#[derive(Debug, Clone)]
pub(crate) struct ChunkGroup {
    pub(crate) segment_number: u16,
    pub(crate) sectors: SectionDescriptor,
    pub(crate) table: SectionDescriptor,
    pub(crate) table2: Option<SectionDescriptor>,
}

impl ChunkGroup {
    /// Load the group's chunk descriptors, falling back from the table to
    /// its backup and finally to a scan of the sectors data
    ///
    /// `start_index` is the container-wide index of the group's first chunk;
    /// the scan needs it to know each chunk's media data length.
    pub(crate) fn load(
        &self,
        store: &mut dyn SegmentStore,
        variant: FormatVariant,
        geometry: &MediaGeometry,
        start_index: u64,
    ) -> Result<Vec<ChunkDescriptor>> {
        match self.load_from(store, variant, &self.table) {
            Ok(descriptors) => return Ok(descriptors),
            Err(e) => warn!(
                "table section at offset {} unusable: {e}",
                self.table.offset
            ),
        }

        if let Some(table2) = &self.table2 {
            match self.load_from(store, variant, table2) {
                Ok(descriptors) => {
                    debug!("chunk offsets recovered from the backup table");
                    return Ok(descriptors);
                }
                Err(e) => warn!("backup table at offset {} unusable: {e}", table2.offset),
            }
        }

        warn!(
            "both tables of the sectors section at offset {} are damaged, scanning chunk data",
            self.sectors.offset
        );
        rebuild_by_scan(
            store,
            self.segment_number,
            &self.sectors,
            geometry,
            start_index,
        )
    }

    fn load_from(
        &self,
        store: &mut dyn SegmentStore,
        variant: FormatVariant,
        table: &SectionDescriptor,
    ) -> Result<Vec<ChunkDescriptor>> {
        let body_len = table.body_len();
        if body_len < TABLE_HEADER_LEN as u64 + 4 {
            return Err(Error::corrupt("table section body too short"));
        }
        if body_len > MAX_TABLE_BODY_LEN {
            return Err(Error::corrupt("table section body implausibly large"));
        }
        let mut body = vec![0u8; body_len as usize];
        store.read_exact_at(table.body_offset(), &mut body)?;
        let (_, entries) = decode_table_body(variant, &body)?;

        let data_start = self.sectors.body_offset();
        let data_end = self.sectors.end_offset();
        let mut descriptors = Vec::with_capacity(entries.len());
        for (i, &(offset, is_compressed)) in entries.iter().enumerate() {
            if offset < data_start || offset >= data_end {
                return Err(Error::corrupt(format!(
                    "table entry {i} points outside the sectors data"
                )));
            }
            let next = entries
                .get(i + 1)
                .map_or(data_end, |&(next_offset, _)| next_offset);
            if next <= offset {
                return Err(Error::corrupt(format!(
                    "table entries not increasing at entry {i}"
                )));
            }
            let stored_size = u32::try_from(next - offset)
                .map_err(|_| Error::corrupt(format!("stored chunk {i} implausibly large")))?;
            if stored_size <= 4 {
                return Err(Error::corrupt(format!("stored chunk {i} impossibly small")));
            }
            descriptors.push(ChunkDescriptor {
                segment_number: self.segment_number,
                file_offset: offset,
                stored_size,
                is_compressed,
            });
        }
        Ok(descriptors)
    }
}

fn looks_like_zlib(b0: u8, b1: u8) -> bool {
    // Deflate method nibble plus the FCHECK divisibility rule.
    b0 & 0x0F == 8 && (u16::from(b0) << 8 | u16::from(b1)) % 31 == 0
}

/// Rebuild a group's chunk descriptors by scanning its sectors data
///
/// Walks the section body chunk by chunk. A position whose first bytes form
/// a zlib header is tried as a compressed chunk: the stream is inflated to
/// the chunk's media length and confirmed against the trailing checksum.
/// Anything else is tried as a raw chunk of the expected length. The scan
/// must account for every byte of the section.
pub(crate) fn rebuild_by_scan(
    store: &mut dyn SegmentStore,
    segment_number: u16,
    sectors: &SectionDescriptor,
    geometry: &MediaGeometry,
    start_index: u64,
) -> Result<Vec<ChunkDescriptor>> {
    let mut pos = sectors.body_offset();
    let end = sectors.end_offset();
    let total_chunks = geometry.chunk_count();
    let mut found = Vec::new();

    while pos < end {
        let index = start_index + found.len() as u64;
        if index >= total_chunks {
            return Err(Error::corrupt(format!(
                "sectors data at offset {pos} extends past the declared {total_chunks} chunk(s)"
            )));
        }
        let expected = geometry.chunk_data_len(index) as usize;
        let rest = end - pos;

        let mut stored_len = None;
        if rest >= 2 {
            let mut head = [0u8; 2];
            store.read_exact_at(pos, &mut head)?;
            if looks_like_zlib(head[0], head[1]) {
                stored_len = scan_compressed_len(store, pos, rest, expected)?;
            }
        }
        let (stored_size, is_compressed) = match stored_len {
            Some(len) => (len, true),
            None => match scan_raw_len(store, pos, rest, expected)? {
                Some(len) => (len, false),
                None => {
                    return Err(Error::corrupt(format!(
                        "no valid chunk at offset {pos} while scanning sectors data"
                    )));
                }
            },
        };

        let stored_size = u32::try_from(stored_size)
            .map_err(|_| Error::corrupt("scanned chunk implausibly large"))?;
        found.push(ChunkDescriptor {
            segment_number,
            file_offset: pos,
            stored_size,
            is_compressed,
        });
        pos += u64::from(stored_size);
    }

    debug!(
        "rebuilt {} chunk descriptor(s) from sectors data at offset {}",
        found.len(),
        sectors.offset
    );
    Ok(found)
}

/// Try the bytes at `pos` as a compressed chunk; `None` means no valid
/// compressed chunk starts here
fn scan_compressed_len(
    store: &mut dyn SegmentStore,
    pos: u64,
    rest: u64,
    expected: usize,
) -> Result<Option<u64>> {
    // Worst-case deflate expansion of the payload, plus the checksum.
    let window = ((expected + expected / 64 + 512) as u64).min(rest);
    let mut buf = vec![0u8; window as usize];
    store.read_exact_at(pos, &mut buf)?;

    let Ok((_, consumed)) = decompress_prefix(&buf, expected) else {
        return Ok(None);
    };
    if consumed + 4 > rest {
        return Ok(None);
    }

    let crc_at = consumed as usize;
    let stored_crc = if crc_at + 4 <= buf.len() {
        LittleEndian::read_u32(&buf[crc_at..crc_at + 4])
    } else {
        let mut crc_bytes = [0u8; 4];
        store.read_exact_at(pos + consumed, &mut crc_bytes)?;
        u32::from_le_bytes(crc_bytes)
    };
    if crc32(&buf[..crc_at]) != stored_crc {
        return Ok(None);
    }
    Ok(Some(consumed + 4))
}

/// Try the bytes at `pos` as a raw chunk of `expected` media bytes
fn scan_raw_len(
    store: &mut dyn SegmentStore,
    pos: u64,
    rest: u64,
    expected: usize,
) -> Result<Option<u64>> {
    let needed = expected as u64 + 4;
    if rest < needed {
        return Ok(None);
    }
    let mut buf = vec![0u8; needed as usize];
    store.read_exact_at(pos, &mut buf)?;

    let (payload, crc_bytes) = buf.split_at(expected);
    if crc32(payload) != LittleEndian::read_u32(crc_bytes) {
        return Ok(None);
    }
    Ok(Some(needed))
}
