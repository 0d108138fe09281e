//! Media geometry and chunk-run address translation
//!
//! A container stores its media as a dense sequence of fixed-size chunks.
//! [`MediaGeometry`] fixes the chunk arithmetic; [`MediaGeometry::chunk_runs`]
//! translates a media byte range into the chunk-relative runs that cover it.

use crate::{Error, Result};

/// Largest permitted chunk size in bytes
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Kind of acquired media (wire byte of the volume body)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MediaType {
    /// Removable storage media
    Removable = 0x00,
    /// Fixed storage media
    #[default]
    Fixed = 0x01,
    /// Optical disc
    Optical = 0x03,
    /// Physical memory
    Memory = 0x10,
}

impl MediaType {
    /// Parse the wire byte stored in a volume body
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Removable),
            0x01 => Some(Self::Fixed),
            0x03 => Some(Self::Optical),
            0x10 => Some(Self::Memory),
            _ => None,
        }
    }

    /// Wire byte for the volume body
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Media flags stored in the volume body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaFlags {
    /// The source was an image file rather than a device
    pub is_image: bool,
    /// The source was a physical device rather than a logical volume
    pub is_physical: bool,
}

impl MediaFlags {
    const IMAGE: u8 = 0x01;
    const PHYSICAL: u8 = 0x02;

    /// Parse the wire byte stored in a volume body
    pub fn from_byte(byte: u8) -> Self {
        Self {
            is_image: byte & Self::IMAGE != 0,
            is_physical: byte & Self::PHYSICAL != 0,
        }
    }

    /// Wire byte for the volume body
    pub fn as_byte(self) -> u8 {
        let mut byte = 0;
        if self.is_image {
            byte |= Self::IMAGE;
        }
        if self.is_physical {
            byte |= Self::PHYSICAL;
        }
        byte
    }
}

impl Default for MediaFlags {
    fn default() -> Self {
        Self {
            is_image: true,
            is_physical: false,
        }
    }
}

/// Chunk arithmetic of one container
///
/// Both factors are fixed at creation; once any chunk data has been written
/// they can never change. The media size may grow during a streamed write
/// and becomes final at finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaGeometry {
    bytes_per_sector: u32,
    sectors_per_chunk: u32,
    media_size: u64,
}

impl MediaGeometry {
    /// Build a geometry, validating the chunk factors
    pub fn new(bytes_per_sector: u32, sectors_per_chunk: u32, media_size: u64) -> Result<Self> {
        if bytes_per_sector == 0 {
            return Err(Error::argument("bytes per sector must be non-zero"));
        }
        if sectors_per_chunk == 0 {
            return Err(Error::argument("sectors per chunk must be non-zero"));
        }
        let chunk_size = u64::from(bytes_per_sector) * u64::from(sectors_per_chunk);
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::argument(format!(
                "chunk size {chunk_size} exceeds the {MAX_CHUNK_SIZE} byte limit"
            )));
        }
        Ok(Self {
            bytes_per_sector,
            sectors_per_chunk,
            media_size,
        })
    }

    /// Sector size in bytes
    pub fn bytes_per_sector(&self) -> u32 {
        self.bytes_per_sector
    }

    /// Chunk size in sectors
    pub fn sectors_per_chunk(&self) -> u32 {
        self.sectors_per_chunk
    }

    /// Total media size in bytes
    pub fn media_size(&self) -> u64 {
        self.media_size
    }

    pub(crate) fn set_media_size(&mut self, media_size: u64) {
        self.media_size = media_size;
    }

    /// Chunk size in bytes
    pub fn chunk_size(&self) -> u64 {
        u64::from(self.bytes_per_sector) * u64::from(self.sectors_per_chunk)
    }

    /// Number of sectors the media occupies, final partial sector included
    pub fn sector_count(&self) -> u64 {
        self.media_size.div_ceil(u64::from(self.bytes_per_sector))
    }

    /// Number of chunks the media occupies, final short chunk included
    pub fn chunk_count(&self) -> u64 {
        self.media_size.div_ceil(self.chunk_size())
    }

    /// Media data length of one chunk; every chunk is full-size except a
    /// short final one
    pub fn chunk_data_len(&self, chunk_index: u64) -> u64 {
        let start = chunk_index.saturating_mul(self.chunk_size());
        if start >= self.media_size {
            return 0;
        }
        (self.media_size - start).min(self.chunk_size())
    }

    /// Sector range covered by one chunk, as (first sector, sector count)
    pub fn chunk_sector_range(&self, chunk_index: u64) -> (u64, u64) {
        let first = chunk_index.saturating_mul(u64::from(self.sectors_per_chunk));
        let len = self.chunk_data_len(chunk_index);
        let count = len.div_ceil(u64::from(self.bytes_per_sector));
        (first, count)
    }

    /// Translate a media byte range into the chunk runs covering it
    ///
    /// The range clamps to the media size; runs tile the clamped range with
    /// no gaps or overlaps, each inside exactly one chunk. The iterator is
    /// a pure function of the geometry and the request.
    pub fn chunk_runs(&self, offset: u64, len: u64) -> ChunkRuns {
        let start = offset.min(self.media_size);
        let end = offset.saturating_add(len).min(self.media_size);
        ChunkRuns {
            chunk_size: self.chunk_size(),
            position: start,
            remaining: end - start,
        }
    }
}

/// One contiguous span of a media request inside a single chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRun {
    /// Chunk the span falls in
    pub chunk_index: u64,
    /// Byte offset of the span inside the chunk
    pub offset_in_chunk: u64,
    /// Span length in bytes
    pub len: u64,
}

/// Iterator of [`ChunkRun`]s covering a media byte range
#[derive(Debug, Clone)]
pub struct ChunkRuns {
    chunk_size: u64,
    position: u64,
    remaining: u64,
}

impl Iterator for ChunkRuns {
    type Item = ChunkRun;

    fn next(&mut self) -> Option<ChunkRun> {
        if self.remaining == 0 {
            return None;
        }
        let chunk_index = self.position / self.chunk_size;
        let offset_in_chunk = self.position % self.chunk_size;
        let len = (self.chunk_size - offset_in_chunk).min(self.remaining);
        self.position += len;
        self.remaining -= len;
        Some(ChunkRun {
            chunk_index,
            offset_in_chunk,
            len,
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn geometry() -> MediaGeometry {
        // 512-byte sectors, 8 sectors per chunk: 4096-byte chunks.
        MediaGeometry::new(512, 8, 10_000).expect("geometry")
    }

    #[test]
    fn derived_values() {
        let g = geometry();
        assert_eq!(g.chunk_size(), 4096);
        assert_eq!(g.sector_count(), 20);
        assert_eq!(g.chunk_count(), 3);
        assert_eq!(g.chunk_data_len(0), 4096);
        assert_eq!(g.chunk_data_len(2), 10_000 - 2 * 4096);
        assert_eq!(g.chunk_data_len(3), 0);
    }

    #[test]
    fn chunk_sector_ranges() {
        let g = geometry();
        assert_eq!(g.chunk_sector_range(0), (0, 8));
        assert_eq!(g.chunk_sector_range(1), (8, 8));
        // 1808 bytes of data in the final chunk: 4 sectors, last partial.
        assert_eq!(g.chunk_sector_range(2), (16, 4));
    }

    #[test]
    fn rejects_zero_factors() {
        assert!(MediaGeometry::new(0, 8, 1).is_err());
        assert!(MediaGeometry::new(512, 0, 1).is_err());
    }

    #[test]
    fn rejects_oversized_chunks() {
        assert!(MediaGeometry::new(65_536, 1024, 0).is_ok());
        assert!(MediaGeometry::new(65_536, 1025, 0).is_err());
    }

    #[test]
    fn run_within_one_chunk() {
        let runs: Vec<_> = geometry().chunk_runs(100, 200).collect();
        assert_eq!(
            runs,
            [ChunkRun {
                chunk_index: 0,
                offset_in_chunk: 100,
                len: 200
            }]
        );
    }

    #[test]
    fn run_crossing_chunks() {
        let runs: Vec<_> = geometry().chunk_runs(4000, 5000).collect();
        assert_eq!(
            runs,
            [
                ChunkRun {
                    chunk_index: 0,
                    offset_in_chunk: 4000,
                    len: 96
                },
                ChunkRun {
                    chunk_index: 1,
                    offset_in_chunk: 0,
                    len: 4096
                },
                ChunkRun {
                    chunk_index: 2,
                    offset_in_chunk: 0,
                    len: 808
                },
            ]
        );
    }

    #[test]
    fn run_clamps_to_media_end() {
        let runs: Vec<_> = geometry().chunk_runs(9000, 5000).collect();
        assert_eq!(
            runs,
            [ChunkRun {
                chunk_index: 2,
                offset_in_chunk: 9000 - 2 * 4096,
                len: 1000
            }]
        );
    }

    #[test]
    fn run_beyond_media_is_empty() {
        assert_eq!(geometry().chunk_runs(10_000, 1).count(), 0);
        assert_eq!(geometry().chunk_runs(20_000, 512).count(), 0);
        assert_eq!(geometry().chunk_runs(0, 0).count(), 0);
    }

    #[test]
    fn media_flags_wire_roundtrip() {
        let flags = MediaFlags {
            is_image: true,
            is_physical: true,
        };
        assert_eq!(MediaFlags::from_byte(flags.as_byte()), flags);
        assert_eq!(MediaFlags::from_byte(0).as_byte(), 0);
    }

    #[test]
    fn media_type_wire_roundtrip() {
        for kind in [
            MediaType::Removable,
            MediaType::Fixed,
            MediaType::Optical,
            MediaType::Memory,
        ] {
            assert_eq!(MediaType::from_byte(kind.as_byte()), Some(kind));
        }
        assert_eq!(MediaType::from_byte(0xFF), None);
    }
}
