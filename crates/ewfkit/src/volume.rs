//! Volume body codec
//!
//! The `volume` section in the first segment carries the media geometry;
//! every later segment opens with a `data` section carrying an identical
//! body. The body is a fixed 1052-byte little-endian block closed by a
//! CRC32. Chunk and size totals are provisional while a write is running
//! and are patched in place by finalize; that patch is the only in-place
//! rewrite the format permits.

use byteorder::{ByteOrder, LittleEndian};
use ewfkit_codec::CompressionLevel;

use crate::media::{MediaFlags, MediaGeometry, MediaType};
use crate::section::verify_stored_crc;
use crate::{Error, Result};

/// On-disk length of a volume or data section body
pub const VOLUME_BODY_LEN: usize = 1052;

const CRC_OFFSET: usize = 1048;

/// Media description carried by `volume` and `data` section bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Kind of source media
    pub media_type: MediaType,
    /// Media flags
    pub media_flags: MediaFlags,
    /// Total chunks stored (finalize-patched)
    pub chunk_count: u64,
    /// Chunk size in sectors
    pub sectors_per_chunk: u32,
    /// Sector size in bytes
    pub bytes_per_sector: u32,
    /// Total sectors (finalize-patched)
    pub sector_count: u64,
    /// Exact media size in bytes (finalize-patched)
    pub media_size: u64,
    /// Compression effort the writer was configured with
    pub compression_level: CompressionLevel,
    /// Sectors per error-granularity unit
    pub error_granularity: u32,
    /// Acquisition system GUID
    pub guid: [u8; 16],
}

impl VolumeInfo {
    /// Serialize to the fixed 1052-byte body
    pub fn encode(&self) -> Result<Vec<u8>> {
        let chunk_count = u32::try_from(self.chunk_count).map_err(|_| {
            Error::argument(format!(
                "chunk count {} exceeds the format's 32-bit field",
                self.chunk_count
            ))
        })?;

        let mut body = vec![0u8; VOLUME_BODY_LEN];
        body[0] = self.media_type.as_byte();
        LittleEndian::write_u32(&mut body[4..8], chunk_count);
        LittleEndian::write_u32(&mut body[8..12], self.sectors_per_chunk);
        LittleEndian::write_u32(&mut body[12..16], self.bytes_per_sector);
        LittleEndian::write_u64(&mut body[16..24], self.sector_count);
        LittleEndian::write_u64(&mut body[24..32], self.media_size);
        body[36] = self.media_flags.as_byte();
        body[52] = self.compression_level.as_byte();
        LittleEndian::write_u32(&mut body[56..60], self.error_granularity);
        body[64..80].copy_from_slice(&self.guid);

        let crc = ewfkit_codec::checksum::crc32(&body[..CRC_OFFSET]);
        LittleEndian::write_u32(&mut body[CRC_OFFSET..], crc);
        Ok(body)
    }

    /// Parse a volume or data section body
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() != VOLUME_BODY_LEN {
            return Err(Error::corrupt(format!(
                "volume body is {} bytes, expected {VOLUME_BODY_LEN}",
                body.len()
            )));
        }
        let stored_crc = LittleEndian::read_u32(&body[CRC_OFFSET..]);
        verify_stored_crc("volume body", &body[..CRC_OFFSET], stored_crc)?;

        let media_type = MediaType::from_byte(body[0])
            .ok_or_else(|| Error::corrupt(format!("unknown media type {:#04x}", body[0])))?;
        let compression_level = CompressionLevel::from_byte(body[52])
            .ok_or_else(|| Error::corrupt(format!("unknown compression level {}", body[52])))?;

        let mut guid = [0u8; 16];
        guid.copy_from_slice(&body[64..80]);

        Ok(Self {
            media_type,
            media_flags: MediaFlags::from_byte(body[36]),
            chunk_count: u64::from(LittleEndian::read_u32(&body[4..8])),
            sectors_per_chunk: LittleEndian::read_u32(&body[8..12]),
            bytes_per_sector: LittleEndian::read_u32(&body[12..16]),
            sector_count: LittleEndian::read_u64(&body[16..24]),
            media_size: LittleEndian::read_u64(&body[24..32]),
            compression_level,
            error_granularity: LittleEndian::read_u32(&body[56..60]),
            guid,
        })
    }

    /// Geometry described by this body
    pub fn geometry(&self) -> Result<MediaGeometry> {
        MediaGeometry::new(self.bytes_per_sector, self.sectors_per_chunk, self.media_size)
    }

    /// Check the stored totals against the geometry they must derive from
    ///
    /// Used after opening a finalized container; a body written mid-write
    /// carries provisional totals and must not be checked.
    pub fn check_totals(&self) -> Result<()> {
        let geometry = self.geometry()?;
        if self.sector_count != geometry.sector_count() {
            return Err(Error::value_mismatch(format!(
                "volume sector count {} does not match media size (expected {})",
                self.sector_count,
                geometry.sector_count()
            )));
        }
        if self.chunk_count != geometry.chunk_count() {
            return Err(Error::value_mismatch(format!(
                "volume chunk count {} does not match media size (expected {})",
                self.chunk_count,
                geometry.chunk_count()
            )));
        }
        Ok(())
    }

    /// Check that a `data` section body agrees with the first segment's
    /// `volume` body
    pub fn check_matches(&self, other: &Self) -> Result<()> {
        if self == other {
            Ok(())
        } else {
            Err(Error::value_mismatch(
                "data section disagrees with the volume section",
            ))
        }
    }
}
