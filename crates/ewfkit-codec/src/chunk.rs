//! Stored-chunk packing
//!
//! A stored chunk is a payload followed by a CRC32 over exactly those
//! payload bytes. The payload is either the raw chunk data or a zlib
//! stream; the container's offset table records which. The checksum is
//! always present, compressed or not, so corruption detection never depends
//! on the compression state.

use tracing::{trace, warn};

use crate::checksum;
use crate::compress::{CompressionLevel, compress, decompress};
use crate::{Error, Result};

/// Trailing checksum length of every stored chunk
pub const CHUNK_CHECKSUM_LEN: usize = 4;

/// When a chunk payload is kept compressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionPolicy {
    /// Store every chunk raw
    Never,
    /// Keep the compressed form only when strictly smaller than the raw
    /// payload
    #[default]
    IfSmaller,
    /// Always store the compressed form, even when larger
    Always,
}

/// A chunk payload sealed for storage
#[derive(Debug, Clone)]
pub struct PackedChunk {
    /// Payload plus trailing CRC32, exactly as stored on disk
    pub data: Vec<u8>,
    /// Whether the payload is a zlib stream
    pub is_compressed: bool,
}

impl PackedChunk {
    /// Total stored length including the trailing checksum
    pub fn stored_len(&self) -> usize {
        self.data.len()
    }
}

/// Whether every byte of the chunk is zero
pub fn is_zero_filled(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

/// Pack a chunk payload for storage
///
/// Applies the compression policy, then seals the stored payload with its
/// trailing CRC32. Under [`CompressionPolicy::Never`] a fully zero chunk is
/// still compressed when `compress_empty` is set, which keeps sparse media
/// small. [`CompressionLevel::None`] disables the [`CompressionPolicy::IfSmaller`]
/// attempt; where compression is forced anyway, the fast level substitutes.
///
/// An encoder failure never fails the write: the chunk falls back to raw
/// storage with a warning.
pub fn pack_chunk(
    data: &[u8],
    level: CompressionLevel,
    policy: CompressionPolicy,
    compress_empty: bool,
) -> PackedChunk {
    let attempt = match policy {
        CompressionPolicy::Always => true,
        CompressionPolicy::IfSmaller => level != CompressionLevel::None,
        CompressionPolicy::Never => compress_empty && is_zero_filled(data),
    };

    if attempt {
        let level = if level == CompressionLevel::None {
            CompressionLevel::Fast
        } else {
            level
        };
        match compress(data, level) {
            Ok(compressed) => {
                let keep = policy == CompressionPolicy::Always || compressed.len() < data.len();
                if keep {
                    return seal(compressed, true);
                }
                trace!(
                    "chunk did not shrink ({} -> {} bytes), storing raw",
                    data.len(),
                    compressed.len()
                );
            }
            Err(e) => {
                warn!("chunk compression failed, storing raw: {e}");
            }
        }
    }

    seal(data.to_vec(), false)
}

/// Unpack a stored chunk back into its media data
///
/// Splits off the trailing checksum and verifies it first, then inflates
/// when `is_compressed` is set. `expected_size` is the chunk's media data
/// length; raw payloads of any other length are rejected.
///
/// # Errors
///
/// [`Error::ChecksumMismatch`] when the stored CRC32 disagrees with the
/// payload. Decompression failures are fatal for the chunk.
pub fn unpack_chunk(stored: &[u8], expected_size: usize, is_compressed: bool) -> Result<Vec<u8>> {
    if stored.len() <= CHUNK_CHECKSUM_LEN {
        return Err(Error::TruncatedChunk {
            expected: CHUNK_CHECKSUM_LEN + 1,
            actual: stored.len(),
        });
    }

    let (payload, crc_bytes) = stored.split_at(stored.len() - CHUNK_CHECKSUM_LEN);
    let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    checksum::verify(payload, stored_crc)?;

    if is_compressed {
        decompress(payload, expected_size)
    } else if payload.len() == expected_size {
        Ok(payload.to_vec())
    } else {
        Err(Error::SizeMismatch {
            expected: expected_size,
            actual: payload.len(),
        })
    }
}

fn seal(mut payload: Vec<u8>, is_compressed: bool) -> PackedChunk {
    let crc = checksum::crc32(&payload);
    payload.extend_from_slice(&crc.to_le_bytes());
    PackedChunk {
        data: payload,
        is_compressed,
    }
}
