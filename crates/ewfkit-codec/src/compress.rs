//! Deflate-family compression for chunk payloads
//!
//! Chunk payloads compress as zlib streams. Decompression is bounded by the
//! expected chunk size so a corrupt stream can neither balloon memory nor
//! silently truncate.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use tracing::trace;

use crate::{Error, Result};

/// Compression effort for chunk payloads
///
/// The variant is also the wire value stored in the volume body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionLevel {
    /// No compression
    None = 0,
    /// Fastest deflate setting
    #[default]
    Fast = 1,
    /// Best (slowest) deflate setting
    Best = 2,
}

impl CompressionLevel {
    /// Parse the wire byte stored in a volume body
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Fast),
            2 => Some(Self::Best),
            _ => None,
        }
    }

    /// Wire byte for the volume body
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    fn to_flate2(self) -> Compression {
        match self {
            Self::None => Compression::none(),
            Self::Fast => Compression::fast(),
            Self::Best => Compression::best(),
        }
    }
}

/// Compress a chunk payload into a zlib stream
pub fn compress(data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), level.to_flate2());
    encoder.write_all(data).map_err(Error::Io)?;
    let compressed = encoder.finish().map_err(Error::Io)?;

    trace!("deflate: {} bytes -> {} bytes", data.len(), compressed.len());
    Ok(compressed)
}

/// Decompress a zlib stream that must inflate to exactly `expected_size`
/// bytes
///
/// # Errors
///
/// Corrupt streams fail with [`Error::DecompressionFailed`]; a stream that
/// inflates to the wrong length fails with [`Error::SizeMismatch`].
pub fn decompress(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let mut result = Vec::with_capacity(expected_size);
    let mut decoder = ZlibDecoder::new(data).take(expected_size as u64 + 1);

    decoder
        .read_to_end(&mut result)
        .map_err(|e| Error::DecompressionFailed(format!("zlib inflate failed: {e}")))?;

    if result.len() != expected_size {
        return Err(Error::SizeMismatch {
            expected: expected_size,
            actual: result.len(),
        });
    }

    trace!("inflate: {} bytes -> {} bytes", data.len(), result.len());
    Ok(result)
}

/// Decompress a zlib stream of unknown inflated length, bounded by
/// `max_size`
///
/// Metadata bodies carry no inflated-length field, so the caller supplies a
/// sanity cap instead of an exact size.
pub fn decompress_capped(data: &[u8], max_size: usize) -> Result<Vec<u8>> {
    let mut result = Vec::new();
    let mut decoder = ZlibDecoder::new(data).take(max_size as u64 + 1);

    decoder
        .read_to_end(&mut result)
        .map_err(|e| Error::DecompressionFailed(format!("zlib inflate failed: {e}")))?;

    if result.len() > max_size {
        return Err(Error::SizeMismatch {
            expected: max_size,
            actual: result.len(),
        });
    }

    trace!("inflate: {} bytes -> {} bytes", data.len(), result.len());
    Ok(result)
}

/// Decompress a zlib stream embedded at the start of `data`, returning the
/// inflated bytes and the number of input bytes the stream consumed
///
/// Used when rebuilding chunk layouts by scanning raw section bodies, where
/// the compressed extent is unknown until the stream terminates.
pub fn decompress_prefix(data: &[u8], expected_size: usize) -> Result<(Vec<u8>, u64)> {
    let mut decoder = ZlibDecoder::new(data);
    let mut result = vec![0u8; expected_size];
    let mut filled = 0usize;

    while filled < expected_size {
        let read = decoder
            .read(&mut result[filled..])
            .map_err(|e| Error::DecompressionFailed(format!("zlib inflate failed: {e}")))?;
        if read == 0 {
            return Err(Error::SizeMismatch {
                expected: expected_size,
                actual: filled,
            });
        }
        filled += read;
    }

    // The stream must terminate exactly at the expected size.
    let mut probe = [0u8; 1];
    let overshoot = decoder
        .read(&mut probe)
        .map_err(|e| Error::DecompressionFailed(format!("zlib inflate failed: {e}")))?;
    if overshoot != 0 {
        return Err(Error::SizeMismatch {
            expected: expected_size,
            actual: expected_size + overshoot,
        });
    }

    Ok((result, decoder.total_in()))
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn roundtrip_all_levels() {
        let data = b"sector data sector data sector data".repeat(64);
        for level in [
            CompressionLevel::None,
            CompressionLevel::Fast,
            CompressionLevel::Best,
        ] {
            let compressed = compress(&data, level).expect("compress");
            let restored = decompress(&compressed, data.len()).expect("decompress");
            assert_eq!(restored, data);
        }
    }

    #[test]
    fn decompress_rejects_wrong_expected_size() {
        let data = vec![0x5A_u8; 4096];
        let compressed = compress(&data, CompressionLevel::Fast).expect("compress");

        let err = decompress(&compressed, 4095).expect_err("inflates past bound");
        assert!(matches!(err, Error::SizeMismatch { expected: 4095, .. }));

        let err = decompress(&compressed, 4097).expect_err("stream too short");
        assert!(matches!(
            err,
            Error::SizeMismatch {
                expected: 4097,
                actual: 4096
            }
        ));
    }

    #[test]
    fn decompress_rejects_garbage() {
        let err = decompress(&[0xDE, 0xAD, 0xBE, 0xEF], 16).expect_err("not a zlib stream");
        assert!(matches!(err, Error::DecompressionFailed(_)));
    }

    #[test]
    fn capped_decompress_enforces_bound() {
        let data = b"case number: 2026-0042\n".repeat(8);
        let compressed = compress(&data, CompressionLevel::Best).expect("compress");

        let restored = decompress_capped(&compressed, 4096).expect("decompress");
        assert_eq!(restored, data);

        let err = decompress_capped(&compressed, data.len() - 1).expect_err("over cap");
        assert!(matches!(err, Error::SizeMismatch { .. }));
    }

    #[test]
    fn prefix_reports_consumed_bytes() {
        let data = vec![0u8; 8192];
        let mut stored = compress(&data, CompressionLevel::Fast).expect("compress");
        let stream_len = stored.len() as u64;
        // Trailing bytes beyond the stream must not be consumed.
        stored.extend_from_slice(&[0xFF; 32]);

        let (restored, consumed) = decompress_prefix(&stored, data.len()).expect("prefix");
        assert_eq!(restored, data);
        assert_eq!(consumed, stream_len);
    }

    #[test]
    fn level_wire_bytes_roundtrip() {
        for level in [
            CompressionLevel::None,
            CompressionLevel::Fast,
            CompressionLevel::Best,
        ] {
            assert_eq!(CompressionLevel::from_byte(level.as_byte()), Some(level));
        }
        assert_eq!(CompressionLevel::from_byte(9), None);
    }
}
