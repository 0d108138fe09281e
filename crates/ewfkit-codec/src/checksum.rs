//! CRC32 checksum engine
//!
//! Every stored structure in the container format carries a CRC32 (IEEE)
//! over its serialized bytes: section descriptors, table headers and entry
//! blocks, volume bodies, range tables, digest blocks and every stored
//! chunk.

use crate::{Error, Result};

/// Compute the CRC32 (IEEE) checksum of a byte slice
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Verify a stored CRC32 against the checksum computed over `data`
///
/// # Errors
///
/// Returns [`Error::ChecksumMismatch`] carrying both values when they
/// differ.
pub fn verify(data: &[u8], stored: u32) -> Result<()> {
    let computed = crc32(data);
    if computed == stored {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch { stored, computed })
    }
}
