//! Segment file naming and sibling discovery
//!
//! Segment files share a stem and differ only in extension. The series
//! runs `E01` through `E99`, then three-letter extensions `EAA` through
//! `ZZZ`. Sets written with a lowercase first extension stay lowercase.

use std::path::{Path, PathBuf};

use tracing::trace;

use crate::io::{FileStore, SegmentStore};
use crate::segment::FormatVariant;
use crate::{Error, Result};

/// Largest segment count the extension series can name
pub const MAX_SEGMENT_FILES: u16 = 14971;

/// Extension for a 1-based segment number
pub fn extension_for(segment_number: u16, lowercase: bool) -> Result<String> {
    if segment_number == 0 {
        return Err(Error::argument("segment numbers start at 1"));
    }
    if segment_number > MAX_SEGMENT_FILES {
        return Err(Error::argument(format!(
            "segment number {segment_number} exceeds the extension series"
        )));
    }

    let extension = if segment_number < 100 {
        format!("E{segment_number:02}")
    } else {
        let n = u32::from(segment_number) - 100;
        let letters = [
            b'E' + (n / 676) as u8,
            b'A' + ((n % 676) / 26) as u8,
            b'A' + (n % 26) as u8,
        ];
        String::from_utf8_lossy(&letters).into_owned()
    };

    if lowercase {
        Ok(extension.to_ascii_lowercase())
    } else {
        Ok(extension)
    }
}

fn uses_lowercase_series(first: &Path) -> bool {
    first
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.chars().all(|c| !c.is_ascii_uppercase()))
}

/// Path of another segment in the same set as `first`
pub fn sibling_path(first: &Path, segment_number: u16) -> Result<PathBuf> {
    let extension = extension_for(segment_number, uses_lowercase_series(first))?;
    Ok(first.with_extension(extension))
}

/// Enumerate the segment files of the set starting at `first`
///
/// Probes successive extensions until the first missing file. The result
/// always begins with `first`, which must exist.
pub fn discover(first: &Path) -> Result<Vec<PathBuf>> {
    if !first.is_file() {
        return Err(Error::argument(format!(
            "segment file {} not found",
            first.display()
        )));
    }

    let mut paths = vec![first.to_path_buf()];
    for number in 2..=MAX_SEGMENT_FILES {
        let candidate = sibling_path(first, number)?;
        if !candidate.is_file() {
            break;
        }
        paths.push(candidate);
    }

    trace!("discovered {} segment file(s)", paths.len());
    Ok(paths)
}

/// Probe the first bytes of a file for a known format signature
pub fn check_file_signature(path: &Path) -> Result<Option<FormatVariant>> {
    let mut store = FileStore::open(path)?;
    if store.len()? < 8 {
        return Ok(None);
    }
    let mut signature = [0u8; 8];
    store.read_exact_at(0, &mut signature)?;
    Ok(FormatVariant::from_signature(&signature))
}
