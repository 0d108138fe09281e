//! Writer configuration
//!
//! Everything a new container needs is fixed up front and validated before
//! the first file is created; nothing is deferred to the first write.

use ewfkit_codec::{CompressionLevel, CompressionPolicy};

use crate::io::DEFAULT_MAX_OPEN_FILES;
use crate::media::{MediaFlags, MediaGeometry, MediaType};
use crate::segment::FormatVariant;
use crate::table::MAX_TABLE_ENTRIES;
use crate::values::HeaderCodepage;
use crate::{Error, Result};

/// Smallest permitted segment file size limit
pub const MIN_SEGMENT_FILE_SIZE: u64 = 64 * 1024;

/// Default segment file size limit (1.5 GiB)
pub const DEFAULT_SEGMENT_FILE_SIZE: u64 = 1536 * 1024 * 1024;

/// Configuration for creating a new container
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Format variant of the new container
    pub variant: FormatVariant,
    /// Kind of the acquired media
    pub media_type: MediaType,
    /// Media flags stored in the volume
    pub media_flags: MediaFlags,
    /// Sector size in bytes
    pub bytes_per_sector: u32,
    /// Chunk size in sectors
    pub sectors_per_chunk: u32,
    /// Exact media size when known up front; `None` streams until finalize
    pub media_size: Option<u64>,
    /// Size limit per segment file; reaching it rolls to a new file
    pub segment_file_size: u64,
    /// Deflate effort for chunk payloads
    pub compression_level: CompressionLevel,
    /// When compressed chunk forms are kept
    pub compression_policy: CompressionPolicy,
    /// Compress all-zero chunks even under [`CompressionPolicy::Never`]
    pub compress_empty_chunks: bool,
    /// Acquisition error granularity in sectors; defaults to one chunk
    pub error_granularity: Option<u32>,
    /// Identifier stored in the volume; all zeros when the caller has none
    pub guid: [u8; 16],
    /// Codepage of the single-byte header section
    pub header_codepage: HeaderCodepage,
    /// Most chunk entries per table section
    pub table_entry_limit: u32,
    /// Bound on concurrently open segment files
    pub max_open_files: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            variant: FormatVariant::Classic,
            media_type: MediaType::Fixed,
            media_flags: MediaFlags::default(),
            bytes_per_sector: 512,
            sectors_per_chunk: 64,
            media_size: None,
            segment_file_size: DEFAULT_SEGMENT_FILE_SIZE,
            compression_level: CompressionLevel::Fast,
            compression_policy: CompressionPolicy::IfSmaller,
            compress_empty_chunks: false,
            error_granularity: None,
            guid: [0u8; 16],
            header_codepage: HeaderCodepage::Ascii,
            table_entry_limit: MAX_TABLE_ENTRIES,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }
}

impl WriterConfig {
    /// Validate the configuration as a whole
    pub fn validate(&self) -> Result<()> {
        // Factor and chunk size rules live with the geometry.
        MediaGeometry::new(
            self.bytes_per_sector,
            self.sectors_per_chunk,
            self.media_size.unwrap_or(0),
        )?;

        if self.segment_file_size < MIN_SEGMENT_FILE_SIZE {
            return Err(Error::argument(format!(
                "segment file size {} below the {MIN_SEGMENT_FILE_SIZE} byte minimum",
                self.segment_file_size
            )));
        }
        let max = self.variant.max_segment_size();
        if self.segment_file_size > max {
            return Err(Error::argument(format!(
                "segment file size {} exceeds the {max} byte limit of {:?} containers",
                self.segment_file_size, self.variant
            )));
        }

        if let Some(granularity) = self.error_granularity {
            if granularity == 0 || granularity > self.sectors_per_chunk {
                return Err(Error::argument(format!(
                    "error granularity {granularity} outside 1..={} sectors",
                    self.sectors_per_chunk
                )));
            }
        }

        if self.table_entry_limit == 0 || self.table_entry_limit > MAX_TABLE_ENTRIES {
            return Err(Error::argument(format!(
                "table entry limit {} outside 1..={MAX_TABLE_ENTRIES}",
                self.table_entry_limit
            )));
        }

        if self.max_open_files == 0 {
            return Err(Error::argument("at least one open file must be allowed"));
        }
        Ok(())
    }

    /// Error granularity with the per-chunk default applied
    pub(crate) fn effective_error_granularity(&self) -> u32 {
        self.error_granularity.unwrap_or(self.sectors_per_chunk)
    }
}
