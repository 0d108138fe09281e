//! Error types for chunk packing and unpacking

use thiserror::Error;

/// Result type for codec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Chunk codec error types
#[derive(Error, Debug)]
pub enum Error {
    /// IO error from the underlying encoder or decoder
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored chunk checksum does not match the computed value
    #[error("Checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the stored bytes
        stored: u32,
        /// Checksum computed over the payload
        computed: u32,
    },

    /// Stored chunk too short to carry a payload and trailing checksum
    #[error("Truncated chunk: expected at least {expected} bytes, got {actual}")]
    TruncatedChunk {
        /// Minimum stored length for a valid chunk
        expected: usize,
        /// Length actually available
        actual: usize,
    },

    /// Decompression failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    /// Inflated or raw payload length differs from the chunk's data length
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Chunk data length the container expects
        expected: usize,
        /// Length actually produced
        actual: usize,
    },
}
