//! Chunk-level codec for EWF-style forensic image containers
//!
//! Containers in this format family store acquired media as fixed-size
//! chunks, each independently compressed and integrity-checked. This crate
//! is that chunk layer and nothing else:
//!
//! - CRC32 checksums over every stored structure ([`checksum`])
//! - deflate (zlib) compression of chunk payloads ([`compress`])
//! - stored-chunk packing and unpacking with storage policy ([`chunk`])
//!
//! Container concerns such as sections, segment files and offset tables
//! live in the `ewfkit` crate.

#![warn(missing_docs)]

pub mod checksum;
pub mod chunk;
pub mod compress;
mod error;

pub use chunk::{
    CHUNK_CHECKSUM_LEN, CompressionPolicy, PackedChunk, is_zero_filled, pack_chunk, unpack_chunk,
};
pub use compress::CompressionLevel;
pub use error::{Error, Result};
