//! Reader and writer for EWF-style forensic disk image containers
//!
//! Acquired media is stored as a stream of fixed-size chunks, each
//! compressed and checksummed independently, split across one or more
//! segment files. Inside every segment a chain of tagged sections carries
//! the chunk data, the offset tables locating it, the media geometry and
//! the acquisition metadata.
//!
//! [`EwfHandle`] is the entry point: open an existing container by its
//! segment paths, create a new one with a [`WriterConfig`], or pick an
//! interrupted acquisition back up with [`EwfHandle::resume`]. Reads
//! verify every chunk's checksum and survive damaged offset tables by
//! falling back to the table backup and, failing that, scanning the raw
//! chunk data. The lower layers (sections, tables, segment naming) are
//! public for tooling that needs to look at a container sideways.
//!
//! ```no_run
//! use ewfkit::{EwfHandle, Result, WriterConfig, header_ids};
//!
//! fn acquire(device: &[u8]) -> Result<()> {
//!     let config = WriterConfig::default();
//!     let mut handle = EwfHandle::create("evidence/disk".as_ref(), &config)?;
//!     handle.set_header_value(header_ids::CASE_NUMBER, "2024-0017")?;
//!     handle.write_buffer(device)?;
//!     handle.write_finalize()?;
//!     handle.close()
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
mod error;
pub mod handle;
pub mod io;
pub mod media;
pub mod naming;
pub mod ranges;
pub mod section;
pub mod segment;
pub mod table;
pub mod values;
pub mod volume;

pub use config::WriterConfig;
pub use error::{Context, Error, ErrorKind, Result};
pub use ewfkit_codec::{CompressionLevel, CompressionPolicy, PackedChunk};
pub use handle::{AbortHandle, EwfHandle};
pub use media::{MediaFlags, MediaGeometry, MediaType};
pub use ranges::RangeEntry;
pub use section::SectionKind;
pub use segment::FormatVariant;
pub use table::ChunkDescriptor;
pub use values::{HeaderCodepage, ParseOutcome, header_ids, hash_ids};
