//! Chunk read pipeline
//!
//! Index to descriptor, pooled segment read, checksum, inflate. A one-chunk
//! cache keeps sequential buffer reads from unpacking the same chunk once
//! per run. Checksum failures feed the CRC-error tracker and, by default,
//! wipe the chunk to zeros; structural damage always surfaces.

use tracing::warn;

use ewfkit_codec::PackedChunk;

use crate::io::SegmentStore;
use crate::{Context, Error, Result};

use super::{EwfHandle, Mode};

impl EwfHandle {
    /// Read one chunk's media data by index
    ///
    /// Runs the full pipeline on a cache miss: stored bytes, checksum,
    /// inflate. A checksum mismatch is recorded in the CRC-error tracker;
    /// with wipe-on-error set (the default) the chunk then reads as zeros,
    /// otherwise the mismatch is returned. Truncated payloads and broken
    /// zlib streams are always errors.
    pub fn read_chunk(&mut self, index: u64) -> Result<Vec<u8>> {
        self.check_abort()?;
        Ok(self.cached_chunk(index)?.clone())
    }

    /// Read one chunk's stored form without unpacking
    ///
    /// Returns the payload exactly as stored, trailing checksum included,
    /// with its compression flag. Nothing is verified.
    pub fn read_chunk_raw(&mut self, index: u64) -> Result<PackedChunk> {
        let descriptor = *self.chunks.get(index)?;
        let stored = self.read_stored(index)?;
        Ok(PackedChunk {
            data: stored,
            is_compressed: descriptor.is_compressed,
        })
    }

    /// Read from the media stream at the cursor
    ///
    /// Copies up to `buf.len()` bytes and advances the cursor, returning
    /// the number of bytes copied. The count is short only at the end of
    /// the media. Abort is checked once per chunk; on any error the cursor
    /// rewinds to where the call started. Write handles have no read
    /// cursor; chunk-level reads work on them instead.
    pub fn read_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.mode != Mode::Read {
            return Err(Error::runtime("buffered reads need a read handle"));
        }
        let start = self.position;
        match self.read_runs(buf) {
            Ok(copied) => Ok(copied),
            Err(e) => {
                self.position = start;
                Err(e)
            }
        }
    }

    /// Seek to `offset` and read from there
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.seek(offset)?;
        self.read_buffer(buf)
    }

    fn read_runs(&mut self, buf: &mut [u8]) -> Result<usize> {
        let runs: Vec<_> = self
            .geometry
            .chunk_runs(self.position, buf.len() as u64)
            .collect();
        let mut copied = 0usize;
        for run in runs {
            self.check_abort()?;
            let data = self.cached_chunk(run.chunk_index)?;
            let offset = run.offset_in_chunk as usize;
            let len = run.len as usize;
            buf[copied..copied + len].copy_from_slice(&data[offset..offset + len]);
            copied += len;
            self.position += run.len;
        }
        Ok(copied)
    }

    fn cached_chunk(&mut self, index: u64) -> Result<&Vec<u8>> {
        if !matches!(&self.cache, Some((cached, _)) if *cached == index) {
            let data = self.load_chunk(index)?;
            self.cache = Some((index, data));
        }
        let Some((_, data)) = self.cache.as_ref() else {
            return Err(Error::runtime("chunk cache unexpectedly empty"));
        };
        Ok(data)
    }

    fn load_chunk(&mut self, index: u64) -> Result<Vec<u8>> {
        let descriptor = *self.chunks.get(index)?;
        let expected = self.geometry.chunk_data_len(index) as usize;
        let stored = self.read_stored(index)?;

        match ewfkit_codec::unpack_chunk(&stored, expected, descriptor.is_compressed) {
            Ok(data) => Ok(data),
            Err(e @ ewfkit_codec::Error::ChecksumMismatch { .. }) => {
                warn!("chunk {index} failed its checksum: {e}");
                self.record_crc_error(index);
                if self.wipe_on_error {
                    Ok(vec![0u8; expected])
                } else {
                    Err(Error::from(e).with_context(format!("chunk {index}")))
                }
            }
            Err(e) => Err(Error::from(e).with_context(format!("chunk {index}"))),
        }
    }

    fn read_stored(&mut self, index: u64) -> Result<Vec<u8>> {
        let descriptor = *self.chunks.get(index)?;
        let mut stored = vec![0u8; descriptor.stored_size as usize];
        let store = self.segments.store(descriptor.segment_number)?;
        store
            .read_exact_at(descriptor.file_offset, &mut stored)
            .with_context(|| format!("reading stored chunk {index}"))?;
        Ok(stored)
    }
}
