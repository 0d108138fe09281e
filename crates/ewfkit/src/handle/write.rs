//! Chunk write pipeline, container creation and write resume
//!
//! A writer appends chunks into an open `sectors` run, closing the run
//! with its `table` and `table2` sections when the entry limit is hit and
//! rolling to the next segment file when the current one is full. Segment
//! 1 opens lazily at the first chunk with the header sections and the
//! volume; later segments open with a `data` copy of the volume. Finalize
//! writes the closing sections and patches every volume body with the
//! final totals, so an interrupted session leaves provisional zeros that
//! [`EwfHandle::resume`] knows how to pick up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{debug, trace, warn};

use ewfkit_codec::pack_chunk;

use crate::config::{DEFAULT_SEGMENT_FILE_SIZE, MIN_SEGMENT_FILE_SIZE, WriterConfig};
use crate::io::{DEFAULT_MAX_OPEN_FILES, SegmentStore};
use crate::media::MediaGeometry;
use crate::naming;
use crate::ranges::{RangeBodyKind, RangeTracker, decode_range_body, encode_range_body};
use crate::section::{self, SECTION_DESCRIPTOR_LEN, SectionDescriptor, SectionKind};
use crate::segment::{FILE_HEADER_LEN, FormatVariant, SegmentTable};
use crate::table::{self, ChunkDescriptor, ChunkGroup, ChunkOffsetTable, MAX_TABLE_ENTRIES, TABLE_HEADER_LEN};
use crate::values::{self, ValueStore};
use crate::volume::VolumeInfo;
use crate::{Context, Error, ErrorKind, Result};

use super::{EwfHandle, GroupSpan, Mode, scan_segments};

/// How many trailing chunks a resume re-verifies against their checksums
const RESUME_VERIFY_WINDOW: u64 = 8;

/// Mutable state of an in-progress write session
#[derive(Debug)]
pub(crate) struct WriterState {
    first_path: PathBuf,
    pub(crate) segment_file_size: u64,
    table_entry_limit: u32,
    pub(crate) media_size_cap: Option<u64>,
    bytes_written: u64,
    pending: Vec<u8>,
    open_group: Option<OpenGroup>,
    write_pos: u64,
    pub(crate) started: bool,
    pub(crate) finalized: bool,
    stream_complete: bool,
    volume_offset: u64,
    data_offsets: Vec<(u16, u64)>,
}

impl WriterState {
    /// End of the data consumed so far, buffered tail included
    pub(crate) fn stream_position(&self) -> u64 {
        self.bytes_written + self.pending.len() as u64
    }
}

/// A `sectors` run that is still accepting chunks
#[derive(Debug)]
struct OpenGroup {
    segment_number: u16,
    sectors_offset: u64,
    entries: Vec<(u64, bool)>,
}

impl EwfHandle {
    /// Create a new container
    ///
    /// `base_path` names the first segment file; its extension is replaced
    /// with the first of the series, and sibling files are created next to
    /// it as the stream grows. Nothing beyond the file header is written
    /// until the first chunk arrives, so header values and volume metadata
    /// stay settable until then.
    pub fn create(base_path: &Path, config: &WriterConfig) -> Result<Self> {
        config.validate()?;
        let geometry = MediaGeometry::new(
            config.bytes_per_sector,
            config.sectors_per_chunk,
            config.media_size.unwrap_or(0),
        )?;

        let mut segments = SegmentTable::create(config.variant, config.max_open_files)?;
        let first_path = base_path.with_extension(naming::extension_for(1, false)?);
        segments.create_next(first_path.clone())?;

        debug!("created container at {}", first_path.display());
        Ok(Self {
            mode: Mode::Write,
            variant: config.variant,
            geometry,
            media_type: config.media_type,
            media_flags: config.media_flags,
            compression_level: config.compression_level,
            compression_policy: config.compression_policy,
            compress_empty_chunks: config.compress_empty_chunks,
            error_granularity: config.effective_error_granularity(),
            guid: config.guid,
            header_codepage: config.header_codepage,
            segments,
            chunks: ChunkOffsetTable::new(),
            spans: Vec::new(),
            header_values: ValueStore::new("header values"),
            hash_values: ValueStore::new("hash values"),
            header_bodies: Vec::new(),
            hash_bodies: Vec::new(),
            acquiry_errors: RangeTracker::new("acquisition error"),
            crc_errors: RangeTracker::new("checksum error"),
            sessions: RangeTracker::new("session"),
            position: 0,
            wipe_on_error: true,
            abort: Arc::new(AtomicBool::new(false)),
            cache: None,
            writer: Some(WriterState {
                first_path,
                segment_file_size: config.segment_file_size,
                table_entry_limit: config.table_entry_limit,
                media_size_cap: config.media_size,
                bytes_written: 0,
                pending: Vec::new(),
                open_group: None,
                write_pos: FILE_HEADER_LEN,
                started: false,
                finalized: false,
                stream_complete: false,
                volume_offset: 0,
                data_offsets: Vec::new(),
            }),
        })
    }

    /// Reopen an interrupted write session
    ///
    /// Walks the existing segment files leniently, keeps every chunk run
    /// whose offset tables still decode, drops the unclosed tail, verifies
    /// the last kept chunks against their checksums and truncates the
    /// files to the end of the verified data. Writing continues exactly
    /// after the last verified chunk. A container already terminated by
    /// `done` fails with the already-finalized error.
    pub fn resume(first_path: &Path) -> Result<Self> {
        let mut paths = naming::discover(first_path)?;
        drop_torn_trailing_files(&mut paths)?;

        let mut segments = SegmentTable::open(&paths, DEFAULT_MAX_OPEN_FILES, true)?;
        let parts = scan_segments(&mut segments, false)?;
        if parts.last_terminal == Some(SectionKind::Done) {
            return Err(ErrorKind::AlreadyFinalized.into());
        }
        let volume = parts.volume.ok_or(ErrorKind::MissingSection("volume"))?;
        let volume_descriptor = parts
            .volume_descriptor
            .ok_or(ErrorKind::MissingSection("volume"))?;
        let mut geometry = volume.geometry()?;
        let chunk_size = geometry.chunk_size();

        // Keep groups until the first one that fails to load.
        let mut chunks = ChunkOffsetTable::new();
        let mut spans: Vec<GroupSpan> = Vec::new();
        for group in parts.groups {
            let store = segments.store(group.segment_number)?;
            match group.load(store, parts.variant, &geometry, chunks.len()) {
                Ok(descriptors) => {
                    spans.push(GroupSpan {
                        group,
                        first_chunk: chunks.len(),
                        chunk_count: descriptors.len() as u64,
                    });
                    chunks.extend(descriptors);
                }
                Err(e) => {
                    warn!(
                        "dropping chunk run at offset {} in segment {}: {e}",
                        group.sectors.offset, group.segment_number
                    );
                    break;
                }
            }
        }

        // Interrupted streams hold only full chunks; totals in the volume
        // are provisional, so the kept chunks define the media.
        geometry.set_media_size(chunks.len().saturating_mul(chunk_size));
        let valid = verify_tail(&mut segments, &chunks, chunk_size)?;
        if valid < chunks.len() {
            while spans
                .last()
                .is_some_and(|span| span.first_chunk + span.chunk_count > valid)
            {
                spans.pop();
            }
            let kept = spans
                .last()
                .map_or(0, |span| span.first_chunk + span.chunk_count);
            debug!(
                "tail verification failed at chunk {valid}; keeping {kept} of {} chunk(s)",
                chunks.len()
            );
            chunks.truncate(kept);
            geometry.set_media_size(kept.saturating_mul(chunk_size));
        }

        // Cut the files back to the end of the kept data.
        let (resume_segment, resume_pos) = match spans.last() {
            Some(span) => {
                let end = span
                    .group
                    .table2
                    .map_or(span.group.table.end_offset(), |t| t.end_offset());
                (span.group.segment_number, end)
            }
            None => (1, volume_descriptor.end_offset()),
        };
        for number in (resume_segment + 1)..=segments.count() {
            if let Some(path) = segments.path(number) {
                debug!("removing stale segment file {number} ({})", path.display());
                std::fs::remove_file(path)
                    .with_context(|| format!("removing stale segment file {number}"))?;
            }
        }
        segments.truncate_to(resume_segment);
        let store = segments.store(resume_segment)?;
        store.set_len(resume_pos)?;
        store.flush()?;
        segments.set_size(resume_segment, resume_pos)?;

        let bytes_written = geometry.media_size();
        let media_size_cap = (volume.media_size > bytes_written).then_some(volume.media_size);
        let segment_file_size = segments
            .segments()
            .iter()
            .map(|segment| segment.size)
            .max()
            .unwrap_or(DEFAULT_SEGMENT_FILE_SIZE)
            .max(MIN_SEGMENT_FILE_SIZE)
            .min(parts.variant.max_segment_size());

        let mut header_values = ValueStore::new("header values");
        header_values.freeze();

        let acquiry_errors = match &parts.error_body {
            Some(body) => decode_range_body(RangeBodyKind::AcquiryErrors, body, "acquisition error")
                .context("error2 section")?,
            None => RangeTracker::new("acquisition error"),
        };
        let sessions = match &parts.session_body {
            Some(body) => decode_range_body(RangeBodyKind::Sessions, body, "session")
                .context("session section")?,
            None => RangeTracker::new("session"),
        };

        let data_offsets = parts
            .data_offsets
            .into_iter()
            .filter(|(number, _)| *number <= resume_segment)
            .collect();

        debug!(
            "resumed container at {}: {} chunk(s), continuing in segment {resume_segment} at offset {resume_pos}",
            first_path.display(),
            chunks.len()
        );
        Ok(Self {
            mode: Mode::Write,
            variant: parts.variant,
            geometry,
            media_type: volume.media_type,
            media_flags: volume.media_flags,
            compression_level: volume.compression_level,
            compression_policy: ewfkit_codec::CompressionPolicy::IfSmaller,
            compress_empty_chunks: false,
            error_granularity: volume.error_granularity,
            guid: volume.guid,
            header_codepage: values::HeaderCodepage::default(),
            segments,
            position: bytes_written,
            chunks,
            spans,
            header_values,
            hash_values: ValueStore::new("hash values"),
            header_bodies: parts.header_bodies,
            hash_bodies: parts.hash_bodies,
            acquiry_errors,
            crc_errors: RangeTracker::new("checksum error"),
            sessions,
            wipe_on_error: true,
            abort: Arc::new(AtomicBool::new(false)),
            cache: None,
            writer: Some(WriterState {
                first_path: first_path.to_path_buf(),
                segment_file_size,
                table_entry_limit: MAX_TABLE_ENTRIES,
                media_size_cap,
                bytes_written,
                pending: Vec::new(),
                open_group: None,
                write_pos: resume_pos,
                started: true,
                finalized: false,
                stream_complete: false,
                volume_offset: volume_descriptor.offset,
                data_offsets,
            }),
        })
    }

    /// Write one chunk of media data at the stream position
    ///
    /// `data` must be exactly one chunk, except that the final chunk of
    /// the media may be short; a short chunk completes the stream and
    /// later writes fail. Compression and checksumming happen here, and
    /// the chunk lands in the open sectors run, rolling to a new segment
    /// file when the current one is full.
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.check_abort()?;
        let chunk_size = self.geometry.chunk_size();
        let writer = self.writer_ref()?;
        if writer.stream_complete {
            return Err(Error::runtime(
                "media stream already completed by a short chunk",
            ));
        }
        if !writer.pending.is_empty() {
            return Err(Error::runtime(
                "buffered writes left a partial chunk pending",
            ));
        }
        if data.is_empty() || data.len() as u64 > chunk_size {
            return Err(Error::argument(format!(
                "chunk data must be 1..={chunk_size} bytes, got {}",
                data.len()
            )));
        }
        if let Some(cap) = writer.media_size_cap {
            if writer.bytes_written + data.len() as u64 > cap {
                return Err(Error::argument(format!(
                    "write of {} bytes exceeds the declared media size {cap}",
                    data.len()
                )));
            }
        }

        let short = (data.len() as u64) < chunk_size;
        self.append_chunk(data)?;
        if short {
            self.writer_mut()?.stream_complete = true;
        }
        Ok(())
    }

    /// Write media data at the stream position
    ///
    /// Splits `data` into chunk-sized pieces, carrying a partial tail
    /// until later writes complete it. With a declared media size the
    /// returned count goes short once the cap is reached. Abort is
    /// checked once per completed chunk.
    pub fn write_buffer(&mut self, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let writer = self.writer_ref()?;
        if writer.stream_complete {
            return Err(Error::runtime(
                "media stream already completed by a short chunk",
            ));
        }
        let chunk_size = self.geometry.chunk_size() as usize;
        let used = writer.bytes_written + writer.pending.len() as u64;
        let room = match writer.media_size_cap {
            Some(cap) => usize::try_from(cap.saturating_sub(used)).unwrap_or(usize::MAX),
            None => usize::MAX,
        };
        let take = data.len().min(room);

        let mut pending = std::mem::take(&mut self.writer_mut()?.pending);
        let carried = pending.len();
        let mut appended = false;
        let mut consumed = 0usize;
        let outcome = loop {
            if consumed >= take && pending.len() < chunk_size {
                break Ok(());
            }
            if pending.len() < chunk_size {
                let n = (chunk_size - pending.len()).min(take - consumed);
                pending.extend_from_slice(&data[consumed..consumed + n]);
                consumed += n;
                if pending.len() < chunk_size {
                    continue;
                }
            }
            if let Err(e) = self.check_abort() {
                break Err(e);
            }
            if let Err(e) = self.append_chunk(&pending) {
                break Err(e);
            }
            appended = true;
            pending.clear();
        };
        if outcome.is_err() {
            // Drop the bytes staged by this call; a carried partial chunk
            // survives only until the first append flushes it.
            pending.truncate(if appended { 0 } else { carried });
        }
        self.writer_mut()?.pending = pending;
        outcome.map(|()| consumed)
    }

    /// Complete the container
    ///
    /// Flushes any buffered partial chunk, closes the open sectors run,
    /// writes the closing sections (acquisition errors, sessions, stored
    /// digests) and the `done` terminal, then patches the volume and
    /// every `data` copy with the final totals. Idempotent: a second call
    /// is a no-op. Abort is never checked here, so an aborted acquisition
    /// still closes into a consistent, truncated container.
    pub fn write_finalize(&mut self) -> Result<()> {
        if self.mode != Mode::Write {
            return Err(Error::runtime("handle is read-only"));
        }
        if self.writer_ref()?.finalized {
            return Ok(());
        }
        self.ensure_started()?;

        let pending = std::mem::take(&mut self.writer_mut()?.pending);
        if !pending.is_empty() {
            self.append_chunk(&pending)?;
        }
        self.close_group()?;

        // The stream is complete; totals become final before any body
        // depending on them is encoded.
        let final_size = self.writer_ref()?.bytes_written;
        self.geometry.set_media_size(final_size);

        let md5 = self.md5_hash()?;
        let sha1 = self.sha1_hash()?;
        let mut closing: Vec<(SectionKind, Vec<u8>)> = Vec::new();
        if !self.acquiry_errors.is_empty() {
            closing.push((
                SectionKind::Error2,
                encode_range_body(RangeBodyKind::AcquiryErrors, &self.acquiry_errors)?,
            ));
        }
        if !self.sessions.is_empty() {
            closing.push((
                SectionKind::Session,
                encode_range_body(RangeBodyKind::Sessions, &self.sessions)?,
            ));
        }
        if let Some(md5) = &md5 {
            closing.push((SectionKind::Hash, values::encode_hash_body(md5)));
        }
        if md5.is_some() || sha1.is_some() {
            closing.push((
                SectionKind::Digest,
                values::encode_digest_body(md5.as_ref(), sha1.as_ref()),
            ));
        }

        let closing_len = closing
            .iter()
            .map(|(_, body)| SECTION_DESCRIPTOR_LEN + body.len() as u64)
            .sum::<u64>()
            + SECTION_DESCRIPTOR_LEN;
        let limit = self.writer_ref()?.segment_file_size;
        let fits = self
            .segments
            .last()
            .is_some_and(|segment| segment.has_room(closing_len, 0, limit));
        if !fits {
            self.roll_segment()?;
        }

        let number = self.segments.count();
        let mut pos = self.writer_ref()?.write_pos;
        let store: &mut dyn SegmentStore = self.segments.store(number)?;
        for (kind, body) in &closing {
            pos = write_section(store, pos, *kind, body)?;
        }
        pos = write_terminal(store, pos, SectionKind::Done)?;
        self.segments.set_size(number, pos)?;
        self.writer_mut()?.write_pos = pos;

        // Patch every provisional volume body with the final totals.
        let volume_body = self.volume_info().encode()?;
        let volume_offset = self.writer_ref()?.volume_offset;
        let store = self.segments.store(1)?;
        store.write_all_at(volume_offset + SECTION_DESCRIPTOR_LEN, &volume_body)?;
        let data_offsets = self.writer_ref()?.data_offsets.clone();
        for (number, offset) in data_offsets {
            let store = self.segments.store(number)?;
            store.write_all_at(offset + SECTION_DESCRIPTOR_LEN, &volume_body)?;
        }

        self.hash_values.freeze();
        self.writer_mut()?.finalized = true;
        self.segments.flush_all()?;
        debug!(
            "finalized container: {} chunk(s), media size {final_size}, {} segment file(s)",
            self.chunks.len(),
            self.segments.count()
        );
        Ok(())
    }

    fn writer_ref(&self) -> Result<&WriterState> {
        self.writer
            .as_ref()
            .ok_or_else(|| Error::runtime("handle is read-only"))
    }

    fn writer_mut(&mut self) -> Result<&mut WriterState> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::runtime("handle is read-only"))
    }

    fn volume_info(&self) -> VolumeInfo {
        VolumeInfo {
            media_type: self.media_type,
            media_flags: self.media_flags,
            chunk_count: self.chunks.len(),
            sectors_per_chunk: self.geometry.sectors_per_chunk(),
            bytes_per_sector: self.geometry.bytes_per_sector(),
            sector_count: self.geometry.sector_count(),
            media_size: self.geometry.media_size(),
            compression_level: self.compression_level,
            error_granularity: self.error_granularity,
            guid: self.guid,
        }
    }

    /// Write the opening run of segment 1 and freeze the header values
    fn ensure_started(&mut self) -> Result<()> {
        if self.writer_ref()?.started {
            return Ok(());
        }
        self.header_values.freeze();

        let level = self.compression_level;
        let mut bodies: Vec<(SectionKind, Vec<u8>)> = Vec::new();
        if self.variant == FormatVariant::Wide64 {
            bodies.push((
                SectionKind::XHeader,
                values::encode_xheader_body(&self.header_values, level)?,
            ));
        }
        bodies.push((
            SectionKind::Header2,
            values::encode_header2_body(&self.header_values, level)?,
        ));
        bodies.push((
            SectionKind::Header,
            values::encode_header_body(&self.header_values, self.header_codepage, level)?,
        ));
        let volume_body = self.volume_info().encode()?;

        let store: &mut dyn SegmentStore = self.segments.store(1)?;
        let mut pos = FILE_HEADER_LEN;
        for (kind, body) in &bodies {
            pos = write_section(store, pos, *kind, body)?;
        }
        let volume_offset = pos;
        pos = write_section(store, pos, SectionKind::Volume, &volume_body)?;
        self.segments.set_size(1, pos)?;

        let writer = self.writer_mut()?;
        writer.volume_offset = volume_offset;
        writer.write_pos = pos;
        writer.started = true;
        // Keep the encoded bodies so header reads work on this handle.
        self.header_bodies = bodies;
        trace!("opening run written, volume at offset {volume_offset}");
        Ok(())
    }

    /// Pack one chunk and append it to the container
    fn append_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_started()?;

        let packed = pack_chunk(
            data,
            self.compression_level,
            self.compression_policy,
            self.compress_empty_chunks,
        );
        let stored_len = packed.data.len() as u64;
        let stored_size = u32::try_from(packed.data.len())
            .map_err(|_| Error::argument("packed chunk exceeds the stored size field"))?;

        // A run at its entry limit closes before placement.
        let limit = u64::from(self.writer_ref()?.table_entry_limit);
        let full = self
            .writer_ref()?
            .open_group
            .as_ref()
            .is_some_and(|group| group.entries.len() as u64 >= limit);
        if full {
            self.close_group()?;
        }
        self.place_chunk(stored_len)?;

        let (segment_number, offset) = {
            let writer = self.writer_ref()?;
            let group = writer
                .open_group
                .as_ref()
                .ok_or_else(|| Error::runtime("no open sectors run after placement"))?;
            (group.segment_number, writer.write_pos)
        };
        let store = self.segments.store(segment_number)?;
        store
            .write_all_at(offset, &packed.data)
            .with_context(|| format!("appending chunk {}", self.chunks.len()))?;

        let writer = self.writer_mut()?;
        if let Some(group) = writer.open_group.as_mut() {
            group.entries.push((offset, packed.is_compressed));
        }
        writer.write_pos = offset + stored_len;
        writer.bytes_written += data.len() as u64;
        let grow = writer.media_size_cap.is_none();
        let written = writer.bytes_written;
        self.segments.set_size(segment_number, offset + stored_len)?;

        self.chunks.extend([ChunkDescriptor {
            segment_number,
            file_offset: offset,
            stored_size,
            is_compressed: packed.is_compressed,
        }]);
        // Streamed media grows as chunks land.
        if grow {
            self.geometry.set_media_size(written);
        }
        Ok(())
    }

    /// Make sure an open sectors run with room for `incoming` bytes
    /// exists, rolling to a new segment file when the current one is full
    fn place_chunk(&mut self, incoming: u64) -> Result<()> {
        let writer = self.writer_ref()?;
        let limit = writer.segment_file_size;
        let open = writer.open_group.is_some();
        let entries = writer
            .open_group
            .as_ref()
            .map_or(0, |group| group.entries.len());
        // Keep room for the sections that close the run and the segment;
        // an unopened run also needs its own descriptor.
        let mut reserve = closing_reserve(self.variant, entries + 1);
        if !open {
            reserve += SECTION_DESCRIPTOR_LEN;
        }

        let segment = self
            .segments
            .last()
            .ok_or_else(|| Error::runtime("no segment file open"))?;
        if !segment.has_room(incoming, reserve, limit) {
            // The fresh segment accepts the chunk regardless, so a chunk
            // larger than the segment size still lands.
            self.roll_segment()?;
        }
        if self.writer_ref()?.open_group.is_none() {
            self.open_run()?;
        }
        Ok(())
    }

    /// Start a sectors run at the write position
    fn open_run(&mut self) -> Result<()> {
        let number = self.segments.count();
        let offset = self.writer_ref()?.write_pos;
        let store = self.segments.store(number)?;
        // Placeholder framing; close_group patches it once the run's
        // extent is known.
        let descriptor = SectionDescriptor {
            kind: SectionKind::Sectors,
            offset,
            next_offset: 0,
            size: 0,
        };
        section::write_descriptor(store, &descriptor)?;

        let writer = self.writer_mut()?;
        writer.open_group = Some(OpenGroup {
            segment_number: number,
            sectors_offset: offset,
            entries: Vec::new(),
        });
        writer.write_pos = offset + SECTION_DESCRIPTOR_LEN;
        self.segments
            .set_size(number, offset + SECTION_DESCRIPTOR_LEN)?;
        trace!("opened sectors run at offset {offset} in segment {number}");
        Ok(())
    }

    /// Close the open sectors run: patch its descriptor, then write the
    /// offset table and its backup
    fn close_group(&mut self) -> Result<()> {
        let Some(group) = self.writer_mut()?.open_group.take() else {
            return Ok(());
        };
        if group.entries.is_empty() {
            // Rewind the placeholder; an empty run stores nothing.
            let writer = self.writer_mut()?;
            writer.write_pos = group.sectors_offset;
            self.segments
                .set_size(group.segment_number, group.sectors_offset)?;
            return Ok(());
        }

        let end = self.writer_ref()?.write_pos;
        let sectors = SectionDescriptor {
            kind: SectionKind::Sectors,
            offset: group.sectors_offset,
            next_offset: end,
            size: end - group.sectors_offset,
        };
        let body = table::encode_table_body(self.variant, group.sectors_offset, &group.entries)?;

        let store: &mut dyn SegmentStore = self.segments.store(group.segment_number)?;
        section::write_descriptor(store, &sectors)?;
        let table_offset = end;
        let table2_offset = write_section(store, table_offset, SectionKind::Table, &body)?;
        let after = write_section(store, table2_offset, SectionKind::Table2, &body)?;

        let chunk_count = group.entries.len() as u64;
        self.spans.push(GroupSpan {
            group: ChunkGroup {
                segment_number: group.segment_number,
                sectors,
                table: SectionDescriptor {
                    kind: SectionKind::Table,
                    offset: table_offset,
                    next_offset: table2_offset,
                    size: table2_offset - table_offset,
                },
                table2: Some(SectionDescriptor {
                    kind: SectionKind::Table2,
                    offset: table2_offset,
                    next_offset: after,
                    size: after - table2_offset,
                }),
            },
            first_chunk: self.chunks.len() - chunk_count,
            chunk_count,
        });

        self.writer_mut()?.write_pos = after;
        self.segments.set_size(group.segment_number, after)?;
        debug!(
            "closed sectors run: {chunk_count} chunk(s) in segment {}",
            group.segment_number
        );
        Ok(())
    }

    /// Close the current segment with a `next` section and start the
    /// following segment file with its `data` copy of the volume
    fn roll_segment(&mut self) -> Result<()> {
        self.close_group()?;

        let number = self.segments.count();
        let pos = self.writer_ref()?.write_pos;
        let store: &mut dyn SegmentStore = self.segments.store(number)?;
        let end = write_terminal(store, pos, SectionKind::Next)?;
        store.flush()?;
        self.segments.set_size(number, end)?;

        let next_number = number + 1;
        let first_path = self.writer_ref()?.first_path.clone();
        let path = naming::sibling_path(&first_path, next_number)?;
        self.segments.create_next(path)?;

        let body = self.volume_info().encode()?;
        let store = self.segments.store(next_number)?;
        let data_offset = FILE_HEADER_LEN;
        let end = write_section(store, data_offset, SectionKind::Data, &body)?;
        self.segments.set_size(next_number, end)?;

        let writer = self.writer_mut()?;
        writer.write_pos = end;
        writer.data_offsets.push((next_number, data_offset));
        debug!("rolled to segment file {next_number}");
        Ok(())
    }
}

/// Write a section descriptor and body at `offset`, returning the end
fn write_section(
    store: &mut dyn SegmentStore,
    offset: u64,
    kind: SectionKind,
    body: &[u8],
) -> Result<u64> {
    let size = SECTION_DESCRIPTOR_LEN + body.len() as u64;
    let descriptor = SectionDescriptor {
        kind,
        offset,
        next_offset: offset + size,
        size,
    };
    section::write_descriptor(store, &descriptor)?;
    store.write_all_at(descriptor.body_offset(), body)?;
    Ok(descriptor.end_offset())
}

/// Write a terminal section at `offset`; its next offset points at itself
fn write_terminal(store: &mut dyn SegmentStore, offset: u64, kind: SectionKind) -> Result<u64> {
    let descriptor = SectionDescriptor {
        kind,
        offset,
        next_offset: offset,
        size: SECTION_DESCRIPTOR_LEN,
    };
    section::write_descriptor(store, &descriptor)?;
    Ok(descriptor.end_offset())
}

/// Bytes the sections closing an open run and its segment will take:
/// both offset tables for `entries` chunks plus the terminal section
fn closing_reserve(variant: FormatVariant, entries: usize) -> u64 {
    let body = TABLE_HEADER_LEN as u64 + (entries as u64) * variant.table_entry_len() as u64 + 4;
    2 * (SECTION_DESCRIPTOR_LEN + body) + SECTION_DESCRIPTOR_LEN
}

/// Re-verify the last kept chunks of a resumed stream
///
/// Returns the count of chunks that verified; everything from the first
/// failure on must be dropped. A valid chunk that inflates short is the
/// completed final chunk of the media, which cannot be resumed.
fn verify_tail(
    segments: &mut SegmentTable,
    chunks: &ChunkOffsetTable,
    chunk_size: u64,
) -> Result<u64> {
    let expected = usize::try_from(chunk_size)
        .map_err(|_| Error::argument("chunk size exceeds addressable memory"))?;
    let start = chunks.len().saturating_sub(RESUME_VERIFY_WINDOW);
    for index in start..chunks.len() {
        let descriptor = chunks.get(index)?;
        let mut stored = vec![0u8; descriptor.stored_size as usize];
        let store = segments.store(descriptor.segment_number)?;
        if let Err(e) = store.read_exact_at(descriptor.file_offset, &mut stored) {
            warn!("chunk {index} is unreadable: {e}");
            return Ok(index);
        }
        match ewfkit_codec::unpack_chunk(&stored, expected, descriptor.is_compressed) {
            Ok(_) => {}
            Err(ewfkit_codec::Error::SizeMismatch { actual, .. })
                if index + 1 == chunks.len() && actual > 0 && actual < expected =>
            {
                return Err(Error::runtime(
                    "media stream already completed by a short final chunk",
                ));
            }
            Err(e) => {
                warn!("chunk {index} failed verification: {e}");
                return Ok(index);
            }
        }
    }
    Ok(chunks.len())
}

/// Trim discovered files whose segment header never finished writing
fn drop_torn_trailing_files(paths: &mut Vec<PathBuf>) -> Result<()> {
    while paths.len() > 1 {
        let Some(last) = paths.last() else {
            break;
        };
        let intact = naming::check_file_signature(last)?.is_some()
            && std::fs::metadata(last)?.len() >= FILE_HEADER_LEN;
        if intact {
            break;
        }
        warn!("removing torn trailing segment file {}", last.display());
        std::fs::remove_file(last)?;
        paths.pop();
    }
    Ok(())
}
