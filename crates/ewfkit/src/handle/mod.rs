//! Container handle
//!
//! [`EwfHandle`] owns everything belonging to one open container: the
//! segment table and file pool, the merged chunk offset table, media
//! geometry, value stores, range trackers and the cursor. One handle, one
//! owner; all I/O takes `&mut self` and there is no internal locking.
//! Independent handles never share state, so each may live on its own
//! thread.
//!
//! Opening walks every segment's section chain strictly, decodes the
//! volume, reloads persisted trackers and assembles the chunk table with
//! its fallback ladder. Creation and write-resume live in [`write`]; the
//! chunk read pipeline lives in [`read`].

mod read;
mod write;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use ewfkit_codec::{CompressionLevel, CompressionPolicy};

use crate::config::MIN_SEGMENT_FILE_SIZE;
use crate::io::{DEFAULT_MAX_OPEN_FILES, SegmentStore};
use crate::media::{MediaFlags, MediaGeometry, MediaType};
use crate::naming;
use crate::ranges::{RangeBodyKind, RangeEntry, RangeTracker, decode_range_body};
use crate::section::{self, SectionDescriptor, SectionKind};
use crate::segment::{FILE_HEADER_LEN, FormatVariant, SegmentTable};
use crate::table::{ChunkDescriptor, ChunkGroup, ChunkOffsetTable};
use crate::values::{
    self, HeaderCodepage, ParseOutcome, ValueStore, hash_ids, parse_hex_digest,
};
use crate::volume::VolumeInfo;
use crate::{Context, Error, ErrorKind, Result};

use write::WriterState;

/// Largest section body the opener will pull into memory
const MAX_BODY_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

/// A chunk group together with the span of chunk indexes it provides
#[derive(Debug, Clone)]
pub(crate) struct GroupSpan {
    pub(crate) group: ChunkGroup,
    pub(crate) first_chunk: u64,
    pub(crate) chunk_count: u64,
}

/// Cloneable signal for cooperatively stopping multi-chunk operations
///
/// The flag is sticky: once signaled, chunk loops on the owning handle
/// return the aborted outcome at the next chunk boundary. Closing and
/// finalizing never check it, so an aborted acquisition still tears down
/// cleanly.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Request that in-flight chunk loops stop at the next boundary
    pub fn signal(&self) {
        debug!("abort signaled");
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether abort has been signaled
    pub fn is_signaled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Handle to one open container
///
/// Created by [`EwfHandle::open`], [`EwfHandle::open_base`],
/// [`EwfHandle::create`] or [`EwfHandle::resume`]. Reading and writing move
/// a cursor through the logical media stream; chunk-level access works by
/// index. Dropping the handle closes every segment file; writers should
/// prefer [`EwfHandle::close`] so finalization errors are observable.
#[derive(Debug)]
pub struct EwfHandle {
    mode: Mode,
    variant: FormatVariant,
    geometry: MediaGeometry,
    media_type: MediaType,
    media_flags: MediaFlags,
    compression_level: CompressionLevel,
    compression_policy: CompressionPolicy,
    compress_empty_chunks: bool,
    error_granularity: u32,
    guid: [u8; 16],
    header_codepage: HeaderCodepage,

    segments: SegmentTable,
    chunks: ChunkOffsetTable,
    spans: Vec<GroupSpan>,

    header_values: ValueStore,
    hash_values: ValueStore,
    header_bodies: Vec<(SectionKind, Vec<u8>)>,
    hash_bodies: Vec<(SectionKind, Vec<u8>)>,

    acquiry_errors: RangeTracker,
    crc_errors: RangeTracker,
    sessions: RangeTracker,

    position: u64,
    wipe_on_error: bool,
    abort: Arc<AtomicBool>,
    cache: Option<(u64, Vec<u8>)>,

    writer: Option<WriterState>,
}

impl EwfHandle {
    /// Open an existing container read-only from its ordered segment paths
    pub fn open(paths: &[PathBuf]) -> Result<Self> {
        Self::open_with(paths, DEFAULT_MAX_OPEN_FILES)
    }

    /// Open an existing container read-only from its first segment file,
    /// discovering the sibling files by extension
    pub fn open_base(first_path: &Path) -> Result<Self> {
        let paths = naming::discover(first_path)?;
        Self::open(&paths)
    }

    fn open_with(paths: &[PathBuf], max_open: usize) -> Result<Self> {
        let mut segments = SegmentTable::open(paths, max_open, false)?;
        let parts = scan_segments(&mut segments, true)?;

        let volume = parts
            .volume
            .ok_or(ErrorKind::MissingSection("volume"))?;
        volume.check_totals()?;
        let geometry = volume.geometry()?;

        let mut chunks = ChunkOffsetTable::new();
        let mut spans = Vec::with_capacity(parts.groups.len());
        for group in parts.groups {
            let store = segments.store(group.segment_number)?;
            let descriptors = group
                .load(store, parts.variant, &geometry, chunks.len())
                .with_context(|| format!("segment file {}", group.segment_number))?;
            spans.push(GroupSpan {
                group,
                first_chunk: chunks.len(),
                chunk_count: descriptors.len() as u64,
            });
            chunks.extend(descriptors);
        }
        if chunks.len() != geometry.chunk_count() {
            return Err(Error::value_mismatch(format!(
                "offset tables provide {} chunk(s) but the volume declares {}",
                chunks.len(),
                geometry.chunk_count()
            )));
        }

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

        let mut header_values = ValueStore::new("header values");
        header_values.freeze();
        let mut hash_values = ValueStore::new("hash values");
        hash_values.freeze();

        debug!(
            "opened container: {} segment file(s), {} chunk(s), media size {}",
            segments.count(),
            chunks.len(),
            geometry.media_size()
        );
        Ok(Self {
            mode: Mode::Read,
            variant: parts.variant,
            geometry,
            media_type: volume.media_type,
            media_flags: volume.media_flags,
            compression_level: volume.compression_level,
            compression_policy: CompressionPolicy::IfSmaller,
            compress_empty_chunks: false,
            error_granularity: volume.error_granularity,
            guid: volume.guid,
            header_codepage: HeaderCodepage::default(),
            segments,
            chunks,
            spans,
            header_values,
            hash_values,
            header_bodies: parts.header_bodies,
            hash_bodies: parts.hash_bodies,
            acquiry_errors,
            crc_errors: RangeTracker::new("checksum error"),
            sessions,
            position: 0,
            wipe_on_error: true,
            abort: Arc::new(AtomicBool::new(false)),
            cache: None,
            writer: None,
        })
    }

    // ----- cursor -----

    /// Current cursor position in the media stream
    ///
    /// Writers report the end of the data consumed so far, buffered tail
    /// included.
    pub fn offset(&self) -> u64 {
        match &self.writer {
            Some(writer) => writer.stream_position(),
            None => self.position,
        }
    }

    /// Move the read cursor
    ///
    /// Positions at or beyond the media size are allowed; reads there
    /// return zero bytes. Write handles are sequential and reject seeking.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        if self.mode == Mode::Write {
            return Err(Error::argument(
                "write handles are sequential and cannot seek",
            ));
        }
        self.position = offset;
        Ok(())
    }

    // ----- abort -----

    /// Cloneable handle for signaling abort from another thread
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: Arc::clone(&self.abort),
        }
    }

    /// Signal abort on this handle
    pub fn signal_abort(&self) {
        self.abort_handle().signal();
    }

    /// Whether abort has been signaled
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub(crate) fn check_abort(&self) -> Result<()> {
        if self.aborted() {
            return Err(ErrorKind::Aborted.into());
        }
        Ok(())
    }

    // ----- media metadata -----

    /// Format variant of the container
    pub fn format_variant(&self) -> FormatVariant {
        self.variant
    }

    /// Media size in bytes; grows while streaming a write
    pub fn media_size(&self) -> u64 {
        self.geometry.media_size()
    }

    /// Sector size in bytes
    pub fn bytes_per_sector(&self) -> u32 {
        self.geometry.bytes_per_sector()
    }

    /// Chunk size in sectors
    pub fn sectors_per_chunk(&self) -> u32 {
        self.geometry.sectors_per_chunk()
    }

    /// Chunk size in bytes
    pub fn chunk_size(&self) -> u64 {
        self.geometry.chunk_size()
    }

    /// Number of media sectors
    pub fn sector_count(&self) -> u64 {
        self.geometry.sector_count()
    }

    /// Number of chunks with stored data
    pub fn chunk_count(&self) -> u64 {
        self.chunks.len()
    }

    /// Number of segment files
    pub fn segment_count(&self) -> u16 {
        self.segments.count()
    }

    /// Segment file size limit of a writer; read handles report the
    /// largest segment file present
    pub fn segment_file_size(&self) -> u64 {
        match &self.writer {
            Some(writer) => writer.segment_file_size,
            None => self
                .segments
                .segments()
                .iter()
                .map(|segment| segment.size)
                .max()
                .unwrap_or(0),
        }
    }

    /// Kind of the acquired media
    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Media flags
    pub fn media_flags(&self) -> MediaFlags {
        self.media_flags
    }

    /// Acquisition error granularity in sectors
    pub fn error_granularity(&self) -> u32 {
        self.error_granularity
    }

    /// Stored identifier of the container
    pub fn guid(&self) -> [u8; 16] {
        self.guid
    }

    /// Deflate effort used for chunk payloads
    pub fn compression_level(&self) -> CompressionLevel {
        self.compression_level
    }

    /// Policy deciding when compressed chunk forms are kept
    pub fn compression_policy(&self) -> CompressionPolicy {
        self.compression_policy
    }

    /// Codepage of the single-byte header section
    pub fn header_codepage(&self) -> HeaderCodepage {
        self.header_codepage
    }

    /// Whether chunks failing their checksum read back as zeros
    pub fn wipe_on_error(&self) -> bool {
        self.wipe_on_error
    }

    /// Choose between zero-wiping bad chunks (default) and surfacing the
    /// checksum error to the caller
    pub fn set_wipe_on_error(&mut self, wipe: bool) {
        self.wipe_on_error = wipe;
    }

    /// Set the sector size of a new container; frozen once data is written
    pub fn set_bytes_per_sector(&mut self, bytes_per_sector: u32) -> Result<()> {
        self.check_geometry_mutable()?;
        self.geometry =
            MediaGeometry::new(bytes_per_sector, self.sectors_per_chunk(), self.media_size())?;
        Ok(())
    }

    /// Set the chunk size in sectors of a new container; frozen once data
    /// is written
    pub fn set_sectors_per_chunk(&mut self, sectors_per_chunk: u32) -> Result<()> {
        self.check_geometry_mutable()?;
        self.geometry =
            MediaGeometry::new(self.bytes_per_sector(), sectors_per_chunk, self.media_size())?;
        Ok(())
    }

    /// Declare the media size of a new container
    ///
    /// A non-zero size caps the stream and is enforced as writes land;
    /// zero declares a streamed acquisition whose size becomes final at
    /// finalize.
    pub fn set_media_size(&mut self, media_size: u64) -> Result<()> {
        self.check_volume_mutable()?;
        self.geometry.set_media_size(media_size);
        if let Some(writer) = self.writer.as_mut() {
            writer.media_size_cap = (media_size > 0).then_some(media_size);
        }
        Ok(())
    }

    /// Set the segment file size limit of a new container
    pub fn set_segment_file_size(&mut self, limit: u64) -> Result<()> {
        self.check_volume_mutable()?;
        if limit < MIN_SEGMENT_FILE_SIZE || limit > self.variant.max_segment_size() {
            return Err(Error::argument(format!(
                "segment file size {limit} outside {MIN_SEGMENT_FILE_SIZE}..={}",
                self.variant.max_segment_size()
            )));
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.segment_file_size = limit;
        }
        Ok(())
    }

    /// Set the media type of a new container
    pub fn set_media_type(&mut self, media_type: MediaType) -> Result<()> {
        self.check_volume_mutable()?;
        self.media_type = media_type;
        Ok(())
    }

    /// Set the media flags of a new container
    pub fn set_media_flags(&mut self, media_flags: MediaFlags) -> Result<()> {
        self.check_volume_mutable()?;
        self.media_flags = media_flags;
        Ok(())
    }

    /// Set the stored identifier of a new container
    pub fn set_guid(&mut self, guid: [u8; 16]) -> Result<()> {
        self.check_volume_mutable()?;
        self.guid = guid;
        Ok(())
    }

    /// Set the acquisition error granularity of a new container
    pub fn set_error_granularity(&mut self, granularity: u32) -> Result<()> {
        self.check_volume_mutable()?;
        if granularity == 0 || granularity > self.sectors_per_chunk() {
            return Err(Error::argument(format!(
                "error granularity {granularity} outside 1..={} sectors",
                self.sectors_per_chunk()
            )));
        }
        self.error_granularity = granularity;
        Ok(())
    }

    /// Set the compression level and policy for chunks written from now on
    pub fn set_compression(
        &mut self,
        level: CompressionLevel,
        policy: CompressionPolicy,
    ) -> Result<()> {
        self.check_writable()?;
        self.compression_level = level;
        self.compression_policy = policy;
        Ok(())
    }

    /// Set the header codepage of a new container
    pub fn set_header_codepage(&mut self, codepage: HeaderCodepage) -> Result<()> {
        if self.mode == Mode::Write {
            self.check_volume_mutable()?;
        }
        self.header_codepage = codepage;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.mode != Mode::Write {
            return Err(Error::runtime("handle is read-only"));
        }
        if self.writer.as_ref().is_some_and(|w| w.finalized) {
            return Err(ErrorKind::AlreadyFinalized.into());
        }
        Ok(())
    }

    fn check_volume_mutable(&self) -> Result<()> {
        self.check_writable()?;
        if self.writer.as_ref().is_none_or(|w| w.started) {
            return Err(ErrorKind::Frozen("volume metadata").into());
        }
        Ok(())
    }

    fn check_geometry_mutable(&self) -> Result<()> {
        self.check_volume_mutable()?;
        if !self.chunks.is_empty() {
            return Err(ErrorKind::Frozen("media geometry").into());
        }
        Ok(())
    }

    // ----- chunk introspection -----

    /// Storage descriptor of one chunk
    pub fn chunk_descriptor(&self, index: u64) -> Result<ChunkDescriptor> {
        self.chunks.get(index).copied()
    }

    // ----- range trackers -----

    /// Record an acquisition error range
    pub fn add_acquiry_error(&mut self, first_sector: u64, sector_count: u64) -> Result<()> {
        self.check_writable()?;
        self.acquiry_errors.add(first_sector, sector_count)
    }

    /// Acquisition error range by index
    pub fn acquiry_error(&self, index: u64) -> Result<RangeEntry> {
        self.acquiry_errors.get(index)
    }

    /// Number of acquisition error ranges
    pub fn acquiry_error_count(&self) -> u64 {
        self.acquiry_errors.len()
    }

    /// Record a session range
    pub fn add_session(&mut self, first_sector: u64, sector_count: u64) -> Result<()> {
        self.check_writable()?;
        self.sessions.add(first_sector, sector_count)
    }

    /// Session range by index
    pub fn session(&self, index: u64) -> Result<RangeEntry> {
        self.sessions.get(index)
    }

    /// Number of session ranges
    pub fn session_count(&self) -> u64 {
        self.sessions.len()
    }

    /// Checksum error range by index; ranges accumulate as reads hit
    /// corrupt chunks
    pub fn crc_error(&self, index: u64) -> Result<RangeEntry> {
        self.crc_errors.get(index)
    }

    /// Number of checksum error ranges recorded by reads so far
    pub fn crc_error_count(&self) -> u64 {
        self.crc_errors.len()
    }

    pub(crate) fn record_crc_error(&mut self, chunk_index: u64) {
        let (first_sector, sector_count) = self.geometry.chunk_sector_range(chunk_index);
        if let Err(e) = self.crc_errors.add(first_sector, sector_count) {
            debug!("checksum error range for chunk {chunk_index} not recorded: {e}");
        }
    }

    // ----- header values -----

    /// Parse header metadata sections into the value store
    ///
    /// Lazy and one-shot: the first successful parse fills the cache and
    /// every later call reports [`ParseOutcome::AlreadyParsed`]. Precedence
    /// across section encodings is xheader, header2, header; the first that
    /// parses wins and any divergent remaining section is shadowed.
    pub fn parse_header_values(&mut self) -> Result<ParseOutcome> {
        if self.header_values.is_parsed() {
            return Ok(ParseOutcome::AlreadyParsed);
        }
        if self.header_bodies.is_empty() {
            return Ok(ParseOutcome::NothingToParse);
        }

        for kind in [SectionKind::XHeader, SectionKind::Header2, SectionKind::Header] {
            let Some((_, body)) = self.header_bodies.iter().find(|(k, _)| *k == kind) else {
                continue;
            };
            let parsed = match kind {
                SectionKind::XHeader => values::decode_xheader_body(body),
                SectionKind::Header2 => values::decode_header2_body(body),
                _ => values::decode_header_body(body, self.header_codepage),
            };
            match parsed {
                Ok(pairs) => {
                    debug!("parsed {} header value(s) from {kind}", pairs.len());
                    self.header_values.apply_parsed(pairs);
                    return Ok(ParseOutcome::Parsed);
                }
                Err(e) => warn!("{kind} section did not parse: {e}"),
            }
        }
        Err(Error::corrupt("no header section could be parsed"))
    }

    /// Header value by identifier, parsing sections on first access
    pub fn header_value(&mut self, identifier: &str) -> Result<Option<String>> {
        self.parse_header_values()?;
        Ok(self.header_values.get(identifier).map(str::to_owned))
    }

    /// Set a header value on a new container
    pub fn set_header_value(&mut self, identifier: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.header_values.set(identifier, value)
    }

    /// Header value identifiers, parsing sections on first access
    pub fn header_value_identifiers(&mut self) -> Result<Vec<String>> {
        self.parse_header_values()?;
        Ok(self.header_values.identifiers().map(str::to_owned).collect())
    }

    // ----- hash values -----

    /// Parse digest sections into the hash value store
    ///
    /// Same lazy one-shot contract as [`EwfHandle::parse_header_values`].
    /// The `digest` body is preferred over the older `hash` body.
    pub fn parse_hash_values(&mut self) -> Result<ParseOutcome> {
        if self.hash_values.is_parsed() {
            return Ok(ParseOutcome::AlreadyParsed);
        }
        if self.hash_bodies.is_empty() {
            return Ok(ParseOutcome::NothingToParse);
        }

        for kind in [SectionKind::Digest, SectionKind::Hash] {
            let Some((_, body)) = self.hash_bodies.iter().find(|(k, _)| *k == kind) else {
                continue;
            };
            let parsed = match kind {
                SectionKind::Digest => values::decode_digest_body(body).map(|(md5, sha1)| {
                    let mut pairs = Vec::new();
                    if let Some(md5) = md5 {
                        pairs.push((hash_ids::MD5.to_owned(), hex::encode(md5)));
                    }
                    if let Some(sha1) = sha1 {
                        pairs.push((hash_ids::SHA1.to_owned(), hex::encode(sha1)));
                    }
                    pairs
                }),
                _ => values::decode_hash_body(body).map(|md5| {
                    md5.map(|md5| (hash_ids::MD5.to_owned(), hex::encode(md5)))
                        .into_iter()
                        .collect()
                }),
            };
            match parsed {
                Ok(pairs) => {
                    self.hash_values.apply_parsed(pairs);
                    return Ok(ParseOutcome::Parsed);
                }
                Err(e) => warn!("{kind} section did not parse: {e}"),
            }
        }
        Err(Error::corrupt("no digest section could be parsed"))
    }

    /// Hash value by identifier, parsing sections on first access
    pub fn hash_value(&mut self, identifier: &str) -> Result<Option<String>> {
        self.parse_hash_values()?;
        Ok(self.hash_values.get(identifier).map(str::to_owned))
    }

    /// Set a hash value; allowed until finalize
    pub fn set_hash_value(&mut self, identifier: &str, value: &str) -> Result<()> {
        self.check_writable()?;
        self.hash_values.set(identifier, value)
    }

    /// Hash value identifiers, parsing sections on first access
    pub fn hash_value_identifiers(&mut self) -> Result<Vec<String>> {
        self.parse_hash_values()?;
        Ok(self.hash_values.identifiers().map(str::to_owned).collect())
    }

    /// MD5 digest of the media, when stored
    pub fn md5_hash(&mut self) -> Result<Option<[u8; 16]>> {
        self.parse_hash_values()?;
        self.hash_values
            .get(hash_ids::MD5)
            .map(|text| parse_hex_digest("MD5", text))
            .transpose()
    }

    /// Record the MD5 digest of the media; persisted at finalize
    pub fn set_md5_hash(&mut self, md5: &[u8; 16]) -> Result<()> {
        self.check_writable()?;
        self.hash_values.set(hash_ids::MD5, &hex::encode(md5))
    }

    /// SHA1 digest of the media, when stored
    pub fn sha1_hash(&mut self) -> Result<Option<[u8; 20]>> {
        self.parse_hash_values()?;
        self.hash_values
            .get(hash_ids::SHA1)
            .map(|text| parse_hex_digest("SHA1", text))
            .transpose()
    }

    /// Record the SHA1 digest of the media; persisted at finalize
    pub fn set_sha1_hash(&mut self, sha1: &[u8; 20]) -> Result<()> {
        self.check_writable()?;
        self.hash_values.set(hash_ids::SHA1, &hex::encode(sha1))
    }

    // ----- teardown -----

    /// Close the container, finalizing first when writing
    ///
    /// Consumes the handle: every segment file is flushed and released.
    pub fn close(mut self) -> Result<()> {
        if self.mode == Mode::Write && self.writer.as_ref().is_some_and(|w| !w.finalized) {
            self.write_finalize()
                .context("finalizing container on close")?;
        }
        self.segments.flush_all()
    }
}

/// Everything collected from walking every segment's section chain
struct ContainerParts {
    variant: FormatVariant,
    volume: Option<VolumeInfo>,
    volume_descriptor: Option<SectionDescriptor>,
    data_offsets: Vec<(u16, u64)>,
    groups: Vec<ChunkGroup>,
    header_bodies: Vec<(SectionKind, Vec<u8>)>,
    hash_bodies: Vec<(SectionKind, Vec<u8>)>,
    error_body: Option<Vec<u8>>,
    session_body: Option<Vec<u8>>,
    last_terminal: Option<SectionKind>,
}

/// Walk and validate every segment, collecting sections by role
///
/// With `strict` set every chain must terminate properly: `next` for inner
/// segments, `done` for the last. Resume passes `strict = false`, which
/// tolerates a damaged tail in the last segment.
fn scan_segments(segments: &mut SegmentTable, strict: bool) -> Result<ContainerParts> {
    let variant = segments.variant();
    let count = segments.count();
    let mut parts = ContainerParts {
        variant,
        volume: None,
        volume_descriptor: None,
        data_offsets: Vec::new(),
        groups: Vec::new(),
        header_bodies: Vec::new(),
        hash_bodies: Vec::new(),
        error_body: None,
        session_body: None,
        last_terminal: None,
    };

    for number in 1..=count {
        let last = number == count;
        let store: &mut dyn SegmentStore = segments.store(number)?;
        let walk = if strict || !last {
            section::walk(store, FILE_HEADER_LEN)
                .with_context(|| format!("segment file {number}"))?
        } else {
            section::walk_partial(store, FILE_HEADER_LEN)
        };

        if last {
            parts.last_terminal = walk.terminal;
        }
        match walk.terminal {
            Some(SectionKind::Done) if !last => {
                return Err(Error::corrupt(format!(
                    "segment file {number} ends the container but {count} files were given"
                )));
            }
            Some(SectionKind::Next) if last && strict => {
                return Err(ErrorKind::MissingSegment(number + 1).into());
            }
            None if strict => {
                // Strict walks always produce a terminal.
                return Err(Error::runtime("section walk ended without a terminal"));
            }
            _ => {}
        }

        // Only the last segment of a lenient scan may have a damaged
        // tail; earlier segments must assemble cleanly.
        collect_segment_sections(store, number, &walk.sections, strict || !last, &mut parts)
            .with_context(|| format!("segment file {number}"))?;
    }
    Ok(parts)
}

fn collect_segment_sections(
    store: &mut dyn SegmentStore,
    segment_number: u16,
    sections: &[SectionDescriptor],
    strict: bool,
    parts: &mut ContainerParts,
) -> Result<()> {
    let mut i = 0;
    while i < sections.len() {
        let descriptor = &sections[i];
        match descriptor.kind {
            SectionKind::Volume | SectionKind::Data => {
                let body = read_body(store, descriptor)?;
                let info = VolumeInfo::decode(&body)
                    .with_context(|| format!("{} section", descriptor.kind))?;
                match &parts.volume {
                    None => parts.volume = Some(info),
                    Some(volume) if strict => volume.check_matches(&info)?,
                    // Mid-write copies carry provisional totals.
                    Some(_) => {}
                }
                if descriptor.kind == SectionKind::Volume {
                    if parts.volume_descriptor.is_none() {
                        parts.volume_descriptor = Some(*descriptor);
                    }
                } else {
                    parts.data_offsets.push((segment_number, descriptor.offset));
                }
            }
            SectionKind::Sectors => {
                let Some(table) = sections.get(i + 1).filter(|s| s.kind == SectionKind::Table)
                else {
                    if strict {
                        return Err(Error::corrupt(format!(
                            "sectors section at offset {} has no table",
                            descriptor.offset
                        )));
                    }
                    debug!(
                        "dropping unclosed sectors run at offset {} in segment {segment_number}",
                        descriptor.offset
                    );
                    break;
                };
                let table2 = sections
                    .get(i + 2)
                    .filter(|s| s.kind == SectionKind::Table2)
                    .copied();
                parts.groups.push(ChunkGroup {
                    segment_number,
                    sectors: *descriptor,
                    table: *table,
                    table2,
                });
                i += if table2.is_some() { 3 } else { 2 };
                continue;
            }
            SectionKind::Table | SectionKind::Table2 => {
                if strict {
                    return Err(Error::corrupt(format!(
                        "orphan {} section at offset {}",
                        descriptor.kind, descriptor.offset
                    )));
                }
                debug!(
                    "dropping orphan {} section at offset {} in segment {segment_number}",
                    descriptor.kind, descriptor.offset
                );
                break;
            }
            SectionKind::Header | SectionKind::Header2 | SectionKind::XHeader => {
                let body = read_body(store, descriptor)?;
                if parts.header_bodies.iter().any(|(k, _)| *k == descriptor.kind) {
                    debug!("duplicate {} section ignored", descriptor.kind);
                } else {
                    parts.header_bodies.push((descriptor.kind, body));
                }
            }
            SectionKind::Hash | SectionKind::Digest => {
                let body = read_body(store, descriptor)?;
                if parts.hash_bodies.iter().any(|(k, _)| *k == descriptor.kind) {
                    debug!("duplicate {} section ignored", descriptor.kind);
                } else {
                    parts.hash_bodies.push((descriptor.kind, body));
                }
            }
            SectionKind::Error2 => {
                parts.error_body = Some(read_body(store, descriptor)?);
            }
            SectionKind::Session => {
                parts.session_body = Some(read_body(store, descriptor)?);
            }
            SectionKind::Ltree => {
                debug!("skipping ltree section at offset {}", descriptor.offset);
            }
            SectionKind::Unknown(_) => {
                warn!(
                    "skipping unrecognized {} section at offset {}",
                    descriptor.kind, descriptor.offset
                );
            }
            SectionKind::Next | SectionKind::Done => {}
        }
        i += 1;
    }
    Ok(())
}

fn read_body(store: &mut dyn SegmentStore, descriptor: &SectionDescriptor) -> Result<Vec<u8>> {
    let len = descriptor.body_len();
    if len > MAX_BODY_LEN {
        return Err(Error::corrupt(format!(
            "{} section body of {len} bytes is implausibly large",
            descriptor.kind
        )));
    }
    let mut body = vec![0u8; len as usize];
    store
        .read_exact_at(descriptor.body_offset(), &mut body)
        .with_context(|| format!("reading {} section body", descriptor.kind))?;
    Ok(body)
}
