//! Section framing
//!
//! Everything in a segment file after the file header is a chain of
//! sections. Each starts with a 76-byte descriptor: a 16-byte type tag, the
//! absolute offset of the next descriptor, the section's total size
//! (descriptor plus body) and a CRC32 over the descriptor bytes. The chain
//! ends at a `done` section (last segment) or a `next` section (more
//! segments follow).

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::io::SegmentStore;
use crate::{Context, Error, ErrorKind, Result};

/// On-disk length of a section descriptor
pub const SECTION_DESCRIPTOR_LEN: u64 = 76;

const TAG_LEN: usize = 16;

/// Section type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Legacy single-byte-text header values
    Header,
    /// UTF-16 header values
    Header2,
    /// UTF-8 header values
    XHeader,
    /// Media geometry (first segment)
    Volume,
    /// Media geometry copy (later segments)
    Data,
    /// Chunk offsets for the preceding sectors section
    Table,
    /// Redundant copy of the preceding table
    Table2,
    /// Stored chunk data
    Sectors,
    /// Acquisition-time error ranges
    Error2,
    /// Optical session ranges
    Session,
    /// MD5 digest of the media
    Hash,
    /// MD5 and SHA1 digests of the media
    Digest,
    /// Chain continues in the next segment file
    Next,
    /// Final section of the container
    Done,
    /// Logical evidence tree; recognized but carried opaquely
    Ltree,
    /// Unrecognized tag, skipped via the chain
    Unknown([u8; TAG_LEN]),
}

impl SectionKind {
    /// Parse a 16-byte NUL-padded type tag
    pub fn from_tag(tag: &[u8; TAG_LEN]) -> Self {
        let end = tag.iter().position(|&b| b == 0).unwrap_or(TAG_LEN);
        match &tag[..end] {
            b"header" => Self::Header,
            b"header2" => Self::Header2,
            b"xheader" => Self::XHeader,
            // Older writers in the format family tag the volume "disk".
            b"volume" | b"disk" => Self::Volume,
            b"data" => Self::Data,
            b"table" => Self::Table,
            b"table2" => Self::Table2,
            b"sectors" => Self::Sectors,
            b"error2" => Self::Error2,
            b"session" => Self::Session,
            b"hash" => Self::Hash,
            b"digest" => Self::Digest,
            b"next" => Self::Next,
            b"done" => Self::Done,
            b"ltree" => Self::Ltree,
            _ => Self::Unknown(*tag),
        }
    }

    /// 16-byte NUL-padded type tag
    pub fn tag(&self) -> [u8; TAG_LEN] {
        if let Self::Unknown(tag) = self {
            return *tag;
        }
        let mut tag = [0u8; TAG_LEN];
        let name = self.name();
        tag[..name.len()].copy_from_slice(name.as_bytes());
        tag
    }

    /// Canonical tag name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Header2 => "header2",
            Self::XHeader => "xheader",
            Self::Volume => "volume",
            Self::Data => "data",
            Self::Table => "table",
            Self::Table2 => "table2",
            Self::Sectors => "sectors",
            Self::Error2 => "error2",
            Self::Session => "session",
            Self::Hash => "hash",
            Self::Digest => "digest",
            Self::Next => "next",
            Self::Done => "done",
            Self::Ltree => "ltree",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Whether this kind terminates a segment's chain
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Next | Self::Done)
    }
}

impl std::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A section's position and framing inside one segment file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionDescriptor {
    /// Section type
    pub kind: SectionKind,
    /// Absolute offset of the descriptor in the segment file
    pub offset: u64,
    /// Absolute offset of the next descriptor
    pub next_offset: u64,
    /// Total section length, descriptor included; 0 for descriptor-only
    /// sections written by some older tools
    pub size: u64,
}

impl SectionDescriptor {
    /// Absolute offset of the section body
    pub fn body_offset(&self) -> u64 {
        self.offset + SECTION_DESCRIPTOR_LEN
    }

    /// Body length in bytes
    pub fn body_len(&self) -> u64 {
        self.size.saturating_sub(SECTION_DESCRIPTOR_LEN)
    }

    /// Absolute offset one past the section's last byte
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size.max(SECTION_DESCRIPTOR_LEN)
    }
}

/// Verify a stored CRC32, naming the guarded structure on mismatch
pub(crate) fn verify_stored_crc(what: &'static str, data: &[u8], stored: u32) -> Result<()> {
    match ewfkit_codec::checksum::verify(data, stored) {
        Ok(()) => Ok(()),
        Err(ewfkit_codec::Error::ChecksumMismatch { stored, computed }) => {
            Err(ErrorKind::ChecksumMismatch {
                what,
                stored,
                computed,
            }
            .into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Read and validate one section descriptor
pub fn read_descriptor(store: &mut dyn SegmentStore, offset: u64) -> Result<SectionDescriptor> {
    let mut raw = [0u8; SECTION_DESCRIPTOR_LEN as usize];
    store
        .read_exact_at(offset, &mut raw)
        .with_context(|| format!("reading section descriptor at offset {offset}"))?;

    let stored_crc = LittleEndian::read_u32(&raw[72..76]);
    verify_stored_crc("section descriptor", &raw[..72], stored_crc)
        .with_context(|| format!("section descriptor at offset {offset}"))?;

    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&raw[..TAG_LEN]);
    let kind = SectionKind::from_tag(&tag);
    let next_offset = LittleEndian::read_u64(&raw[16..24]);
    let size = LittleEndian::read_u64(&raw[24..32]);

    if size != 0 && size < SECTION_DESCRIPTOR_LEN {
        return Err(Error::corrupt(format!(
            "section {kind} at offset {offset} has impossible size {size}"
        )));
    }

    Ok(SectionDescriptor {
        kind,
        offset,
        next_offset,
        size,
    })
}

/// Write one section descriptor
pub fn write_descriptor(
    store: &mut dyn SegmentStore,
    descriptor: &SectionDescriptor,
) -> Result<()> {
    let mut raw = [0u8; SECTION_DESCRIPTOR_LEN as usize];
    raw[..TAG_LEN].copy_from_slice(&descriptor.kind.tag());
    LittleEndian::write_u64(&mut raw[16..24], descriptor.next_offset);
    LittleEndian::write_u64(&mut raw[24..32], descriptor.size);
    let crc = ewfkit_codec::checksum::crc32(&raw[..72]);
    LittleEndian::write_u32(&mut raw[72..76], crc);

    store
        .write_all_at(descriptor.offset, &raw)
        .with_context(|| {
            format!(
                "writing {} section descriptor at offset {}",
                descriptor.kind, descriptor.offset
            )
        })
}

/// Result of walking one segment file's section chain
#[derive(Debug, Clone)]
pub struct SectionWalk {
    /// Descriptors in chain order, terminal section included
    pub sections: Vec<SectionDescriptor>,
    /// How the chain terminated; `None` only from a partial walk that hit
    /// damage before a terminal section
    pub terminal: Option<SectionKind>,
}

/// Walk a segment file's section chain strictly
///
/// Every descriptor must validate and the chain must end at `done` or
/// `next`. A chain that runs off the end of the file fails with the
/// missing-done input error; a chain that stalls or regresses is corrupt.
pub fn walk(store: &mut dyn SegmentStore, first_offset: u64) -> Result<SectionWalk> {
    let file_len = store.len()?;
    let mut sections = Vec::new();
    let mut offset = first_offset;

    loop {
        if offset + SECTION_DESCRIPTOR_LEN > file_len {
            return Err(Error::from(ErrorKind::MissingDoneSection)
                .with_context(format!("section chain runs past end of file at {offset}")));
        }
        let descriptor = read_descriptor(store, offset)?;
        if descriptor.end_offset() > file_len {
            return Err(Error::from(ErrorKind::MissingDoneSection).with_context(format!(
                "{} section body at offset {offset} is truncated",
                descriptor.kind
            )));
        }
        sections.push(descriptor);

        if descriptor.kind.is_terminal() {
            return Ok(SectionWalk {
                sections,
                terminal: Some(descriptor.kind),
            });
        }
        if descriptor.next_offset <= offset {
            return Err(Error::corrupt(format!(
                "section chain stalls at {} section, offset {offset}",
                descriptor.kind
            )));
        }
        offset = descriptor.next_offset;
    }
}

/// Walk as much of a section chain as validates, swallowing damage
///
/// Used when resuming an interrupted write, where the tail of the last
/// segment file is expected to be incomplete. Stops at the first problem
/// with `terminal` unset.
pub fn walk_partial(store: &mut dyn SegmentStore, first_offset: u64) -> SectionWalk {
    let file_len = match store.len() {
        Ok(len) => len,
        Err(e) => {
            debug!("partial walk cannot size store: {e}");
            return SectionWalk {
                sections: Vec::new(),
                terminal: None,
            };
        }
    };
    let mut sections = Vec::new();
    let mut offset = first_offset;

    loop {
        if offset + SECTION_DESCRIPTOR_LEN > file_len {
            debug!("partial walk stops at end of file, offset {offset}");
            return SectionWalk {
                sections,
                terminal: None,
            };
        }
        let descriptor = match read_descriptor(store, offset) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                debug!("partial walk stops at offset {offset}: {e}");
                return SectionWalk {
                    sections,
                    terminal: None,
                };
            }
        };
        if descriptor.end_offset() > file_len {
            debug!(
                "partial walk stops: {} body at offset {offset} is truncated",
                descriptor.kind
            );
            return SectionWalk {
                sections,
                terminal: None,
            };
        }
        sections.push(descriptor);

        if descriptor.kind.is_terminal() {
            return SectionWalk {
                sections,
                terminal: Some(descriptor.kind),
            };
        }
        if descriptor.next_offset <= offset {
            debug!(
                "partial walk stops: chain stalls at {} section, offset {offset}",
                descriptor.kind
            );
            return SectionWalk {
                sections,
                terminal: None,
            };
        }
        offset = descriptor.next_offset;
    }
}
