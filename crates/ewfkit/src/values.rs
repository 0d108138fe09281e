//! Header and hash value stores
//!
//! Case metadata and media digests travel as identifier/value string pairs.
//! On disk they are zlib-compressed line-oriented text in one of three
//! section encodings: `header` (single-byte text in a configured codepage),
//! `header2` (UTF-16) and `xheader` (UTF-8). Digests additionally persist
//! as fixed binary `hash` and `digest` bodies.
//!
//! Stores parse lazily on first access and the parsed cache is the source
//! of truth from then on; nothing ever re-parses. When several header
//! sections are present the precedence is `xheader`, `header2`, `header`,
//! first successful parse wins, so divergent older sections are shadowed.

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use ewfkit_codec::CompressionLevel;
use ewfkit_codec::checksum::crc32;
use ewfkit_codec::compress::{compress, decompress_capped};

use crate::section::verify_stored_crc;
use crate::{Error, ErrorKind, Result};

/// Well-known header value identifiers
pub mod header_ids {
    /// Case number
    pub const CASE_NUMBER: &str = "case_number";
    /// Description of the evidence
    pub const DESCRIPTION: &str = "description";
    /// Name of the examiner
    pub const EXAMINER_NAME: &str = "examiner_name";
    /// Evidence number
    pub const EVIDENCE_NUMBER: &str = "evidence_number";
    /// Free-form notes
    pub const NOTES: &str = "notes";
    /// Acquisition date and time
    pub const ACQUIRY_DATE: &str = "acquiry_date";
    /// System date and time at acquisition
    pub const SYSTEM_DATE: &str = "system_date";
    /// Operating system the acquisition ran on
    pub const ACQUIRY_OPERATING_SYSTEM: &str = "acquiry_operating_system";
    /// Software version the acquisition ran with
    pub const ACQUIRY_SOFTWARE_VERSION: &str = "acquiry_software_version";
    /// Password hash
    pub const PASSWORD: &str = "password";
    /// Source device model
    pub const MODEL: &str = "model";
    /// Source device serial number
    pub const SERIAL_NUMBER: &str = "serial_number";
}

/// Hash value identifiers
pub mod hash_ids {
    /// MD5 digest of the media, lowercase hex
    pub const MD5: &str = "MD5";
    /// SHA1 digest of the media, lowercase hex
    pub const SHA1: &str = "SHA1";
}

/// Codepage of the single-byte `header` section text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderCodepage {
    /// 7-bit ASCII; anything else is rejected
    #[default]
    Ascii,
    /// ISO 8859-1, bytes mapping directly to the first 256 code points
    Latin1,
}

/// Outcome of a lazy parse request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A section was parsed into the store
    Parsed,
    /// The store was already populated by an earlier parse
    AlreadyParsed,
    /// The container carries no section to parse
    NothingToParse,
}

/// Ordered store of identifier/value string pairs
///
/// Identifiers are case-sensitive ASCII tokens. Insertion order is
/// preserved and drives serialization order; replacing a value keeps its
/// position.
#[derive(Debug, Clone)]
pub struct ValueStore {
    what: &'static str,
    pairs: Vec<(String, String)>,
    parsed: bool,
    frozen: bool,
}

impl ValueStore {
    pub(crate) fn new(what: &'static str) -> Self {
        Self {
            what,
            pairs: Vec::new(),
            parsed: false,
            frozen: false,
        }
    }

    /// Value for an identifier
    pub fn get(&self, identifier: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(id, _)| id == identifier)
            .map(|(_, value)| value.as_str())
    }

    /// Set a value, replacing any previous value for the identifier
    pub fn set(&mut self, identifier: &str, value: &str) -> Result<()> {
        if self.frozen {
            return Err(ErrorKind::Frozen(self.what).into());
        }
        validate_identifier(identifier)?;
        if value.contains(['\t', '\n', '\r']) {
            return Err(Error::argument(format!(
                "{} value for {identifier} contains line or field separators",
                self.what
            )));
        }
        self.upsert(identifier.to_owned(), value.to_owned());
        Ok(())
    }

    /// Remove a value, returning it if present
    pub fn remove(&mut self, identifier: &str) -> Result<Option<String>> {
        if self.frozen {
            return Err(ErrorKind::Frozen(self.what).into());
        }
        let at = self.pairs.iter().position(|(id, _)| id == identifier);
        Ok(at.map(|at| self.pairs.remove(at).1))
    }

    /// Identifiers in insertion order
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(id, _)| id.as_str())
    }

    /// Number of values stored
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether the store holds no values
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    pub(crate) fn is_parsed(&self) -> bool {
        self.parsed
    }

    /// Install pairs produced by a section parse; parsed values shadow any
    /// earlier caller-set value of the same identifier
    pub(crate) fn apply_parsed(&mut self, pairs: Vec<(String, String)>) {
        for (identifier, value) in pairs {
            self.upsert(identifier, value);
        }
        self.parsed = true;
    }

    fn upsert(&mut self, identifier: String, value: String) {
        if let Some(pair) = self.pairs.iter_mut().find(|(id, _)| *id == identifier) {
            pair.1 = value;
        } else {
            self.pairs.push((identifier, value));
        }
    }
}

fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(Error::argument("value identifier must not be empty"));
    }
    if !identifier.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(Error::argument(format!(
            "value identifier {identifier:?} is not an ASCII token"
        )));
    }
    Ok(())
}

/// Inflated header text never legitimately approaches this
const MAX_HEADER_TEXT_LEN: usize = 1 << 20;

fn effective_level(level: CompressionLevel) -> CompressionLevel {
    if level == CompressionLevel::None {
        CompressionLevel::Fast
    } else {
        level
    }
}

/// Serialize a store into the line-oriented header text
pub(crate) fn encode_header_text(store: &ValueStore) -> String {
    let identifiers: Vec<&str> = store.pairs.iter().map(|(id, _)| id.as_str()).collect();
    let values: Vec<&str> = store.pairs.iter().map(|(_, value)| value.as_str()).collect();
    format!(
        "1\nmain\n{}\n{}\n\n",
        identifiers.join("\t"),
        values.join("\t")
    )
}

/// Parse the line-oriented header text into pairs
///
/// Malformed individual fields are skipped; a text that is not the known
/// layout at all is corrupt.
pub(crate) fn parse_header_text(text: &str) -> Result<Vec<(String, String)>> {
    let mut lines = text.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

    let version = lines.next().unwrap_or("");
    if version.trim() != "1" {
        return Err(Error::corrupt(format!(
            "unsupported header layout version {version:?}"
        )));
    }
    if lines.next() != Some("main") {
        return Err(Error::corrupt("header text missing the main category line"));
    }

    let identifiers: Vec<&str> = lines.next().unwrap_or("").split('\t').collect();
    let values: Vec<&str> = lines.next().unwrap_or("").split('\t').collect();
    if identifiers.len() != values.len() {
        debug!(
            "header text has {} identifier(s) but {} value(s)",
            identifiers.len(),
            values.len()
        );
    }

    let mut pairs = Vec::new();
    for (&identifier, &value) in identifiers.iter().zip(values.iter()) {
        if identifier.is_empty() || value.is_empty() {
            continue;
        }
        if validate_identifier(identifier).is_err() {
            debug!("skipping malformed header identifier {identifier:?}");
            continue;
        }
        pairs.push((identifier.to_owned(), value.to_owned()));
    }
    Ok(pairs)
}

fn encode_single_byte(text: &str, codepage: HeaderCodepage) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(text.len());
    for c in text.chars() {
        let byte = match codepage {
            HeaderCodepage::Ascii if c.is_ascii() => c as u8,
            HeaderCodepage::Latin1 => u8::try_from(u32::from(c)).map_err(|_| {
                Error::argument(format!("character {c:?} not representable in Latin-1"))
            })?,
            HeaderCodepage::Ascii => {
                return Err(Error::argument(format!(
                    "character {c:?} not representable in ASCII"
                )));
            }
        };
        bytes.push(byte);
    }
    Ok(bytes)
}

fn decode_single_byte(bytes: &[u8], codepage: HeaderCodepage) -> Result<String> {
    match codepage {
        HeaderCodepage::Ascii => {
            if !bytes.is_ascii() {
                return Err(Error::corrupt("non-ASCII byte in header text"));
            }
            Ok(bytes.iter().map(|&b| char::from(b)).collect())
        }
        HeaderCodepage::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
    }
}

/// Encode a `header` section body
pub(crate) fn encode_header_body(
    store: &ValueStore,
    codepage: HeaderCodepage,
    level: CompressionLevel,
) -> Result<Vec<u8>> {
    let bytes = encode_single_byte(&encode_header_text(store), codepage)?;
    Ok(compress(&bytes, effective_level(level))?)
}

/// Decode a `header` section body
pub(crate) fn decode_header_body(
    body: &[u8],
    codepage: HeaderCodepage,
) -> Result<Vec<(String, String)>> {
    let bytes = decompress_capped(body, MAX_HEADER_TEXT_LEN)?;
    parse_header_text(&decode_single_byte(&bytes, codepage)?)
}

/// Encode a `header2` section body (UTF-16, little-endian with BOM)
pub(crate) fn encode_header2_body(store: &ValueStore, level: CompressionLevel) -> Result<Vec<u8>> {
    let text = encode_header_text(store);
    let mut bytes = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(compress(&bytes, effective_level(level))?)
}

/// Decode a `header2` section body, honoring either byte order mark
pub(crate) fn decode_header2_body(body: &[u8]) -> Result<Vec<(String, String)>> {
    let bytes = decompress_capped(body, MAX_HEADER_TEXT_LEN)?;
    if bytes.len() % 2 != 0 {
        return Err(Error::corrupt("UTF-16 header text has an odd byte count"));
    }

    let (payload, big_endian) = match bytes.as_slice() {
        [0xFF, 0xFE, rest @ ..] => (rest, false),
        [0xFE, 0xFF, rest @ ..] => (rest, true),
        rest => (rest, false),
    };
    let units = payload.chunks_exact(2).map(|pair| {
        if big_endian {
            u16::from_be_bytes([pair[0], pair[1]])
        } else {
            u16::from_le_bytes([pair[0], pair[1]])
        }
    });
    let text: String = char::decode_utf16(units)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| Error::corrupt(format!("invalid UTF-16 header text: {e}")))?;
    parse_header_text(&text)
}

/// Encode an `xheader` section body (UTF-8)
pub(crate) fn encode_xheader_body(store: &ValueStore, level: CompressionLevel) -> Result<Vec<u8>> {
    Ok(compress(
        encode_header_text(store).as_bytes(),
        effective_level(level),
    )?)
}

/// Decode an `xheader` section body
pub(crate) fn decode_xheader_body(body: &[u8]) -> Result<Vec<(String, String)>> {
    let bytes = decompress_capped(body, MAX_HEADER_TEXT_LEN)?;
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::corrupt(format!("invalid UTF-8 header text: {e}")))?;
    parse_header_text(text)
}

pub(crate) const HASH_BODY_LEN: usize = 36;
pub(crate) const DIGEST_BODY_LEN: usize = 80;

/// Encode a `hash` section body
pub(crate) fn encode_hash_body(md5: &[u8; 16]) -> Vec<u8> {
    let mut body = vec![0u8; HASH_BODY_LEN];
    body[..16].copy_from_slice(md5);
    let crc = crc32(&body[..32]);
    LittleEndian::write_u32(&mut body[32..36], crc);
    body
}

/// Decode a `hash` section body; an all-zero digest means "not set"
pub(crate) fn decode_hash_body(body: &[u8]) -> Result<Option<[u8; 16]>> {
    if body.len() != HASH_BODY_LEN {
        return Err(Error::corrupt(format!(
            "hash section body is {} bytes, expected {HASH_BODY_LEN}",
            body.len()
        )));
    }
    let stored = LittleEndian::read_u32(&body[32..36]);
    verify_stored_crc("hash body", &body[..32], stored)?;

    let mut md5 = [0u8; 16];
    md5.copy_from_slice(&body[..16]);
    Ok((md5 != [0u8; 16]).then_some(md5))
}

/// Encode a `digest` section body; absent digests encode as zeros
pub(crate) fn encode_digest_body(md5: Option<&[u8; 16]>, sha1: Option<&[u8; 20]>) -> Vec<u8> {
    let mut body = vec![0u8; DIGEST_BODY_LEN];
    if let Some(md5) = md5 {
        body[..16].copy_from_slice(md5);
    }
    if let Some(sha1) = sha1 {
        body[16..36].copy_from_slice(sha1);
    }
    let crc = crc32(&body[..76]);
    LittleEndian::write_u32(&mut body[76..80], crc);
    body
}

/// Decode a `digest` section body into its optional digests
pub(crate) fn decode_digest_body(body: &[u8]) -> Result<(Option<[u8; 16]>, Option<[u8; 20]>)> {
    if body.len() != DIGEST_BODY_LEN {
        return Err(Error::corrupt(format!(
            "digest section body is {} bytes, expected {DIGEST_BODY_LEN}",
            body.len()
        )));
    }
    let stored = LittleEndian::read_u32(&body[76..80]);
    verify_stored_crc("digest body", &body[..76], stored)?;

    let mut md5 = [0u8; 16];
    md5.copy_from_slice(&body[..16]);
    let mut sha1 = [0u8; 20];
    sha1.copy_from_slice(&body[16..36]);
    Ok((
        (md5 != [0u8; 16]).then_some(md5),
        (sha1 != [0u8; 20]).then_some(sha1),
    ))
}

/// Parse a digest value out of its hex text form
pub(crate) fn parse_hex_digest<const N: usize>(what: &str, text: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(text)
        .map_err(|e| Error::argument(format!("invalid {what} hex value: {e}")))?;
    <[u8; N]>::try_from(bytes).map_err(|bytes: Vec<u8>| {
        Error::argument(format!(
            "{what} must be {N} bytes, got {} from the hex value",
            bytes.len()
        ))
    })
}
