//! Error types for container operations
//!
//! A container error pairs a typed [`ErrorKind`] with a trail of context
//! notes pushed as the error propagates outward. The trail reads
//! innermost-first, so the first note names the structure that actually
//! failed and later notes name the operations above it.

use std::fmt;

use thiserror::Error;

/// Result type for container operations
pub type Result<T> = std::result::Result<T, Error>;

/// Container error kinds
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Invalid argument from the caller
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Index outside a table or tracker
    #[error("{what} index {index} out of range (len {len})")]
    OutOfRange {
        /// Table the lookup ran against
        what: &'static str,
        /// Index that was requested
        index: u64,
        /// Number of entries present
        len: u64,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File does not start with a recognized container signature
    #[error("file signature mismatch: {0:02x?}")]
    SignatureMismatch([u8; 8]),

    /// Stored checksum disagrees with the computed value
    #[error("{what} checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Structure the checksum guards
        what: &'static str,
        /// Checksum carried on disk
        stored: u32,
        /// Checksum computed over the bytes
        computed: u32,
    },

    /// Stored values disagree where the format requires them to match
    #[error("value mismatch: {0}")]
    ValueMismatch(String),

    /// A segment file is missing from the set
    #[error("missing segment file {0}")]
    MissingSegment(u16),

    /// The last segment ends without a done section
    #[error("missing done section in the last segment file")]
    MissingDoneSection,

    /// A section the format requires was not found
    #[error("missing {0} section")]
    MissingSection(&'static str),

    /// Stored data is structurally invalid
    #[error("corrupt container: {0}")]
    Corrupt(String),

    /// The handle's state does not allow the operation
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The value can no longer change
    #[error("{0} cannot change once chunk data has been written")]
    Frozen(&'static str),

    /// Write resume was attempted on a finalized container
    #[error("container is already finalized")]
    AlreadyFinalized,

    /// Chunk codec failure
    #[error("codec error: {0}")]
    Codec(#[from] ewfkit_codec::Error),

    /// The operation stopped at a chunk boundary because abort was signaled
    #[error("operation aborted")]
    Aborted,
}

/// Container error: a typed kind plus propagation context
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    context: Vec<String>,
}

impl Error {
    /// The typed kind of this error
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Context notes pushed while the error propagated, innermost first
    pub fn context(&self) -> &[String] {
        &self.context
    }

    /// Push a context note onto the trail
    #[must_use]
    pub fn with_context(mut self, note: impl Into<String>) -> Self {
        self.context.push(note.into());
        self
    }

    /// Whether this error is the cooperative-abort outcome
    pub fn is_aborted(&self) -> bool {
        matches!(self.kind, ErrorKind::Aborted)
    }

    pub(crate) fn argument(message: impl Into<String>) -> Self {
        ErrorKind::Argument(message.into()).into()
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        ErrorKind::Runtime(message.into()).into()
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        ErrorKind::Corrupt(message.into()).into()
    }

    pub(crate) fn value_mismatch(message: impl Into<String>) -> Self {
        ErrorKind::ValueMismatch(message.into()).into()
    }

    pub(crate) fn out_of_range(what: &'static str, index: u64, len: u64) -> Self {
        ErrorKind::OutOfRange { what, index, len }.into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.context.is_empty() {
            write!(f, " ({})", self.context.join("; "))?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: Vec::new(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        ErrorKind::Io(error).into()
    }
}

impl From<ewfkit_codec::Error> for Error {
    fn from(error: ewfkit_codec::Error) -> Self {
        ErrorKind::Codec(error).into()
    }
}

/// Attach propagation context to container results
pub trait Context<T> {
    /// Push a context note onto the error's trail
    fn context(self, note: impl Into<String>) -> Result<T>;

    /// Push a lazily built context note onto the error's trail
    fn with_context<F>(self, note: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context(self, note: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(note))
    }

    fn with_context<F>(self, note: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(note()))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_trail() {
        let err = Error::corrupt("truncated table body")
            .with_context("segment file 2")
            .with_context("opening container");

        assert_eq!(
            err.to_string(),
            "corrupt container: truncated table body (segment file 2; opening container)"
        );
    }

    #[test]
    fn display_without_context_is_bare_kind() {
        let err: Error = ErrorKind::MissingDoneSection.into();
        assert_eq!(
            err.to_string(),
            "missing done section in the last segment file"
        );
    }

    #[test]
    fn codec_errors_convert() {
        let codec = ewfkit_codec::Error::ChecksumMismatch {
            stored: 1,
            computed: 2,
        };
        let err: Error = codec.into();
        assert!(matches!(err.kind(), ErrorKind::Codec(_)));
    }

    #[test]
    fn context_trait_applies_to_io_results() {
        let io: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "short read",
        ));
        let err = io.context("reading section descriptor").expect_err("io error");

        assert!(matches!(err.kind(), ErrorKind::Io(_)));
        assert_eq!(err.context(), ["reading section descriptor"]);
    }
}
