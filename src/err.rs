use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;
pub type Result<T> = std::result::Result<T, PdbError>;

/// Errors produced while decoding the bytes of a PDB container.
///
/// `BadSignature`, `Truncated` and `OutOfBounds` are fatal for the container as a whole.
/// `Malformed` is scoped to the stream being decoded: decoders that hit it keep whatever
/// they decoded before the bad record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid MSF signature, expected `Microsoft C/C++ MSF 7.00`, found `{found:02X?}`")]
    BadSignature { found: Vec<u8> },

    #[error("offset {offset}: truncated {what} (need {need} bytes, have {have})")]
    Truncated {
        what: &'static str,
        offset: u64,
        need: usize,
        have: usize,
    },

    #[error("offset {offset}: {what} is out of bounds (limit {limit})")]
    OutOfBounds {
        what: &'static str,
        offset: u64,
        limit: u64,
    },

    #[error("offset {offset}: malformed {what}: {message}")]
    Malformed {
        what: &'static str,
        offset: u64,
        message: String,
    },
}

impl DecodeError {
    pub(crate) fn malformed(what: &'static str, offset: usize, message: impl Into<String>) -> Self {
        DecodeError::Malformed {
            what,
            offset: offset as u64,
            message: message.into(),
        }
    }

    /// Running out of bytes inside a stream body is a defect of that stream, not of the
    /// container. Other kinds are returned unchanged.
    pub(crate) fn scoped_to_stream(self) -> Self {
        match self {
            DecodeError::Truncated {
                what,
                offset,
                need,
                have,
            } => DecodeError::Malformed {
                what,
                offset,
                message: format!("needs {need} bytes, {have} left"),
            },
            other => other,
        }
    }

    /// Whether this error invalidates the whole container, rather than a single stream.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DecodeError::Malformed { .. })
    }
}

#[derive(Debug, Error)]
pub enum PdbError {
    #[error("Failed to open file {}: {source}", path.display())]
    FailedToOpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("An I/O error has occurred: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}
