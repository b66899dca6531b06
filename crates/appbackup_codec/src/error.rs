//! Error types for the codec crate.

use std::io;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding an archive stream.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended in the middle of a header or a record body.
    #[error("unexpected end of archive stream after {offset} bytes")]
    UnexpectedEof {
        /// Stream offset at which the data ran out.
        offset: u64,
    },

    /// A header block failed structural validation.
    #[error("malformed header: {message}")]
    MalformedHeader {
        /// Description of the problem.
        message: String,
    },

    /// An extended header block could not be parsed.
    #[error("malformed extended header: {message}")]
    MalformedExtendedHeader {
        /// Description of the problem.
        message: String,
    },

    /// A manifest record body could not be parsed.
    #[error("malformed manifest: {message}")]
    MalformedManifest {
        /// Description of the problem.
        message: String,
    },

    /// A metadata record body could not be parsed.
    #[error("malformed metadata record: {message}")]
    MalformedMetadata {
        /// Description of the problem.
        message: String,
    },

    /// A key-value data blob could not be parsed.
    #[error("malformed key-value data: {message}")]
    MalformedKeyValue {
        /// Description of the problem.
        message: String,
    },

    /// A record declared more bytes than the reader is willing to buffer.
    #[error("record too large: {size} bytes exceeds limit of {limit}")]
    RecordTooLarge {
        /// Declared size.
        size: u64,
        /// Configured limit.
        limit: u64,
    },

    /// A value does not fit the fixed-width header field and cannot be
    /// carried in an extended header either.
    #[error("field {field} cannot encode value: {message}")]
    FieldOverflow {
        /// Header field name.
        field: &'static str,
        /// Description of the problem.
        message: String,
    },

    /// The agent-supplied content did not match the size declared in its header.
    #[error("content size mismatch: declared {declared}, written {written}")]
    SizeMismatch {
        /// Size declared in the header.
        declared: u64,
        /// Bytes actually supplied.
        written: u64,
    },
}

impl CodecError {
    /// Creates a malformed header error.
    pub fn malformed_header(message: impl Into<String>) -> Self {
        Self::MalformedHeader {
            message: message.into(),
        }
    }

    /// Creates a malformed extended header error.
    pub fn malformed_extended(message: impl Into<String>) -> Self {
        Self::MalformedExtendedHeader {
            message: message.into(),
        }
    }

    /// Creates a malformed manifest error.
    pub fn malformed_manifest(message: impl Into<String>) -> Self {
        Self::MalformedManifest {
            message: message.into(),
        }
    }

    /// Creates a malformed metadata error.
    pub fn malformed_metadata(message: impl Into<String>) -> Self {
        Self::MalformedMetadata {
            message: message.into(),
        }
    }

    /// Creates a malformed key-value error.
    pub fn malformed_kv(message: impl Into<String>) -> Self {
        Self::MalformedKeyValue {
            message: message.into(),
        }
    }

    /// Returns true if the error describes a structural problem with the
    /// archive contents rather than a failure of the underlying stream.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            CodecError::MalformedHeader { .. }
                | CodecError::MalformedExtendedHeader { .. }
                | CodecError::MalformedManifest { .. }
                | CodecError::MalformedMetadata { .. }
                | CodecError::MalformedKeyValue { .. }
                | CodecError::RecordTooLarge { .. }
        )
    }
}
