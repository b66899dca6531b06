//! Error types for the orchestration core.

use crate::status::TransportStatus;
use appbackup_codec::CodecError;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Failure classes the orchestrators act on.
///
/// Every error that reaches a state machine is mapped onto one of these
/// before the next transition is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal to the whole pass.
    Transport,
    /// Fatal to the current package only.
    Agent,
    /// Package intentionally excluded.
    PolicyRejected,
    /// Structural violation in an archive stream.
    MalformedArchive,
    /// Deadline expired.
    Timeout,
    /// Missing file, closed pipe or similar.
    ResourceUnavailable,
    /// Explicitly cancelled.
    Cancelled,
    /// Call made in a state that does not allow it.
    InvalidState,
}

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Archive codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bookkeeping serialization error.
    #[error("bookkeeping serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The transport reported a failure.
    #[error("transport error ({status:?}): {message}")]
    Transport {
        /// Status returned by the transport.
        status: TransportStatus,
        /// What was being attempted.
        message: String,
    },

    /// An agent failed or misbehaved.
    #[error("agent error for {package}: {message}")]
    Agent {
        /// Package whose agent failed.
        package: String,
        /// Description of the failure.
        message: String,
    },

    /// A package was excluded by policy.
    #[error("package {package} rejected: {reason}")]
    PolicyRejected {
        /// Rejected package.
        package: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An operation timed out.
    #[error("operation {token:#010x} timed out")]
    Timeout {
        /// Token of the operation.
        token: u32,
    },

    /// An operation was cancelled.
    #[error("operation {token:#010x} cancelled")]
    Cancelled {
        /// Token of the operation.
        token: u32,
    },

    /// A resource needed by the operation is gone.
    #[error("resource unavailable: {message}")]
    ResourceUnavailable {
        /// Description of the missing resource.
        message: String,
    },

    /// A token is already registered.
    #[error("token {token:#010x} already registered")]
    DuplicateToken {
        /// The duplicate token.
        token: u32,
    },

    /// A backup pass is already running.
    #[error("a backup pass is already in progress")]
    PassInProgress,

    /// The service worker has stopped.
    #[error("backup service is shut down")]
    ServiceStopped,

    /// Invalid state for the requested operation.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of the problem.
        message: String,
    },
}

impl CoreError {
    /// Creates a transport error.
    pub fn transport(status: TransportStatus, message: impl Into<String>) -> Self {
        Self::Transport {
            status,
            message: message.into(),
        }
    }

    /// Creates an agent error.
    pub fn agent(package: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Agent {
            package: package.into(),
            message: message.into(),
        }
    }

    /// Creates a policy rejection.
    pub fn rejected(package: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyRejected {
            package: package.into(),
            reason: reason.into(),
        }
    }

    /// Creates a resource-unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            message: message.into(),
        }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Maps this error onto the failure class the orchestrators act on.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Codec(CodecError::Io(_)) | Self::Io(_) | Self::ResourceUnavailable { .. } => {
                ErrorKind::ResourceUnavailable
            }
            Self::Codec(_) => ErrorKind::MalformedArchive,
            Self::Serialization(_) => ErrorKind::InvalidState,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Agent { .. } => ErrorKind::Agent,
            Self::PolicyRejected { .. } => ErrorKind::PolicyRejected,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } | Self::ServiceStopped => ErrorKind::Cancelled,
            Self::DuplicateToken { .. } | Self::PassInProgress | Self::InvalidState { .. } => {
                ErrorKind::InvalidState
            }
        }
    }

    /// Returns true if the error ends the whole pass rather than one package.
    #[must_use]
    pub fn is_fatal_to_pass(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(
            CoreError::transport(TransportStatus::Error, "perform").kind(),
            ErrorKind::Transport
        );
        assert_eq!(CoreError::agent("p", "crashed").kind(), ErrorKind::Agent);
        assert_eq!(CoreError::Timeout { token: 1 }.kind(), ErrorKind::Timeout);
        assert_eq!(
            CoreError::from(CodecError::malformed_header("bad checksum")).kind(),
            ErrorKind::MalformedArchive
        );
        assert_eq!(
            CoreError::from(io::Error::new(io::ErrorKind::BrokenPipe, "closed")).kind(),
            ErrorKind::ResourceUnavailable
        );
        assert_eq!(CoreError::PassInProgress.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn only_transport_errors_end_the_pass() {
        assert!(CoreError::transport(TransportStatus::NotInitialized, "x").is_fatal_to_pass());
        assert!(!CoreError::rejected("p", "signature mismatch").is_fatal_to_pass());
    }

    #[test]
    fn display() {
        let err = CoreError::Timeout { token: 0xAB };
        assert_eq!(err.to_string(), "operation 0x000000ab timed out");
    }
}
