//! Error types for the replication engine.

use docsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur during replication.
///
/// Errors are `Clone` because the most recent one is kept as the
/// replication's `last_error` and handed to change listeners.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicationError {
    /// The remote peer answered with a non-success HTTP status.
    #[error("HTTP {status}: {reason}")]
    Http {
        /// Status code.
        status: u16,
        /// Reason phrase or error body.
        reason: String,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote URL is unusable.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// A response did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A batch processor or strategy hook failed.
    #[error("processor error: {0}")]
    Processor(String),

    /// The operation was cancelled.
    #[error("replication cancelled")]
    Cancelled,

    /// The replication is not running.
    #[error("replication is not running")]
    NotRunning,
}

impl ReplicationError {
    /// Creates an HTTP status error.
    pub fn http(status: u16, reason: impl Into<String>) -> Self {
        Self::Http {
            status,
            reason: reason.into(),
        }
    }

    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// The HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ReplicationError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true for 404 Not Found.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Returns true for 409 Conflict.
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// Returns true for 401 Unauthorized.
    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// Returns true if the peer could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, ReplicationError::Transport { .. })
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Transport { retryable, .. } => *retryable,
            ReplicationError::Http { status, .. } => *status >= 500 || *status == 408,
            _ => false,
        }
    }
}

impl From<ProtocolError> for ReplicationError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidUrl { .. } => Self::InvalidUrl(err.to_string()),
            ProtocolError::MalformedDocument(msg) => Self::Protocol(msg),
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
