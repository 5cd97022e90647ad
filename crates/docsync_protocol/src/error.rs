//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while interpreting protocol data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The remote URL could not be parsed.
    #[error("invalid remote URL {url:?}: {reason}")]
    InvalidUrl {
        /// The rejected input.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A document did not have the expected shape.
    #[error("malformed document: {0}")]
    MalformedDocument(String),
}

impl ProtocolError {
    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedDocument(err.to_string())
    }
}
