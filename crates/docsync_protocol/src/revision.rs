//! Revisions moved by a replication.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single versioned document state transferred between peers.
///
/// The body is opaque to the replication engine; only the identifying
/// fields and the source sequence are interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    /// Document ID.
    pub doc_id: String,
    /// Revision ID within the document's history.
    pub rev_id: String,
    /// Sequence of this revision in its source database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
    /// Whether this revision is a deletion.
    #[serde(default)]
    pub deleted: bool,
    /// Document body, if it has been loaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Revision {
    /// Creates a revision with no body.
    pub fn new(doc_id: impl Into<String>, rev_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            rev_id: rev_id.into(),
            sequence: None,
            deleted: false,
            body: None,
        }
    }

    /// Sets the source sequence.
    pub fn with_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.sequence = Some(sequence.into());
        self
    }

    /// Marks the revision as a deletion.
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Attaches a body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}
