//! Remote checkpoint documents.
//!
//! A checkpoint records how far a replication has progressed. It lives on
//! the remote peer as a local (non-replicated) document whose id is derived
//! from the local database identity, the remote URL and the direction, so
//! the same pair of databases always finds the same checkpoint.

use crate::direction::Direction;
use crate::error::{ProtocolError, ProtocolResult};
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

/// Field holding the replicated sequence.
pub const LAST_SEQUENCE_FIELD: &str = "lastSequence";

const REV_FIELD: &str = "_rev";

/// Computes the checkpoint document id.
///
/// `hex(sha1(private_identity + "\n" + remote_url + "\n" + direction_bit))`
pub fn checkpoint_id(private_identity: &str, remote_url: &str, direction: Direction) -> String {
    let mut hasher = Sha1::new();
    hasher.update(private_identity.as_bytes());
    hasher.update(b"\n");
    hasher.update(remote_url.as_bytes());
    hasher.update(b"\n");
    hasher.update(direction.bit().as_bytes());
    hex::encode(hasher.finalize())
}

/// Path of a checkpoint document relative to the remote database.
pub fn checkpoint_path(id: &str) -> String {
    format!("/_local/{id}")
}

/// A loosely-typed checkpoint document.
///
/// Unknown fields are kept so that a rewrite never drops data another
/// client stored alongside the sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointDocument {
    fields: Map<String, Value>,
}

impl CheckpointDocument {
    /// Creates an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing JSON object.
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Parses a document from a JSON value.
    pub fn from_value(value: Value) -> ProtocolResult<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(ProtocolError::MalformedDocument(format!(
                "checkpoint must be an object, got {other}"
            ))),
        }
    }

    /// The replicated sequence, if recorded.
    ///
    /// Numeric sequences are accepted and rendered as strings.
    pub fn last_sequence(&self) -> Option<String> {
        match self.fields.get(LAST_SEQUENCE_FIELD)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// The revision token needed to overwrite this document.
    pub fn rev(&self) -> Option<&str> {
        self.fields.get(REV_FIELD).and_then(Value::as_str)
    }

    /// Returns a copy with `lastSequence` replaced.
    pub fn with_last_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.fields
            .insert(LAST_SEQUENCE_FIELD.to_string(), Value::String(sequence.into()));
        self
    }

    /// Returns a copy with the revision token replaced.
    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.fields
            .insert(REV_FIELD.to_string(), Value::String(rev.into()));
        self
    }

    /// Returns a copy without a revision token.
    pub fn without_rev(mut self) -> Self {
        self.fields.remove(REV_FIELD);
        self
    }

    /// Reads an arbitrary field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns the document as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Consumes the document, returning its fields.
    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }
}
