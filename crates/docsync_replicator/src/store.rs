//! Local document store capability.

use docsync_protocol::Direction;
use parking_lot::RwLock;
use std::collections::HashMap;

/// The parts of the local database a replication needs.
///
/// The replication only keeps a single cursor value per (remote, direction);
/// everything else stays behind this trait.
pub trait LocalStore: Send + Sync {
    /// Stable, private identifier of this database instance.
    fn private_identity(&self) -> String;

    /// The last sequence recorded for `remote` in `direction`, if any.
    fn last_sequence(&self, remote: &str, direction: Direction) -> Option<String>;

    /// Records the last replicated sequence for `remote` in `direction`.
    fn set_last_sequence(&self, sequence: &str, remote: &str, direction: Direction);
}

/// An in-memory store for tests and tools.
#[derive(Debug)]
pub struct MemoryStore {
    identity: String,
    sequences: RwLock<HashMap<(String, Direction), String>>,
}

impl MemoryStore {
    /// Creates an empty store with the given private identity.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            sequences: RwLock::new(HashMap::new()),
        }
    }

    /// Seeds a recorded sequence.
    pub fn with_sequence(self, remote: &str, direction: Direction, sequence: &str) -> Self {
        self.sequences
            .write()
            .insert((remote.to_string(), direction), sequence.to_string());
        self
    }

    /// Number of recorded cursors.
    pub fn len(&self) -> usize {
        self.sequences.read().len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.sequences.read().is_empty()
    }
}

impl LocalStore for MemoryStore {
    fn private_identity(&self) -> String {
        self.identity.clone()
    }

    fn last_sequence(&self, remote: &str, direction: Direction) -> Option<String> {
        self.sequences
            .read()
            .get(&(remote.to_string(), direction))
            .cloned()
    }

    fn set_last_sequence(&self, sequence: &str, remote: &str, direction: Direction) {
        self.sequences
            .write()
            .insert((remote.to_string(), direction), sequence.to_string());
    }
}
