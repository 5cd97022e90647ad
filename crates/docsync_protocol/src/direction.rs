//! Replication direction.

use std::fmt;

/// Which way revisions flow in a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Local revisions are sent to the remote peer.
    Push,
    /// Remote revisions are fetched into the local store.
    Pull,
}

impl Direction {
    /// Returns true for push replications.
    pub fn is_push(&self) -> bool {
        matches!(self, Direction::Push)
    }

    /// Returns true for pull replications.
    pub fn is_pull(&self) -> bool {
        matches!(self, Direction::Pull)
    }

    /// The bit mixed into the checkpoint id: `"1"` for push, `"0"` for pull.
    pub fn bit(&self) -> &'static str {
        match self {
            Direction::Push => "1",
            Direction::Pull => "0",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Push => f.write_str("push"),
            Direction::Pull => f.write_str("pull"),
        }
    }
}
