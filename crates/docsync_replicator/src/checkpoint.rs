//! Checkpoint bookkeeping.
//!
//! [`CheckpointManager`] holds the replication cursor and the last known
//! remote checkpoint document, and decides what the session should do
//! next. It performs no I/O: the session issues the requests it asks for
//! and feeds the results back in. This keeps the write serialization rule
//! (never two writes to the remote document at once) in one place where it
//! can be tested without a network.

use crate::error::{ReplicationError, ReplicationResult};
use docsync_protocol::CheckpointDocument;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Where replication should begin after checkpoint resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Sequence to resume from, or `None` to replicate from scratch.
    pub start_sequence: Option<String>,
    /// Whether the create-target hook should run.
    pub create_target: bool,
    /// Error to surface as the session's last error.
    pub error: Option<ReplicationError>,
}

impl Resolution {
    fn from_scratch(create_target: bool, error: Option<ReplicationError>) -> Self {
        Self {
            start_sequence: None,
            create_target,
            error,
        }
    }
}

/// What a persist request turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistAction {
    /// Nothing changed since the last write.
    Idle,
    /// A write is in flight; a follow-up write will happen when it completes.
    Deferred,
    /// Write `body` to the remote checkpoint.
    Write {
        /// Document to PUT.
        body: CheckpointDocument,
        /// Sequence being written, for the local store.
        sequence: String,
    },
}

/// What to do after a checkpoint write completes.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    /// Nothing further.
    Done,
    /// Persist again right away.
    PersistAgain,
    /// The write collided with another revision; fetch the current
    /// document and then persist again.
    Refresh,
    /// The write failed.
    Failed {
        /// The failure.
        error: ReplicationError,
        /// Whether a newer value is waiting to be written.
        persist_again: bool,
    },
}

/// Tracks the replication cursor and serializes checkpoint writes.
#[derive(Debug, Default)]
pub struct CheckpointManager {
    last_sequence: Option<String>,
    changed: bool,
    remote: Option<CheckpointDocument>,
    saving: bool,
    overdue: bool,
}

impl CheckpointManager {
    /// Creates a manager with no cursor and no remote document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cursor.
    pub fn last_sequence(&self) -> Option<&str> {
        self.last_sequence.as_deref()
    }

    /// Returns true if the cursor moved since the last write began.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Returns true while a write (or the refresh after a collision) is in
    /// flight.
    pub fn is_saving(&self) -> bool {
        self.saving
    }

    /// Returns true if a write was requested while another was in flight.
    pub fn is_overdue(&self) -> bool {
        self.overdue
    }

    /// The last known remote checkpoint document.
    pub fn remote(&self) -> Option<&CheckpointDocument> {
        self.remote.as_ref()
    }

    /// Forgets the cursor at session start. The remote document and any
    /// in-flight write are left alone.
    pub fn clear_sequence(&mut self) {
        self.last_sequence = None;
        self.changed = false;
    }

    /// Resolution when the local store has no memory of this remote.
    pub fn resolve_without_local(&mut self) -> Resolution {
        self.changed = false;
        debug!("no local checkpoint, replicating from scratch");
        Resolution::from_scratch(true, None)
    }

    /// Resolves the starting point from the local cursor and the result of
    /// fetching the remote checkpoint.
    ///
    /// A remote document that disagrees with the local cursor in any way
    /// means replicating from scratch.
    pub fn resolve(&mut self, local: &str, fetched: ReplicationResult<Value>) -> Resolution {
        self.changed = false;

        let value = match fetched {
            Ok(value) => value,
            Err(err) if err.is_not_found() => {
                debug!("no remote checkpoint yet");
                self.remote = None;
                return Resolution::from_scratch(true, None);
            }
            Err(err) => {
                warn!(error = %err, "error getting remote checkpoint");
                return Resolution::from_scratch(false, Some(err));
            }
        };

        let document = match CheckpointDocument::from_value(value) {
            Ok(document) => document,
            Err(err) => {
                warn!(error = %err, "unreadable remote checkpoint");
                return Resolution::from_scratch(false, Some(err.into()));
            }
        };

        let remote_sequence = document.last_sequence();
        self.remote = Some(document);

        if remote_sequence.as_deref() == Some(local) {
            info!(sequence = local, "resuming from checkpoint");
            self.last_sequence = Some(local.to_string());
            Resolution {
                start_sequence: Some(local.to_string()),
                create_target: false,
                error: None,
            }
        } else {
            info!(
                local,
                remote = remote_sequence.as_deref().unwrap_or(""),
                "checkpoint mismatch, replicating from scratch"
            );
            Resolution::from_scratch(false, None)
        }
    }

    /// Advances the cursor. Returns true if a deferred write should be
    /// armed, which happens on the first change since the last write began.
    pub fn record_sequence(&mut self, sequence: Option<&str>) -> bool {
        let Some(sequence) = sequence else {
            return false;
        };
        if self.last_sequence.as_deref() == Some(sequence) {
            return false;
        }

        debug!(
            from = self.last_sequence.as_deref().unwrap_or(""),
            to = sequence,
            "setting last sequence"
        );
        self.last_sequence = Some(sequence.to_string());

        if self.changed {
            false
        } else {
            self.changed = true;
            true
        }
    }

    /// Starts a write if one is needed and none is in flight.
    pub fn begin_persist(&mut self) -> PersistAction {
        if !self.changed {
            return PersistAction::Idle;
        }
        if self.saving {
            debug!("checkpoint write in flight, marking overdue");
            self.overdue = true;
            return PersistAction::Deferred;
        }

        self.changed = false;
        self.overdue = false;
        let Some(sequence) = self.last_sequence.clone() else {
            return PersistAction::Idle;
        };

        self.saving = true;
        let body = self
            .remote
            .clone()
            .unwrap_or_default()
            .with_last_sequence(sequence.clone());
        PersistAction::Write { body, sequence }
    }

    /// Applies the result of the write started with `body`.
    pub fn complete_persist(
        &mut self,
        body: CheckpointDocument,
        result: ReplicationResult<Value>,
    ) -> PersistOutcome {
        match result {
            Ok(response) => {
                self.saving = false;
                let document = match response.get("rev").and_then(Value::as_str) {
                    Some(rev) => body.with_rev(rev),
                    None => body,
                };
                debug!(rev = document.rev().unwrap_or(""), "saved remote checkpoint");
                self.remote = Some(document);
                self.follow_up()
            }
            Err(err) if err.is_conflict() => {
                // Stays "saving" until the refresh lands.
                debug!("checkpoint revision conflict, refreshing");
                PersistOutcome::Refresh
            }
            Err(err) if err.is_not_found() && body.rev().is_some() => {
                self.saving = false;
                debug!("remote checkpoint vanished, rewriting without revision");
                self.remote = None;
                self.changed = true;
                self.overdue = true;
                PersistOutcome::PersistAgain
            }
            Err(error) => {
                self.saving = false;
                warn!(error = %error, "unable to save remote checkpoint");
                PersistOutcome::Failed {
                    error,
                    persist_again: self.overdue,
                }
            }
        }
    }

    /// Applies the result of re-fetching the remote checkpoint after a
    /// collision.
    ///
    /// On success the refreshed document becomes the base and the caller
    /// should persist again. On failure a write deferred during the refresh
    /// is still owed, so `persist_again` reports it.
    pub fn complete_refresh(&mut self, fetched: ReplicationResult<Value>) -> PersistOutcome {
        self.saving = false;
        let document = match fetched.and_then(|value| Ok(CheckpointDocument::from_value(value)?)) {
            Ok(document) => Some(document),
            Err(err) if err.is_not_found() => None,
            Err(error) => {
                warn!(error = %error, "error refreshing remote checkpoint");
                return PersistOutcome::Failed {
                    error,
                    persist_again: self.overdue,
                };
            }
        };
        debug!(
            rev = document.as_ref().and_then(|d| d.rev()).unwrap_or(""),
            "refreshed remote checkpoint"
        );
        self.remote = document;
        self.changed = true;
        PersistOutcome::PersistAgain
    }

    fn follow_up(&self) -> PersistOutcome {
        if self.overdue {
            PersistOutcome::PersistAgain
        } else {
            PersistOutcome::Done
        }
    }
}
