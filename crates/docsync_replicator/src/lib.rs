//! # docsync Replicator
//!
//! Replication session engine for docsync.
//!
//! This crate provides:
//! - `Replication`, the per-remote, per-direction session state machine
//! - `Batcher`, a debounced, capacity-bounded work queue
//! - `CheckpointManager`, which resolves the resume point and serializes
//!   checkpoint writes
//! - `TaskLedger`, the count of outstanding asynchronous work
//! - `Scheduler` implementations (a worker thread and a manual clock)
//! - Transport, local store and authorizer capabilities, with in-memory
//!   implementations for tests
//!
//! ## Architecture
//!
//! Direction-specific logic (what to push, what to pull) is supplied as a
//! `ReplicationStrategy`. The engine owns everything around it:
//! 1. Session handshake and cookie login
//! 2. Checkpoint resolution
//! 3. Batching of revisions into the strategy
//! 4. Debounced checkpoint persistence
//! 5. Graceful stop once outstanding work drains
//!
//! ## Key Invariants
//!
//! - Session state is only touched under its lock, never across callbacks
//! - Transport completions run on the scheduler
//! - Batches preserve enqueue order and never exceed capacity
//! - At most one checkpoint write is in flight per replication
//! - Every asynchronous operation is counted exactly once in the ledger

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod batcher;
mod checkpoint;
mod config;
mod error;
mod http;
mod ledger;
mod manager;
mod scheduler;
mod session;
mod store;
mod transport;

pub use auth::{
    parse_assertion, AccessTokenAuthorizer, AssertionAuthorizer, Authorizer,
    CredentialRegistry, ParsedAssertion, ACCESS_TOKEN_QUERY_PARAMETER, ASSERTION_QUERY_PARAMETER,
    EMAIL_QUERY_PARAMETER,
};
pub use batcher::Batcher;
pub use checkpoint::{CheckpointManager, PersistAction, PersistOutcome, Resolution};
pub use config::{
    ReplicationConfig, DEFAULT_CHECKPOINT_SAVE_DELAY, DEFAULT_INBOX_CAPACITY,
    DEFAULT_PROCESSOR_DELAY, DEFAULT_RETRY_DELAY,
};
pub use error::{ReplicationError, ReplicationResult};
pub use http::{BlockingClient, LoopbackPeer, ThreadedTransport};
pub use ledger::{TaskGuard, TaskLedger};
pub use manager::ReplicationManager;
pub use scheduler::{Job, ManualScheduler, Scheduler, ThreadScheduler, TimerId};
pub use session::{ListenerId, Replication, ReplicationStatus, ReplicationStrategy};
pub use store::{LocalStore, MemoryStore};
pub use transport::{Completion, Method, MockTransport, RemoteRequest, Transport};

pub use docsync_protocol::{Direction, RemoteUrl, Revision};

/// Builders for test inputs.
pub mod testing {
    pub use crate::auth::encode_assertion;
}
