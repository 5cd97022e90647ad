//! # docsync Protocol
//!
//! Replication protocol types for docsync.
//!
//! This crate provides:
//! - `Direction` for push/pull replications
//! - `Revision` for the units a replication transfers
//! - `CheckpointDocument` and the deterministic checkpoint id
//! - `RemoteUrl` parsing and relative path joining
//! - `SessionInfo` for cookie-session checks
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod direction;
mod error;
mod remote;
mod revision;
mod session;

pub use checkpoint::{checkpoint_id, checkpoint_path, CheckpointDocument, LAST_SEQUENCE_FIELD};
pub use direction::Direction;
pub use error::{ProtocolError, ProtocolResult};
pub use remote::{join_url, RemoteUrl};
pub use revision::Revision;
pub use session::{SessionInfo, UserContext};
