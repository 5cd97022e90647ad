//! Configuration for replications.

use docsync_protocol::Direction;
use std::time::Duration;

/// Default number of revisions handed to the inbox processor at once.
pub const DEFAULT_INBOX_CAPACITY: usize = 100;
/// Default coalescing window of the inbox batcher.
pub const DEFAULT_PROCESSOR_DELAY: Duration = Duration::from_millis(500);
/// Default delay before a changed sequence is written to the checkpoint.
pub const DEFAULT_CHECKPOINT_SAVE_DELAY: Duration = Duration::from_secs(2);
/// Default delay before a continuous replication retries after errors.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Configuration for a single replication.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Remote database URL, possibly carrying credential query parameters.
    pub remote_url: String,
    /// Push or pull.
    pub direction: Direction,
    /// Whether the replication keeps running once caught up.
    pub continuous: bool,
    /// Whether the remote database should be created if missing.
    pub create_target: bool,
    /// Maximum number of revisions per inbox batch.
    pub inbox_capacity: usize,
    /// Maximum time revisions wait in the inbox before processing.
    pub processor_delay: Duration,
    /// Delay used to coalesce checkpoint writes.
    pub checkpoint_save_delay: Duration,
    /// Delay before a continuous replication retries after errors.
    pub retry_delay: Duration,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
}

impl ReplicationConfig {
    /// Creates a new replication configuration.
    pub fn new(remote_url: impl Into<String>, direction: Direction) -> Self {
        Self {
            remote_url: remote_url.into(),
            direction,
            continuous: false,
            create_target: false,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            processor_delay: DEFAULT_PROCESSOR_DELAY,
            checkpoint_save_delay: DEFAULT_CHECKPOINT_SAVE_DELAY,
            retry_delay: DEFAULT_RETRY_DELAY,
            headers: Vec::new(),
        }
    }

    /// Creates a push configuration.
    pub fn push(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url, Direction::Push)
    }

    /// Creates a pull configuration.
    pub fn pull(remote_url: impl Into<String>) -> Self {
        Self::new(remote_url, Direction::Pull)
    }

    /// Sets whether the replication is continuous.
    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Sets whether the remote database should be created.
    pub fn with_create_target(mut self, create_target: bool) -> Self {
        self.create_target = create_target;
        self
    }

    /// Sets the inbox batch capacity. Zero is treated as one.
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }

    /// Sets the inbox coalescing window.
    pub fn with_processor_delay(mut self, delay: Duration) -> Self {
        self.processor_delay = delay;
        self
    }

    /// Sets the checkpoint save delay.
    pub fn with_checkpoint_save_delay(mut self, delay: Duration) -> Self {
        self.checkpoint_save_delay = delay;
        self
    }

    /// Sets the retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Adds a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}
