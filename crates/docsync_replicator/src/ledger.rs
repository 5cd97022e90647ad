//! Accounting of outstanding asynchronous work.
//!
//! The ledger is the only source of truth for "is anything still in
//! flight". A replication that is not continuous finishes stopping when the
//! ledger drains to zero.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::trace;

type DrainHook = Box<dyn Fn() + Send + Sync>;

/// Concurrency-safe counter of in-flight asynchronous operations.
pub struct TaskLedger {
    count: AtomicI64,
    on_drained: Option<DrainHook>,
}

impl TaskLedger {
    /// Creates a ledger with no drain hook.
    pub fn new() -> Self {
        Self {
            count: AtomicI64::new(0),
            on_drained: None,
        }
    }

    /// Creates a ledger that calls `hook` each time the count returns to zero.
    pub fn with_drain_hook(hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            count: AtomicI64::new(0),
            on_drained: Some(Box::new(hook)),
        }
    }

    /// Records the start of an operation. Returns true if the ledger was
    /// idle before this call.
    pub fn task_started(&self) -> bool {
        let previous = self.count.fetch_add(1, Ordering::SeqCst);
        trace!(count = previous + 1, "async task started");
        previous == 0
    }

    /// Records the end of `n` operations. Returns true if this call brought
    /// the count to zero, in which case the drain hook has run.
    pub fn task_finished(&self, n: i64) -> bool {
        let previous = self.count.fetch_sub(n, Ordering::SeqCst);
        let now = previous - n;
        trace!(count = now, "async task finished");
        debug_assert!(now >= 0, "task ledger went negative: {now}");

        if now == 0 && previous != 0 {
            if let Some(hook) = &self.on_drained {
                hook();
            }
            true
        } else {
            false
        }
    }

    /// Current number of outstanding operations.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Starts an operation whose end is recorded when the guard drops.
    pub fn begin(self: &Arc<Self>) -> TaskGuard {
        self.task_started();
        TaskGuard {
            ledger: Some(Arc::clone(self)),
        }
    }
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one outstanding operation; finishing it exactly once is tied to
/// the guard's lifetime, whichever path drops it.
#[must_use = "dropping the guard finishes the task immediately"]
pub struct TaskGuard {
    ledger: Option<Arc<TaskLedger>>,
}

impl TaskGuard {
    /// Finishes the task now.
    pub fn finish(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(ledger) = self.ledger.take() {
            ledger.task_finished(1);
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.release();
    }
}
