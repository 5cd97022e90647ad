//! Single-threaded work scheduling.
//!
//! Every replication state mutation, batch timer and deferred checkpoint
//! save runs as a job on a [`Scheduler`]. Jobs run one at a time, ordered
//! by deadline and, for equal deadlines, by submission order.
//!
//! Two implementations are provided:
//! - [`ThreadScheduler`] runs jobs on a dedicated worker thread against the
//!   wall clock.
//! - [`ManualScheduler`] runs jobs only when driven, against a virtual
//!   clock, which makes timer-dependent behaviour testable without sleeps.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// A unit of work submitted to a scheduler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled job, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// A single-threaded, FIFO, delay-capable work executor.
pub trait Scheduler: Send + Sync {
    /// Current time as seen by this scheduler.
    fn now(&self) -> Instant;

    /// Runs `job` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, job: Job) -> TimerId;

    /// Cancels a job that has not started yet. Returns true if it was pending.
    fn cancel(&self, id: TimerId) -> bool;

    /// Runs `job` as soon as possible, after everything already due.
    fn post(&self, job: Job) -> TimerId {
        self.schedule(Duration::ZERO, job)
    }
}

/// Pending jobs ordered by (deadline, submission order).
#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    jobs: HashMap<u64, Job>,
    next_id: u64,
}

impl TimerQueue {
    fn push(&mut self, deadline: Instant, job: Job) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.jobs.insert(id, job);
        TimerId(id)
    }

    /// Removes a job. The caller must drop it after releasing any lock,
    /// since a job's captures may call back into the scheduler on drop.
    fn remove(&mut self, id: TimerId) -> Option<Job> {
        self.jobs.remove(&id.0)
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek() {
            if self.jobs.contains_key(id) {
                return Some(*deadline);
            }
            self.heap.pop();
        }
        None
    }

    fn pop_due(&mut self, now: Instant) -> Option<Job> {
        loop {
            let Reverse((deadline, id)) = *self.heap.peek()?;
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if let Some(job) = self.jobs.remove(&id) {
                return Some(job);
            }
        }
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_job(job: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        error!(panic = %panic_message(payload.as_ref()), "scheduled job panicked");
    }
}

struct Shared {
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

/// A scheduler backed by one dedicated worker thread.
pub struct ThreadScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl ThreadScheduler {
    /// Spawns the worker thread.
    pub fn new(name: impl Into<String>) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(TimerQueue::default()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || worker_loop(&worker_shared))?;
        let worker_id = handle.thread().id();

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

fn worker_loop(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        if let Some(job) = queue.pop_due(Instant::now()) {
            MutexGuard::unlocked(&mut queue, || run_job(job));
            continue;
        }

        match queue.next_deadline() {
            Some(deadline) => {
                shared.wakeup.wait_until(&mut queue, deadline);
            }
            None => shared.wakeup.wait(&mut queue),
        }
    }
    trace!("scheduler worker exiting");
}

impl Scheduler for ThreadScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn schedule(&self, delay: Duration, job: Job) -> TimerId {
        let id = self.shared.queue.lock().push(Instant::now() + delay, job);
        self.shared.wakeup.notify_one();
        id
    }

    fn cancel(&self, id: TimerId) -> bool {
        let removed = self.shared.queue.lock().remove(id);
        removed.is_some()
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("scheduler worker panicked");
            }
        }
    }
}

struct ManualState {
    elapsed: Duration,
    queue: TimerQueue,
}

/// A scheduler driven explicitly by the caller against a virtual clock.
///
/// Nothing runs until [`run_until_idle`](Self::run_until_idle) or
/// [`advance`](Self::advance) is called, on the calling thread.
pub struct ManualScheduler {
    origin: Instant,
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    /// Creates a scheduler whose virtual clock starts now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new(ManualState {
                elapsed: Duration::ZERO,
                queue: TimerQueue::default(),
            }),
        }
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Runs every job that is due, including jobs they schedule with no
    /// delay. Returns the number of jobs run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = {
                let mut state = self.state.lock();
                let now = self.origin + state.elapsed;
                state.queue.pop_due(now)
            };
            match job {
                Some(job) => {
                    run_job(job);
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Moves the virtual clock forward, running timers in deadline order as
    /// their time comes. Returns the number of jobs run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.origin + self.elapsed() + by;
        let mut ran = self.run_until_idle();
        loop {
            {
                let mut state = self.state.lock();
                match state.queue.next_deadline() {
                    Some(deadline) if deadline <= target => {
                        let at = deadline.duration_since(self.origin);
                        state.elapsed = state.elapsed.max(at);
                    }
                    _ => break,
                }
            }
            ran += self.run_until_idle();
        }
        self.state.lock().elapsed = target.duration_since(self.origin);
        ran + self.run_until_idle()
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().elapsed
    }

    fn schedule(&self, delay: Duration, job: Job) -> TimerId {
        let mut state = self.state.lock();
        let deadline = self.origin + state.elapsed + delay;
        state.queue.push(deadline, job)
    }

    fn cancel(&self, id: TimerId) -> bool {
        let removed = self.state.lock().queue.remove(id);
        removed.is_some()
    }
}
