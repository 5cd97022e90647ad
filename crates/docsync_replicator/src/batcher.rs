//! Debounced batching of work items.
//!
//! A [`Batcher`] queues items until either `capacity` of them are waiting
//! or a delay elapses, then hands them to a processor callback in one
//! group. When the processor has been idle for at least `delay`, the next
//! item is flushed right away ("rush") instead of waiting out the window.
//!
//! Only one thread runs the processor at a time, so groups reach it in
//! queue order. The processor itself may call back into the batcher.

use crate::scheduler::{panic_message, Scheduler, TimerId};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

type Processor<T> = Box<dyn Fn(Vec<T>) + Send + Sync>;

/// Coalesces queued items into bounded groups for a processor callback.
///
/// Cloning a `Batcher` yields another handle to the same inbox.
pub struct Batcher<T: Send + 'static> {
    inner: Arc<BatcherInner<T>>,
}

impl<T: Send + 'static> Clone for Batcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct BatcherInner<T> {
    scheduler: Arc<dyn Scheduler>,
    capacity: usize,
    delay: Duration,
    processor: Processor<T>,
    state: Mutex<BatchState<T>>,
    processor_idle: Condvar,
}

struct BatchState<T> {
    inbox: VecDeque<T>,
    scheduled: Option<ScheduledFlush>,
    last_processed: Option<Instant>,
    generation: u64,
    /// Thread running the processor, and how deeply it has re-entered.
    processing: Option<(ThreadId, usize)>,
}

struct ScheduledFlush {
    id: TimerId,
    delay: Duration,
    generation: u64,
}

impl<T> BatchState<T> {
    fn take_batch(&mut self, capacity: usize) -> Vec<T> {
        let n = capacity.min(self.inbox.len());
        self.inbox.drain(..n).collect()
    }

    fn busy_elsewhere(&self) -> bool {
        let me = thread::current().id();
        self.processing.is_some_and(|(owner, _)| owner != me)
    }

    fn claim_processor(&mut self) {
        let depth = self.processing.map_or(0, |(_, depth)| depth);
        self.processing = Some((thread::current().id(), depth + 1));
    }
}

impl<T: Send + 'static> Batcher<T> {
    /// Creates a batcher.
    ///
    /// * `capacity` - queue size at which items are processed immediately
    /// * `delay` - longest time an item waits before being processed
    /// * `processor` - receives each group; runs without any batcher lock
    ///   held, so it may queue more items
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        capacity: usize,
        delay: Duration,
        processor: impl Fn(Vec<T>) + Send + Sync + 'static,
    ) -> Self {
        debug!(capacity, ?delay, "new batcher");
        Self {
            inner: Arc::new(BatcherInner {
                scheduler,
                capacity: capacity.max(1),
                delay,
                processor: Box::new(processor),
                state: Mutex::new(BatchState {
                    inbox: VecDeque::new(),
                    scheduled: None,
                    last_processed: None,
                    generation: 0,
                    processing: None,
                }),
                processor_idle: Condvar::new(),
            }),
        }
    }

    /// Maximum group size.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Adds items to the queue.
    ///
    /// If the queue reaches capacity, the first `capacity` items are
    /// processed before this returns and the rest are scheduled at once.
    pub fn queue_objects(&self, objects: Vec<T>) {
        if objects.is_empty() {
            return;
        }
        trace!(count = objects.len(), "queueing objects");

        let full_batch = {
            let mut state = self.inner.state.lock();
            state.inbox.extend(objects);
            if state.inbox.len() >= self.inner.capacity && !state.busy_elsewhere() {
                self.unschedule(&mut state);
                let batch = state.take_batch(self.inner.capacity);
                state.claim_processor();
                Some(batch)
            } else if state.inbox.len() >= self.inner.capacity {
                // Goes out as soon as the running group completes.
                self.schedule_with_delay(&mut state, Duration::ZERO);
                None
            } else {
                let delay = self.delay_to_use(&state);
                self.schedule_with_delay(&mut state, delay);
                None
            }
        };

        if let Some(batch) = full_batch {
            self.process(batch);
            let mut state = self.inner.state.lock();
            if !state.inbox.is_empty() {
                self.schedule_with_delay(&mut state, Duration::ZERO);
            }
        }
    }

    /// Adds one item to the queue.
    pub fn queue_object(&self, object: T) {
        self.queue_objects(vec![object]);
    }

    /// Cancels any pending timer and processes up to `capacity` queued
    /// items now. Anything left over is rescheduled.
    pub fn flush(&self) {
        let batch = {
            let mut state = self.lock_for_processing();
            self.unschedule(&mut state);
            let batch = state.take_batch(self.inner.capacity);
            if !batch.is_empty() {
                state.claim_processor();
            }
            batch
        };
        self.process_and_reschedule(batch);
    }

    /// Processes everything queued, however much there is. The inbox is
    /// empty when this returns.
    pub fn flush_all(&self) {
        loop {
            let batch: Vec<T> = {
                let mut state = self.lock_for_processing();
                self.unschedule(&mut state);
                let batch: Vec<T> = state.inbox.drain(..).collect();
                if !batch.is_empty() {
                    state.claim_processor();
                }
                batch
            };
            if batch.is_empty() {
                break;
            }
            debug!(count = batch.len(), "flushing all queued items");
            self.process(batch);
        }
    }

    /// Discards all queued items without processing them.
    pub fn clear(&self) {
        let discarded = {
            let mut state = self.inner.state.lock();
            self.unschedule(&mut state);
            std::mem::take(&mut state.inbox)
        };
        debug!(count = discarded.len(), "discarded queued items");
    }

    /// Number of items waiting to be processed.
    pub fn count(&self) -> usize {
        self.inner.state.lock().inbox.len()
    }

    /// Returns true if a flush timer is armed.
    pub fn is_scheduled(&self) -> bool {
        self.inner.state.lock().scheduled.is_some()
    }

    fn fire(&self, generation: u64) {
        let batch = {
            let mut state = self.lock_for_processing();
            match &state.scheduled {
                Some(flush) if flush.generation == generation => {}
                _ => return,
            }
            state.scheduled = None;
            let batch = state.take_batch(self.inner.capacity);
            if !batch.is_empty() {
                state.claim_processor();
            }
            batch
        };
        self.process_and_reschedule(batch);
    }

    fn process_and_reschedule(&self, batch: Vec<T>) {
        if batch.is_empty() {
            trace!("nothing to process");
            return;
        }
        self.process(batch);

        let mut state = self.inner.state.lock();
        if !state.inbox.is_empty() {
            let delay = self.delay_to_use(&state);
            self.schedule_with_delay(&mut state, delay);
        }
    }

    /// Runs the processor on a batch claimed with `claim_processor`.
    fn process(&self, batch: Vec<T>) {
        debug!(count = batch.len(), "invoking processor");
        let processor = &self.inner.processor;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| processor(batch))) {
            error!(panic = %panic_message(payload.as_ref()), "batch processor panicked");
        }

        let mut state = self.inner.state.lock();
        state.last_processed = Some(self.inner.scheduler.now());
        state.processing = match state.processing {
            Some((owner, depth)) if depth > 1 => Some((owner, depth - 1)),
            _ => None,
        };
        if state.processing.is_none() {
            self.inner.processor_idle.notify_all();
        }
    }

    /// Locks the state once no other thread is running the processor.
    fn lock_for_processing(&self) -> MutexGuard<'_, BatchState<T>> {
        let mut state = self.inner.state.lock();
        while state.busy_elsewhere() {
            self.inner.processor_idle.wait(&mut state);
        }
        state
    }

    /// Rush when the processor has been idle for a full window.
    fn delay_to_use(&self, state: &BatchState<T>) -> Duration {
        let now = self.inner.scheduler.now();
        match state.last_processed {
            Some(last) if now.saturating_duration_since(last) < self.inner.delay => {
                self.inner.delay
            }
            _ => Duration::ZERO,
        }
    }

    fn schedule_with_delay(&self, state: &mut BatchState<T>, delay: Duration) {
        if let Some(flush) = &state.scheduled {
            if delay >= flush.delay {
                trace!(?delay, scheduled = ?flush.delay, "flush already scheduled");
                return;
            }
            self.unschedule(state);
        }

        state.generation += 1;
        let generation = state.generation;
        let weak: Weak<BatcherInner<T>> = Arc::downgrade(&self.inner);
        let id = self.inner.scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Batcher { inner }.fire(generation);
                }
            }),
        );
        trace!(?delay, "scheduled flush");
        state.scheduled = Some(ScheduledFlush {
            id,
            delay,
            generation,
        });
    }

    fn unschedule(&self, state: &mut BatchState<T>) {
        if let Some(flush) = state.scheduled.take() {
            self.inner.scheduler.cancel(flush.id);
        }
    }
}
