//! Batched Updates
//!
//! Updates issued through `SignalManager::schedule_batched_update` are
//! coalesced per tick:
//!
//! 1. The first thunk scheduled in a tick asks the [`TickScheduler`] to run a
//!    flush at the end of the tick.
//! 2. Further thunks in the same tick only join the pending list.
//! 3. The flush takes the whole list, runs each thunk once in scheduling
//!    order, and logs (but survives) a panicking thunk.
//!
//! What "end of tick" means is up to the scheduler. [`ManualTick`] leaves it
//! to the host, which calls `run_pending` once per frame or event-loop turn.
//! [`TokioTick`] spawns the flush onto a tokio runtime so it runs once the
//! current task yields.
//!
//! Cancellation uses a generation counter: `cancel` bumps the generation and
//! a flush captured under an older generation runs as a no-op.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::subscriber::invoke_isolated;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Decides when a deferred flush runs.
pub trait TickScheduler: Send + Sync {
    /// Run `task` once, after the current tick completes.
    fn defer(&self, task: Task);

    /// Run everything deferred so far. Schedulers that drive themselves
    /// return 0.
    fn run_pending(&self) -> usize {
        0
    }
}

/// A scheduler whose ticks are ended explicitly by the host.
#[derive(Default)]
pub struct ManualTick {
    queue: Mutex<VecDeque<Task>>,
}

impl ManualTick {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deferred tasks waiting for the end of the tick.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl TickScheduler for ManualTick {
    fn defer(&self, task: Task) {
        self.queue.lock().push_back(task);
    }

    fn run_pending(&self) -> usize {
        let mut ran = 0;
        // Tasks deferred while running belong to this tick too.
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }
}

/// A scheduler backed by a tokio runtime.
pub struct TokioTick {
    handle: tokio::runtime::Handle,
}

impl TokioTick {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context, if there is one.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl TickScheduler for TokioTick {
    fn defer(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }
}

/// Pending batched thunks plus the flags that coalesce their flush.
#[derive(Default)]
pub(crate) struct BatchQueue {
    pending: Mutex<Vec<Task>>,
    flush_scheduled: AtomicBool,
    generation: AtomicU64,
    batching: AtomicBool,
}

/// Lowers the `batching` flag when the outermost batch ends.
struct BatchingGuard<'a>(&'a AtomicBool);

impl Drop for BatchingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BatchQueue {
    pub(crate) fn is_batching(&self) -> bool {
        self.batching.load(Ordering::Acquire)
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn is_flush_scheduled(&self) -> bool {
        self.flush_scheduled.load(Ordering::Acquire)
    }

    /// Run `f` synchronously as a batch. Nested batches run inline. Thunks
    /// scheduled inside it wait for the tick's single flush like any other.
    pub(crate) fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.batching.swap(true, Ordering::AcqRel) {
            return f();
        }

        let _guard = BatchingGuard(&self.batching);
        f()
    }

    /// Add a thunk; request a flush if this is the first one of the tick.
    pub(crate) fn schedule(self: &Arc<Self>, task: Task, scheduler: &dyn TickScheduler) {
        self.pending.lock().push(task);

        if self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let generation = self.generation.load(Ordering::Acquire);
        let weak: Weak<BatchQueue> = Arc::downgrade(self);
        scheduler.defer(Box::new(move || {
            if let Some(queue) = weak.upgrade() {
                if queue.generation.load(Ordering::Acquire) == generation {
                    queue.flush();
                } else {
                    tracing::trace!(generation, "skipping cancelled batch flush");
                }
            }
        }));
    }

    /// Run every pending thunk once, in scheduling order.
    pub(crate) fn flush(&self) -> usize {
        self.flush_scheduled.store(false, Ordering::Release);
        let tasks = std::mem::take(&mut *self.pending.lock());
        let total = tasks.len();

        let mut failed = 0;
        for task in tasks {
            if !invoke_isolated("batch", None, task) {
                failed += 1;
            }
        }

        if total > 0 {
            tracing::debug!(total, failed, "flushed batched updates");
        }
        total
    }

    /// Drop pending thunks and invalidate any flush already requested.
    pub(crate) fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.flush_scheduled.store(false, Ordering::Release);
        let dropped = std::mem::take(&mut *self.pending.lock()).len();
        if dropped > 0 {
            tracing::debug!(dropped, "cancelled pending batched updates");
        }
    }
}
