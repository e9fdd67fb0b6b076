//! Computed Signal Implementation
//!
//! A computed signal is a signal whose value is a pure function of other
//! signals.
//!
//! # How Computed Signals Work
//!
//! 1. On creation, `compute()` runs once to seed the value.
//!
//! 2. The computed signal subscribes to every declared dependency.
//!
//! 3. When a dependency changes, `compute()` runs again *synchronously*, inside
//!    the dependency's notification, and the result is written with the normal
//!    `set` path. Subscribers of the computed signal (including other computed
//!    signals) therefore see the new value before the original `set` returns.
//!
//! Unlike a lazy memo there is no dirty state to observe: the value always
//! equals `compute()` over the current dependency values.
//!
//! # Failure Modes
//!
//! - **Compute panics at creation**: there is no value to seed with, so
//!   creation fails with [`StateError::Compute`].
//! - **Compute panics later**: the panic is caught and logged, and the
//!   computed signal keeps its last good value.
//!
//! # Teardown
//!
//! [`ComputedSignal::destroy`] unsubscribes from every dependency *before*
//! clearing its own subscribers, so a dependency change can never fire into
//! a half-torn-down computed signal.
//!
//! Dropping the last handle also detaches from every dependency. The
//! dependencies only hold the recompute closure, never the computed state
//! itself, so an abandoned computed signal stops recomputing.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::fmt::Debug;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::signal::{Dependency, Signal, SignalValue};
use super::subscriber::Subscription;
use crate::error::{panic_message, Result, StateError};

type ComputeFn<T> = Arc<dyn Fn() -> T + Send + Sync>;
type RecomputeFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ComputedStats {
    recomputes: AtomicU64,
    failures: AtomicU64,
}

struct ComputedInner {
    /// IDs of the dependencies, in declaration order.
    dependency_ids: SmallVec<[u64; 4]>,
    /// One subscription per dependency.
    dependency_subscriptions: Mutex<SmallVec<[Subscription; 4]>>,
    recompute: RecomputeFn,
    stats: Arc<ComputedStats>,
    destroyed: AtomicBool,
}

impl Drop for ComputedInner {
    fn drop(&mut self) {
        for subscription in self.dependency_subscriptions.get_mut().drain(..) {
            subscription.unsubscribe();
        }
    }
}

/// A signal derived from other signals.
///
/// Cloning a `ComputedSignal` creates a new handle to the **same** state.
///
/// # Example
///
/// ```rust,ignore
/// let price = Signal::new(100);
/// let qty = Signal::new(2);
///
/// let (p, q) = (price.clone(), qty.clone());
/// let subtotal = ComputedSignal::new(move || p.get() * q.get(), &[&price, &qty])?;
///
/// price.set(150);
/// assert_eq!(subtotal.get(), 300);
/// ```
pub struct ComputedSignal<T>
where
    T: SignalValue,
{
    signal: Signal<T>,
    inner: Arc<ComputedInner>,
}

impl<T> ComputedSignal<T>
where
    T: SignalValue,
{
    /// Create a computed signal over the given dependencies.
    ///
    /// The computation runs immediately to seed the value.
    pub fn new<F>(compute: F, dependencies: &[&dyn Dependency]) -> Result<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let compute: ComputeFn<T> = Arc::new(compute);

        let seed = catch_unwind(AssertUnwindSafe(|| compute())).map_err(|payload| {
            StateError::Compute {
                message: panic_message(payload.as_ref()),
            }
        })?;

        let signal = Signal::new(seed);
        let stats = Arc::new(ComputedStats::default());

        let recompute: RecomputeFn = {
            let compute = Arc::clone(&compute);
            let signal = signal.clone();
            let stats = Arc::clone(&stats);
            Arc::new(move || {
                match catch_unwind(AssertUnwindSafe(|| compute())) {
                    Ok(value) => {
                        stats.recomputes.fetch_add(1, Ordering::Relaxed);
                        signal.set(value);
                    }
                    Err(payload) => {
                        stats.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            signal = signal.id(),
                            error = %panic_message(payload.as_ref()),
                            "compute function panicked; keeping last good value"
                        );
                    }
                }
            })
        };

        let mut dependency_ids = SmallVec::new();
        let mut dependency_subscriptions = SmallVec::new();
        for dependency in dependencies {
            dependency_ids.push(dependency.signal_id());
            let recompute = Arc::clone(&recompute);
            dependency_subscriptions.push(dependency.watch(Box::new(move || recompute())));
        }

        tracing::trace!(
            signal = signal.id(),
            dependencies = dependency_ids.len(),
            "computed signal created"
        );

        Ok(Self {
            signal,
            inner: Arc::new(ComputedInner {
                dependency_ids,
                dependency_subscriptions: Mutex::new(dependency_subscriptions),
                recompute,
                stats,
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// ID of the underlying signal.
    pub fn id(&self) -> u64 {
        self.signal.id()
    }

    /// Get the current computed value.
    pub fn get(&self) -> T {
        self.signal.get()
    }

    /// Read the computed value through a closure.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.signal.with(f)
    }

    /// Subscribe to changes in the computed value.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.signal.subscribe(callback)
    }

    /// The underlying signal, for code that only needs the signal surface.
    pub fn signal(&self) -> &Signal<T> {
        &self.signal
    }

    /// IDs of the declared dependencies.
    pub fn dependency_ids(&self) -> &[u64] {
        &self.inner.dependency_ids
    }

    /// Number of dependency subscriptions still attached.
    pub fn dependency_count(&self) -> usize {
        self.inner.dependency_subscriptions.lock().len()
    }

    /// Number of successful recomputations since creation (the seed excluded).
    pub fn recompute_count(&self) -> u64 {
        self.inner.stats.recomputes.load(Ordering::Relaxed)
    }

    /// Number of recomputations that panicked.
    pub fn failure_count(&self) -> u64 {
        self.inner.stats.failures.load(Ordering::Relaxed)
    }

    /// Whether [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Detach from all dependencies, then clear own subscribers.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let subscriptions: SmallVec<[Subscription; 4]> =
            self.inner.dependency_subscriptions.lock().drain(..).collect();
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }

        self.signal.cleanup();
        tracing::trace!(signal = self.signal.id(), "computed signal destroyed");
    }

    /// Re-run `compute()` against the current dependency values. Used by
    /// state restore, where the formula may have changed since capture.
    pub(crate) fn recompute(&self) {
        if self.is_destroyed() {
            return;
        }
        (self.inner.recompute)();
    }
}

impl<T> Clone for ComputedSignal<T>
where
    T: SignalValue,
{
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Dependency for ComputedSignal<T>
where
    T: SignalValue,
{
    fn signal_id(&self) -> u64 {
        self.signal.id()
    }

    fn watch(&self, on_change: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.signal.watch(on_change)
    }
}

impl<T> Debug for ComputedSignal<T>
where
    T: SignalValue + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedSignal")
            .field("id", &self.id())
            .field("value", &self.get())
            .field("dependencies", &self.inner.dependency_ids)
            .field("recompute_count", &self.recompute_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
