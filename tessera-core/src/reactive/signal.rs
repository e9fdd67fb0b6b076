//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a single value and
//! notifies its subscribers whenever that value changes.
//!
//! # How Signals Work
//!
//! 1. `set`/`update` resolve the next value and compare it with the current
//!    one. Equal values are a no-op: nobody is notified.
//!
//! 2. A changed value is stored, the `updating` flag is raised, and every
//!    subscriber is invoked in subscription order.
//!
//! 3. The subscriber list is copied before iteration, so a callback may
//!    subscribe, unsubscribe or clean up without disturbing the loop.
//!
//! 4. While `updating` is raised, a re-entrant `set` on the *same* signal
//!    (typically from one of its own subscribers) is dropped.
//!
//! # Failure Isolation
//!
//! A panicking subscriber is caught and logged. The remaining subscribers
//! still run and the `updating` flag is always lowered afterwards.
//!
//! # Thread Safety
//!
//! Handles are `Clone + Send + Sync` and share one inner state behind an
//! `Arc`. No lock is held while a subscriber runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::fmt::Debug;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use super::subscriber::{invoke_isolated, SubscriberId, Subscription};

/// Counter for generating unique signal IDs.
static SIGNAL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique signal ID.
fn next_signal_id() -> u64 {
    SIGNAL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Values a signal can hold.
///
/// Equality drives change detection and `Clone` lets readers take the value
/// out without holding a lock.
pub trait SignalValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> SignalValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// Callback invoked with the new value after a change.
pub type SignalCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalInner<T> {
    value: RwLock<T>,
    /// Ordered by subscription time.
    subscribers: Mutex<IndexMap<SubscriberId, SignalCallback<T>>>,
    /// Re-entrancy guard, raised while subscribers are being notified.
    updating: AtomicBool,
}

/// Lowers the `updating` flag when notification ends, however it ends.
struct UpdatingGuard<'a>(&'a AtomicBool);

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A reactive signal holding a value of type T.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// let sub = count.subscribe(|v| println!("count is now {v}"));
/// count.set(5);           // prints "count is now 5"
/// count.set(5);           // equal value, nothing printed
/// count.update(|v| v + 1); // prints "count is now 6"
/// sub.unsubscribe();
/// ```
pub struct Signal<T>
where
    T: SignalValue,
{
    /// Unique identifier for this signal.
    id: u64,

    inner: Arc<SignalInner<T>>,
}

impl<T> Signal<T>
where
    T: SignalValue,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self {
        Self {
            id: next_signal_id(),
            inner: Arc::new(SignalInner {
                value: RwLock::new(value),
                subscribers: Mutex::new(IndexMap::new()),
                updating: AtomicBool::new(false),
            }),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get a clone of the current value. No side effects.
    pub fn get(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Read the current value through a closure without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.read())
    }

    /// Set a new value and notify subscribers.
    ///
    /// Returns `true` if the value changed and subscribers were notified.
    /// Returns `false` for an equal value or for a re-entrant call made while
    /// this signal is already notifying.
    pub fn set(&self, value: T) -> bool {
        if self.inner.updating.load(Ordering::Acquire) {
            tracing::trace!(signal = self.id, "dropping re-entrant update");
            return false;
        }

        {
            let mut guard = self.inner.value.write();
            if *guard == value {
                return false;
            }
            *guard = value.clone();
        }

        self.notify_subscribers(&value);
        true
    }

    /// Update the value using a function of the previous value.
    ///
    /// Same change-detection and re-entrancy rules as [`set`](Self::set).
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        if self.inner.updating.load(Ordering::Acquire) {
            tracing::trace!(signal = self.id, "dropping re-entrant update");
            return false;
        }

        let new_value = {
            let guard = self.inner.value.read();
            f(&guard)
        };
        self.set(new_value)
    }

    /// Register a callback invoked with the new value after each change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriberId::new();
        self.inner
            .subscribers
            .lock()
            .insert(id, Arc::new(callback));

        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(id, move |id| {
            if let Some(inner) = weak.upgrade() {
                // Dropped after the lock is released: a callback may own a
                // computed signal whose teardown detaches elsewhere.
                let removed = inner.subscribers.lock().shift_remove(&id);
                drop(removed);
            }
        })
    }

    /// Remove every subscriber. Used at teardown.
    pub fn cleanup(&self) {
        let subscribers = std::mem::take(&mut *self.inner.subscribers.lock());
        let removed = subscribers.len();
        drop(subscribers);
        tracing::trace!(signal = self.id, removed, "signal cleaned up");
    }

    /// Get the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Whether subscribers are currently being notified.
    pub fn is_updating(&self) -> bool {
        self.inner.updating.load(Ordering::Acquire)
    }

    /// Whether two handles point at the same signal.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Notify all subscribers that the value has changed.
    fn notify_subscribers(&self, value: &T) {
        self.inner.updating.store(true, Ordering::Release);
        let _guard = UpdatingGuard(&self.inner.updating);

        // Iterate a copy: callbacks may mutate the live set.
        let callbacks: Vec<(SubscriberId, SignalCallback<T>)> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();

        for (id, callback) in callbacks {
            invoke_isolated("signal", Some(id), || callback(value));
        }
    }
}

impl<T> Clone for Signal<T>
where
    T: SignalValue,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: SignalValue + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("value", &*self.inner.value.read())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Something a computed signal can depend on.
///
/// Implemented by [`Signal`] for every value type, so a computed signal can
/// depend on signals of different types at once.
pub trait Dependency: Send + Sync {
    /// ID of the underlying signal.
    fn signal_id(&self) -> u64;

    /// Invoke `on_change` after every change of the dependency's value.
    fn watch(&self, on_change: Box<dyn Fn() + Send + Sync>) -> Subscription;
}

impl<T> Dependency for Signal<T>
where
    T: SignalValue,
{
    fn signal_id(&self) -> u64 {
        self.id
    }

    fn watch(&self, on_change: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.subscribe(move |_| on_change())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn signal_get_and_set() {
        let signal = Signal::new(0);
        assert_eq!(signal.get(), 0);

        assert!(signal.set(42));
        assert_eq!(signal.get(), 42);
    }

    #[test]
    fn signal_update() {
        let signal = Signal::new(10);
        signal.update(|v| v + 5);
        assert_eq!(signal.get(), 15);
    }

    #[test]
    fn signal_notifies_subscribers_with_new_value() {
        let signal = Signal::new(0);
        let seen = Arc::new(AtomicI32::new(-1));
        let seen_clone = seen.clone();

        let _sub = signal.subscribe(move |v| {
            seen_clone.store(*v, Ordering::SeqCst);
        });

        signal.set(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn equal_value_does_not_notify() {
        let signal = Signal::new(String::from("a"));
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let _sub = signal.subscribe(move |_| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!signal.set(String::from("a")));
        assert_eq!(call_count.load(Ordering::SeqCst), 0);

        assert!(signal.set(String::from("b")));
        assert!(!signal.set(String::from("b")));
        assert!(!signal.update(|v| v.clone()));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn signal_unsubscribe() {
        let signal = Signal::new(0);
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let sub = signal.subscribe(move |_| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.set(1);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        signal.set(2);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn subscribers_fire_in_subscription_order() {
        let signal = Signal::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut subs = Vec::new();
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            subs.push(signal.subscribe(move |_| order.lock().push(tag)));
        }

        signal.set(1);
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn reentrant_update_on_same_signal_is_dropped() {
        let signal = Signal::new(0);
        let inner_signal = signal.clone();
        let inner_result = Arc::new(AtomicBool::new(true));
        let inner_result_clone = inner_result.clone();

        let _sub = signal.subscribe(move |v| {
            let accepted = inner_signal.set(v + 100);
            inner_result_clone.store(accepted, Ordering::SeqCst);
        });

        signal.set(1);
        assert!(!inner_result.load(Ordering::SeqCst));
        assert_eq!(signal.get(), 1);
        assert!(!signal.is_updating());
    }

    #[test]
    fn panicking_subscriber_does_not_stop_others() {
        let signal = Signal::new(0);
        let call_count = Arc::new(AtomicI32::new(0));

        let _bad = signal.subscribe(|_| panic!("subscriber failure"));
        let call_count_clone = call_count.clone();
        let _good = signal.subscribe(move |_| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(signal.set(1));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert!(!signal.is_updating());

        // The flag was lowered, so later updates still go through.
        assert!(signal.set(2));
        assert_eq!(call_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribing_another_subscriber_mid_notification_is_safe() {
        let signal = Signal::new(0);
        let call_count = Arc::new(AtomicI32::new(0));

        let victim_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot = victim_slot.clone();
        let _killer = signal.subscribe(move |_| {
            if let Some(sub) = slot.lock().as_ref() {
                sub.unsubscribe();
            }
        });

        let call_count_clone = call_count.clone();
        let victim = signal.subscribe(move |_| {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
        });
        *victim_slot.lock() = Some(victim);

        // The copy taken before iteration still includes the victim.
        signal.set(1);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);

        signal.set(2);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_removes_all_subscribers() {
        let signal = Signal::new(0);
        let _a = signal.subscribe(|_| {});
        let _b = signal.subscribe(|_| {});
        assert_eq!(signal.subscriber_count(), 2);

        signal.cleanup();
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn signal_clone_shares_state() {
        let signal1 = Signal::new(0);
        let signal2 = signal1.clone();

        signal1.set(42);
        assert_eq!(signal2.get(), 42);
        assert!(signal1.ptr_eq(&signal2));
    }

    #[test]
    fn signal_ids_are_unique() {
        let s1 = Signal::new(0);
        let s2 = Signal::new(0);

        assert_ne!(s1.id(), s2.id());
    }
}
