//! Subscriber types for the reactive system.
//!
//! A subscriber is any callback attached to a signal or to a Pub/Sub event.
//! Every subscriber gets a [`SubscriberId`] so it can be removed again without
//! comparing closures, and signal subscriptions hand back a [`Subscription`]
//! handle that performs the removal.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::panic_message;

/// Unique identifier for a subscriber.
///
/// IDs are process-unique, so a subscription on one signal can never be
/// mistaken for a subscription on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value, for logging.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Handle returned by `subscribe`.
///
/// Calling [`unsubscribe`](Subscription::unsubscribe) removes the callback.
/// Calling it again is a no-op. Dropping the handle does *not* unsubscribe:
/// a subscription lives until it is explicitly removed or its owner is
/// cleaned up.
pub struct Subscription {
    id: SubscriberId,
    active: AtomicBool,
    detach: Box<dyn Fn(SubscriberId) + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new<F>(id: SubscriberId, detach: F) -> Self
    where
        F: Fn(SubscriberId) + Send + Sync + 'static,
    {
        Self {
            id,
            active: AtomicBool::new(true),
            detach: Box::new(detach),
        }
    }

    /// The subscriber this handle controls.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Whether `unsubscribe` has not been called yet.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove the callback from its source. Idempotent.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            (self.detach)(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Run a user callback, catching and logging a panic instead of unwinding
/// into the caller.
///
/// Returns `true` if the callback completed normally.
pub(crate) fn invoke_isolated<F: FnOnce()>(
    origin: &str,
    subscriber: Option<SubscriberId>,
    f: F,
) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            tracing::error!(
                origin,
                subscriber = ?subscriber.map(|id| id.as_u64()),
                error = %panic_message(payload.as_ref()),
                "subscriber callback panicked; continuing with remaining subscribers"
            );
            false
        }
    }
}
