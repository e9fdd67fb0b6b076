//! Signal Manager
//!
//! The manager is the keyed registry that lets independently compiled
//! components find the same signal by name. It also owns the batched-update
//! queue and creates computed signals.
//!
//! # Registry Rules
//!
//! - A key maps to exactly one signal. A second `create_signal` under the
//!   same key logs a warning and returns the original handle with its value
//!   untouched (first writer wins).
//! - Entries are type-erased so one registry can hold signals of any
//!   [`StateValue`] type. Asking for a key under the wrong type is reported,
//!   never silently coerced.
//! - A key restored from a snapshot before its owner re-registered is held as
//!   a *hydrated* JSON value. The first typed access materialises it into a
//!   real signal seeded with the restored value.
//!
//! # Locking
//!
//! The registry is a `DashMap`. Shard locks are never held while user code
//! (subscribers, compute functions, thunks) runs.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::batch::{BatchQueue, ManualTick, TickScheduler};
use super::computed::ComputedSignal;
use super::signal::{Dependency, Signal, SignalValue};
use crate::error::{panic_message, Result, StateError};

/// Values that can live in a [`SignalManager`].
///
/// On top of [`SignalValue`], registered values must round-trip through
/// serde: that is how a snapshot deep-copies them.
pub trait StateValue: SignalValue + Serialize + DeserializeOwned {}

impl<T> StateValue for T where T: SignalValue + Serialize + DeserializeOwned {}

/// Type-erased view of a registered signal.
trait RegistryEntry: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn type_name(&self) -> &'static str;
    fn capture(&self) -> std::result::Result<serde_json::Value, serde_json::Error>;
    fn restore(
        &self,
        value: serde_json::Value,
    ) -> std::result::Result<RestoreOutcome, serde_json::Error>;
    fn cleanup(&self);
}

struct SignalEntry<T: StateValue>(Signal<T>);

impl<T: StateValue> RegistryEntry for SignalEntry<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn capture(&self) -> std::result::Result<serde_json::Value, serde_json::Error> {
        self.0.with(|value| serde_json::to_value(value))
    }

    fn restore(
        &self,
        value: serde_json::Value,
    ) -> std::result::Result<RestoreOutcome, serde_json::Error> {
        let value: T = serde_json::from_value(value)?;
        self.0.set(value);
        Ok(RestoreOutcome::Overwritten)
    }

    fn cleanup(&self) {
        self.0.cleanup();
    }
}

struct ComputedEntry<T: StateValue>(ComputedSignal<T>);

impl<T: StateValue> RegistryEntry for ComputedEntry<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn capture(&self) -> std::result::Result<serde_json::Value, serde_json::Error> {
        self.0.with(|value| serde_json::to_value(value))
    }

    /// The captured value is ignored: the reloaded formula may differ, so the
    /// value is re-derived from the (already restored) inputs instead.
    fn restore(
        &self,
        _captured: serde_json::Value,
    ) -> std::result::Result<RestoreOutcome, serde_json::Error> {
        self.0.recompute();
        Ok(RestoreOutcome::Recomputed)
    }

    fn cleanup(&self) {
        self.0.destroy();
    }
}

#[derive(Clone)]
enum Slot {
    Live(Arc<dyn RegistryEntry>),
    Hydrated(serde_json::Value),
}

/// Result of writing a captured value into a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// A registered signal was overwritten.
    Overwritten,
    /// A registered computed signal was re-derived from its inputs.
    Recomputed,
    /// No signal was registered; the value waits for its first typed access.
    Hydrated,
}

/// Keyed registry of signals and computed signals, plus batching.
pub struct SignalManager {
    registry: DashMap<String, Slot>,
    batch: Arc<BatchQueue>,
    scheduler: Arc<dyn TickScheduler>,
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalManager {
    /// Create a manager whose ticks are ended by [`end_tick`](Self::end_tick).
    pub fn new() -> Self {
        Self::with_scheduler(Arc::new(ManualTick::new()))
    }

    /// Create a manager that defers batch flushes through `scheduler`.
    pub fn with_scheduler(scheduler: Arc<dyn TickScheduler>) -> Self {
        Self {
            registry: DashMap::new(),
            batch: Arc::new(BatchQueue::default()),
            scheduler,
        }
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Create a signal, registering it under `key` if one is given.
    ///
    /// An existing key returns the existing signal unchanged. The only error
    /// is [`StateError::TypeMismatch`] when that signal holds another type.
    pub fn create_signal<T: StateValue>(
        &self,
        initial: T,
        key: Option<&str>,
    ) -> Result<Signal<T>> {
        let Some(key) = key else {
            return Ok(Signal::new(initial));
        };

        // A restored value is deserialized before taking the shard lock.
        let restored = match self.registry.get(key).map(|slot| slot.value().clone()) {
            Some(Slot::Hydrated(value)) => decode_restored::<T>(key, value),
            _ => None,
        };

        match self.registry.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                let signal = Signal::new(restored.unwrap_or(initial));
                vacant.insert(Slot::Live(Arc::new(SignalEntry(signal.clone()))));
                tracing::trace!(key, signal = signal.id(), "signal registered");
                Ok(signal)
            }
            Entry::Occupied(mut occupied) => match occupied.get().clone() {
                Slot::Live(entry) => {
                    let signal = downcast_signal::<T>(key, entry.as_ref())?;
                    tracing::warn!(key, "signal already registered; returning existing instance");
                    Ok(signal)
                }
                Slot::Hydrated(_) => {
                    let signal = Signal::new(restored.unwrap_or(initial));
                    occupied.insert(Slot::Live(Arc::new(SignalEntry(signal.clone()))));
                    tracing::debug!(key, "signal registered from restored value");
                    Ok(signal)
                }
            },
        }
    }

    /// Look up a keyed signal.
    ///
    /// Returns `None` for an unknown key, a computed entry, or a type
    /// mismatch (the latter is logged).
    pub fn get_signal<T: StateValue>(&self, key: &str) -> Option<Signal<T>> {
        let slot = self.registry.get(key).map(|slot| slot.value().clone())?;
        let hydrated = match slot {
            Slot::Live(entry) => {
                return match entry.as_any().downcast_ref::<SignalEntry<T>>() {
                    Some(SignalEntry(signal)) => Some(signal.clone()),
                    None => {
                        tracing::warn!(
                            key,
                            found = entry.type_name(),
                            expected = std::any::type_name::<T>(),
                            "signal lookup with mismatched type"
                        );
                        None
                    }
                };
            }
            Slot::Hydrated(value) => value,
        };

        // Deserializing runs user code, so no shard lock is held here.
        let seed = match serde_json::from_value::<T>(hydrated) {
            Ok(seed) => seed,
            Err(err) => {
                tracing::warn!(key, error = %err, "restored value does not fit requested type");
                return None;
            }
        };

        match self.registry.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get().clone() {
                Slot::Hydrated(_) => {
                    let signal = Signal::new(seed);
                    occupied.insert(Slot::Live(Arc::new(SignalEntry(signal.clone()))));
                    tracing::debug!(key, "materialised restored signal");
                    Some(signal)
                }
                // Someone registered the key in the meantime.
                Slot::Live(entry) => downcast_signal::<T>(key, entry.as_ref()).ok(),
            },
            Entry::Vacant(_) => None,
        }
    }

    /// Look up a keyed computed signal.
    pub fn get_computed<T: StateValue>(&self, key: &str) -> Option<ComputedSignal<T>> {
        let slot = self.registry.get(key)?;
        match &*slot {
            Slot::Live(entry) => entry
                .as_any()
                .downcast_ref::<ComputedEntry<T>>()
                .map(|ComputedEntry(computed)| computed.clone()),
            Slot::Hydrated(_) => None,
        }
    }

    /// Create a computed signal over `dependencies`, optionally keyed.
    ///
    /// Keyed creation follows the same first-writer-wins rule as
    /// [`create_signal`](Self::create_signal). A hydrated value under the key
    /// is discarded: a computed value is re-derived, not restored.
    pub fn create_computed<T, F>(
        &self,
        compute: F,
        dependencies: &[&dyn Dependency],
        key: Option<&str>,
    ) -> Result<ComputedSignal<T>>
    where
        T: StateValue,
        F: Fn() -> T + Send + Sync + 'static,
    {
        if let Some(key) = key {
            if let Some(existing) = self.existing_computed::<T>(key)? {
                return Ok(existing);
            }
        }

        // Seeding runs user code, so build outside any shard lock.
        let computed = ComputedSignal::new(compute, dependencies)?;

        let Some(key) = key else {
            return Ok(computed);
        };

        match self.registry.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let Slot::Live(entry) = occupied.get().clone() {
                    // Lost a race with another registration.
                    computed.destroy();
                    return downcast_computed::<T>(key, entry.as_ref());
                }
                occupied.insert(Slot::Live(Arc::new(ComputedEntry(computed.clone()))));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Live(Arc::new(ComputedEntry(computed.clone()))));
            }
        }
        tracing::trace!(key, signal = computed.id(), "computed signal registered");
        Ok(computed)
    }

    fn existing_computed<T: StateValue>(&self, key: &str) -> Result<Option<ComputedSignal<T>>> {
        let entry = match self.registry.get(key).map(|slot| slot.value().clone()) {
            Some(Slot::Live(entry)) => entry,
            _ => return Ok(None),
        };
        let computed = downcast_computed::<T>(key, entry.as_ref())?;
        tracing::warn!(key, "computed signal already registered; returning existing instance");
        Ok(Some(computed))
    }

    /// Clean up and unregister a keyed signal. Returns whether it existed.
    pub fn destroy_signal(&self, key: &str) -> bool {
        match self.registry.remove(key) {
            Some((_, Slot::Live(entry))) => {
                entry.cleanup();
                tracing::trace!(key, "signal destroyed");
                true
            }
            Some((_, Slot::Hydrated(_))) => true,
            None => false,
        }
    }

    /// All registered keys, sorted.
    pub fn signal_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Number of registered keys.
    pub fn signal_count(&self) -> usize {
        self.registry.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.registry.contains_key(key)
    }

    /// Whether `key` holds a restored value nobody has claimed yet.
    pub fn is_hydrated(&self, key: &str) -> bool {
        matches!(self.registry.get(key).as_deref(), Some(Slot::Hydrated(_)))
    }

    // ------------------------------------------------------------------
    // Capture / restore (used by state preservation)
    // ------------------------------------------------------------------

    /// Deep-copy every keyed value, sorted by key. Each item succeeds or
    /// fails independently.
    pub(crate) fn capture_values(&self) -> Vec<(String, Result<serde_json::Value>)> {
        let mut slots: Vec<(String, Slot)> = self
            .registry
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));

        slots
            .into_iter()
            .map(|(key, slot)| {
                let captured = match slot {
                    Slot::Live(entry) => {
                        capture_isolated(entry.as_ref()).map_err(|source| StateError::Capture {
                            key: key.clone(),
                            source,
                        })
                    }
                    Slot::Hydrated(value) => Ok(value),
                };
                (key, captured)
            })
            .collect()
    }

    /// Write a captured value under `key`, overwriting a registered signal
    /// or parking it as hydrated.
    pub(crate) fn restore_value(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<RestoreOutcome> {
        let live = match self.registry.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get().clone() {
                Slot::Live(entry) => entry,
                Slot::Hydrated(_) => {
                    occupied.insert(Slot::Hydrated(value));
                    return Ok(RestoreOutcome::Hydrated);
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Hydrated(value));
                return Ok(RestoreOutcome::Hydrated);
            }
        };

        // Overwriting notifies subscribers, so the shard lock is released first.
        restore_isolated(live.as_ref(), value).map_err(|source| StateError::Restore {
            key: key.to_string(),
            source,
        })
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Run `f` synchronously as a batch. Nested calls run inline. Updates
    /// scheduled with [`schedule_batched_update`](Self::schedule_batched_update)
    /// still wait for the end-of-tick flush.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.batch.batch(f)
    }

    pub fn is_batching(&self) -> bool {
        self.batch.is_batching()
    }

    /// Queue `thunk` for the end-of-tick flush.
    pub fn schedule_batched_update<F>(&self, thunk: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.batch.schedule(Box::new(thunk), self.scheduler.as_ref());
    }

    /// Flush pending batched updates now. Returns how many ran.
    pub fn flush_batch(&self) -> usize {
        self.batch.flush()
    }

    pub fn pending_batch_len(&self) -> usize {
        self.batch.pending_len()
    }

    /// End the current tick on a host-driven scheduler.
    pub fn end_tick(&self) -> usize {
        self.scheduler.run_pending()
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Cancel any pending flush, clean up every signal, empty the registry.
    pub fn cleanup(&self) {
        self.batch.cancel();

        let keys: Vec<String> = self.registry.iter().map(|e| e.key().clone()).collect();
        let mut cleaned = 0;
        for key in keys {
            if let Some((_, Slot::Live(entry))) = self.registry.remove(&key) {
                entry.cleanup();
                cleaned += 1;
            }
        }
        self.registry.clear();
        tracing::debug!(cleaned, "signal manager cleaned up");
    }
}

impl std::fmt::Debug for SignalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalManager")
            .field("signal_count", &self.signal_count())
            .field("pending_batch", &self.pending_batch_len())
            .field("batching", &self.is_batching())
            .finish()
    }
}

/// Capture one entry, turning a panicking `Serialize` impl into an error.
fn capture_isolated(
    entry: &dyn RegistryEntry,
) -> std::result::Result<serde_json::Value, serde_json::Error> {
    match catch_unwind(AssertUnwindSafe(|| entry.capture())) {
        Ok(captured) => captured,
        Err(payload) => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
            "serializer panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn decode_restored<T: StateValue>(key: &str, value: serde_json::Value) -> Option<T> {
    match serde_json::from_value::<T>(value) {
        Ok(seed) => Some(seed),
        Err(err) => {
            tracing::warn!(key, error = %err, "restored value does not fit; using initial value");
            None
        }
    }
}

/// Restore one entry, turning a panicking `Deserialize` impl into an error.
fn restore_isolated(
    entry: &dyn RegistryEntry,
    value: serde_json::Value,
) -> std::result::Result<RestoreOutcome, serde_json::Error> {
    match catch_unwind(AssertUnwindSafe(|| entry.restore(value))) {
        Ok(restored) => restored,
        Err(payload) => Err(<serde_json::Error as serde::de::Error>::custom(format!(
            "deserializer panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn downcast_signal<T: StateValue>(key: &str, entry: &dyn RegistryEntry) -> Result<Signal<T>> {
    match entry.as_any().downcast_ref::<SignalEntry<T>>() {
        Some(SignalEntry(signal)) => Ok(signal.clone()),
        None => Err(mismatch::<T>(key, entry)),
    }
}

fn downcast_computed<T: StateValue>(
    key: &str,
    entry: &dyn RegistryEntry,
) -> Result<ComputedSignal<T>> {
    match entry.as_any().downcast_ref::<ComputedEntry<T>>() {
        Some(ComputedEntry(computed)) => Ok(computed.clone()),
        None => Err(mismatch::<T>(key, entry)),
    }
}

fn mismatch<T>(key: &str, entry: &dyn RegistryEntry) -> StateError {
    let err = StateError::TypeMismatch {
        key: key.to_string(),
        expected: std::any::type_name::<T>(),
        found: entry.type_name(),
    };
    tracing::warn!(key, error = %err, "signal registered under a different type");
    err
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
