//! Event Bus Implementation
//!
//! The bus keeps one ordered list of entries per event name. An entry is a
//! subscriber id, the owning component id, and a callback.
//!
//! # Entry Lifecycle
//!
//! 1. `subscribe` appends a live entry, or claims a dormant entry left by a
//!    restore for the same `(event, component_id)`.
//! 2. `emit` clones the live callbacks out under the read lock, releases it,
//!    then invokes them. Dormant entries are skipped.
//! 3. `unsubscribe`, `cleanup` and `clear` remove entries. Events left with no
//!    entries are dropped from the index.
//!
//! # Restoring Descriptors
//!
//! `restore_descriptors` treats descriptors as a multiset. Pairs already on
//! the bus count as matched, and only the shortfall becomes dormant entries,
//! so a component that re-subscribed before the restore is not duplicated.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::reactive::{invoke_isolated, SubscriberId};

/// Callback invoked with the payload of an emitted event.
pub type EventCallback<P> = Arc<dyn Fn(&P) + Send + Sync>;

/// The identity of a subscription, without its callback.
///
/// This is all a snapshot records about a subscription: callbacks cannot be
/// carried across a reload, only the fact that `component_id` listened to
/// `event`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionDescriptor {
    pub event: String,
    pub component_id: String,
}

impl SubscriptionDescriptor {
    pub fn new(event: impl Into<String>, component_id: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            component_id: component_id.into(),
        }
    }
}

/// Outcome of replaying descriptors onto a bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorRestore {
    /// Descriptors already covered by a subscription on the bus.
    pub matched: usize,
    /// Descriptors added as dormant entries awaiting a callback.
    pub dormant: usize,
}

impl DescriptorRestore {
    pub fn total(&self) -> usize {
        self.matched + self.dormant
    }
}

struct BusEntry<P> {
    id: SubscriberId,
    component_id: String,
    /// `None` for a dormant entry restored from a snapshot.
    callback: Option<EventCallback<P>>,
}

/// A named-event registry whose subscriptions are owned by component ids.
///
/// `P` is the payload type. It is opaque to the bus and defaults to
/// `serde_json::Value`.
pub struct PubSub<P = serde_json::Value> {
    index: RwLock<IndexMap<String, Vec<BusEntry<P>>>>,
}

impl<P> Default for PubSub<P>
where
    P: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PubSub<P>
where
    P: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            index: RwLock::new(IndexMap::new()),
        }
    }

    /// Subscribe `callback` to `event` on behalf of `component_id`.
    ///
    /// Subscriptions are never deduplicated, except that a dormant entry for
    /// the same `(event, component_id)` is claimed instead of appending a new
    /// one.
    pub fn subscribe<F>(&self, event: &str, callback: F, component_id: &str) -> SubscriberId
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let callback: EventCallback<P> = Arc::new(callback);
        let mut index = self.index.write();
        let entries = index.entry(event.to_string()).or_default();

        if let Some(dormant) = entries
            .iter_mut()
            .find(|e| e.callback.is_none() && e.component_id == component_id)
        {
            dormant.callback = Some(callback);
            tracing::trace!(
                event,
                component_id,
                subscriber = %dormant.id,
                "claimed restored subscription"
            );
            return dormant.id;
        }

        let id = SubscriberId::new();
        entries.push(BusEntry {
            id,
            component_id: component_id.to_string(),
            callback: Some(callback),
        });
        tracing::trace!(event, component_id, subscriber = %id, "subscribed");
        id
    }

    /// Remove a single subscription. Returns whether it existed.
    pub fn unsubscribe(&self, event: &str, id: SubscriberId) -> bool {
        let mut index = self.index.write();
        let Some(entries) = index.get_mut(event) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|e| e.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            index.shift_remove(event);
        }
        removed
    }

    /// Invoke every subscriber of `event`, in subscription order.
    ///
    /// The subscriber list is copied first, so callbacks may subscribe,
    /// unsubscribe or clean up components freely. A panicking callback is
    /// logged and skipped. Returns the number of callbacks invoked.
    pub fn emit(&self, event: &str, payload: &P) -> usize {
        let callbacks: Vec<(SubscriberId, EventCallback<P>)> = {
            let index = self.index.read();
            match index.get(event) {
                Some(entries) => entries
                    .iter()
                    .filter_map(|e| e.callback.as_ref().map(|cb| (e.id, Arc::clone(cb))))
                    .collect(),
                None => Vec::new(),
            }
        };

        let invoked = callbacks.len();
        for (id, callback) in callbacks {
            invoke_isolated(event, Some(id), || callback(payload));
        }

        tracing::trace!(event, invoked, "event emitted");
        invoked
    }

    /// Remove every subscription owned by `component_id`, across all events.
    /// Returns the number removed.
    pub fn cleanup(&self, component_id: &str) -> usize {
        let mut index = self.index.write();
        let mut removed = 0;

        for entries in index.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.component_id != component_id);
            removed += before - entries.len();
        }
        index.retain(|_, entries| !entries.is_empty());

        tracing::debug!(component_id, removed, "component subscriptions cleaned up");
        removed
    }

    /// Number of subscriptions (live and dormant) on `event`.
    pub fn subscription_count(&self, event: &str) -> usize {
        self.index.read().get(event).map_or(0, Vec::len)
    }

    /// Number of subscriptions across all events.
    pub fn total_subscriptions(&self) -> usize {
        self.index.read().values().map(Vec::len).sum()
    }

    /// Number of restored subscriptions still waiting for a callback.
    pub fn dormant_count(&self) -> usize {
        self.index
            .read()
            .values()
            .flatten()
            .filter(|e| e.callback.is_none())
            .count()
    }

    /// Events `component_id` is subscribed to, in first-subscription order.
    pub fn component_events(&self, component_id: &str) -> Vec<String> {
        self.index
            .read()
            .iter()
            .filter(|(_, entries)| entries.iter().any(|e| e.component_id == component_id))
            .map(|(event, _)| event.clone())
            .collect()
    }

    /// Events with at least one subscription.
    pub fn events(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    /// Identity of every subscription, in event then subscription order.
    pub fn descriptors(&self) -> Vec<SubscriptionDescriptor> {
        self.index
            .read()
            .iter()
            .flat_map(|(event, entries)| {
                entries.iter().map(move |e| {
                    SubscriptionDescriptor::new(event.clone(), e.component_id.clone())
                })
            })
            .collect()
    }

    /// Re-establish subscription bookkeeping from descriptors.
    ///
    /// Descriptors are matched as a multiset against what the bus already
    /// holds: a component that re-subscribed before the restore is not
    /// duplicated. The shortfall is added as dormant entries, which a later
    /// `subscribe` for the same pair claims.
    pub fn restore_descriptors(&self, descriptors: &[SubscriptionDescriptor]) -> DescriptorRestore {
        let mut index = self.index.write();

        let mut present: HashMap<(String, String), usize> = HashMap::new();
        for (event, entries) in index.iter() {
            for e in entries {
                *present
                    .entry((event.clone(), e.component_id.clone()))
                    .or_default() += 1;
            }
        }

        let mut outcome = DescriptorRestore::default();
        for descriptor in descriptors {
            let key = (descriptor.event.clone(), descriptor.component_id.clone());
            match present.get_mut(&key) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    outcome.matched += 1;
                }
                _ => {
                    index
                        .entry(descriptor.event.clone())
                        .or_default()
                        .push(BusEntry {
                            id: SubscriberId::new(),
                            component_id: descriptor.component_id.clone(),
                            callback: None,
                        });
                    outcome.dormant += 1;
                }
            }
        }

        tracing::debug!(
            matched = outcome.matched,
            dormant = outcome.dormant,
            "subscription descriptors restored"
        );
        outcome
    }

    /// Remove every subscription for every event.
    pub fn clear(&self) {
        let removed = {
            let mut index = self.index.write();
            let removed: usize = index.values().map(Vec::len).sum();
            index.clear();
            removed
        };
        tracing::debug!(removed, "event bus cleared");
    }
}

impl<P> std::fmt::Debug for PubSub<P>
where
    P: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("events", &self.events())
            .field("total_subscriptions", &self.total_subscriptions())
            .field("dormant", &self.dormant_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
