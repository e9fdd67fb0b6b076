//! The snapshot carried across a reload boundary.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pubsub::SubscriptionDescriptor;

/// A point-in-time capture of signal values and subscription identities.
///
/// Every value is an owned `serde_json::Value`, so nothing in a snapshot
/// refers back to the signals it was taken from: later writes to those
/// signals cannot change it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Captured values, sorted by key.
    pub signals: IndexMap<String, serde_json::Value>,
    /// `(event, component_id)` pairs, in bus order.
    pub subscriptions: Vec<SubscriptionDescriptor>,
    /// Capture time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// How long after `timestamp_ms` the snapshot may still be restored.
    pub ttl_ms: u64,
}

impl Snapshot {
    /// Time elapsed since capture. A clock that went backwards yields zero.
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.timestamp_ms))
    }

    /// Whether the snapshot is older than its TTL.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp_ms) > self.ttl_ms
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Encode as MessagePack, for handing the snapshot to a freshly loaded
    /// module instance as plain bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode bytes produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
