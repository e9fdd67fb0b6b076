//! State Preservation Manager
//!
//! Bridges two otherwise unrelated instances of the reactive machinery across
//! a hot reload:
//!
//! ```text
//!   old SignalManager + PubSub ──preserve_state──▶ Snapshot
//!                                                     │
//!   new SignalManager + PubSub ◀──restore_state───────┘
//! ```
//!
//! # Phases
//!
//! `Idle → Preserving → Preserved → Restoring → Idle`. A preserve requested
//! while a restore is running (for example from a subscriber notified by the
//! restore) is refused, and vice versa.
//!
//! # Failure Reporting
//!
//! Neither operation returns `Err`. Outcomes are reported on
//! [`PreserveReport`] / [`RestoreReport`]:
//!
//! - a value that cannot be captured or written back is a per-item miss;
//! - a missing or expired snapshot makes the whole restore fail with an
//!   explicit error. It is never treated as "nothing to restore".

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use super::clock::{Clock, SystemClock};
use super::snapshot::Snapshot;
use crate::config::TesseraConfig;
use crate::error::StateError;
use crate::pubsub::PubSub;
use crate::reactive::{RestoreOutcome, SignalManager};

/// Where the manager is in the preserve/restore cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreservationPhase {
    Idle,
    Preserving,
    Preserved,
    Restoring,
}

/// Result of [`StatePreservationManager::preserve_state`].
#[derive(Debug, Clone)]
pub struct PreserveReport {
    pub success: bool,
    pub preserved_signals: usize,
    pub preserved_subscriptions: usize,
    pub snapshot: Option<Snapshot>,
    /// Keys whose values could not be captured.
    pub skipped: Vec<String>,
    pub error: Option<String>,
}

impl PreserveReport {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            preserved_signals: 0,
            preserved_subscriptions: 0,
            snapshot: None,
            skipped: Vec::new(),
            error: Some(error),
        }
    }
}

/// Result of [`StatePreservationManager::restore_state`].
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub success: bool,
    pub restored_signals: usize,
    pub restored_subscriptions: usize,
    /// How many of `restored_signals` are parked awaiting registration.
    pub hydrated_signals: usize,
    /// Keys whose values could not be written back.
    pub missed: Vec<String>,
    pub error: Option<String>,
}

impl RestoreReport {
    pub(crate) fn failed(error: String) -> Self {
        Self {
            success: false,
            restored_signals: 0,
            restored_subscriptions: 0,
            hydrated_signals: 0,
            missed: Vec::new(),
            error: Some(error),
        }
    }
}

/// Sets the phase on scope exit, including an unwind out of user code.
struct PhaseGuard<'a> {
    phase: &'a Mutex<PreservationPhase>,
    exit: PreservationPhase,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        let mut phase = self.phase.lock();
        tracing::trace!(from = ?*phase, to = ?self.exit, "preservation phase change");
        *phase = self.exit;
    }
}

/// Captures and replays reactive state across a reload boundary.
pub struct StatePreservationManager {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    phase: Mutex<PreservationPhase>,
    snapshot: RwLock<Option<Snapshot>>,
}

impl Default for StatePreservationManager {
    fn default() -> Self {
        Self::new(&TesseraConfig::default())
    }
}

impl StatePreservationManager {
    pub fn new(config: &TesseraConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &TesseraConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl: config.snapshot_ttl(),
            clock,
            phase: Mutex::new(PreservationPhase::Idle),
            snapshot: RwLock::new(None),
        }
    }

    pub fn phase(&self) -> PreservationPhase {
        *self.phase.lock()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A copy of the held snapshot, if any.
    pub fn current_snapshot(&self) -> Option<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Capture every keyed signal value and every subscription identity.
    ///
    /// Call immediately before the old module instance is torn down.
    pub fn preserve_state<P>(&self, signals: &SignalManager, bus: &PubSub<P>) -> PreserveReport
    where
        P: Send + Sync + 'static,
    {
        let previous = match self.enter(PreservationPhase::Preserving) {
            Ok(previous) => previous,
            Err(busy) => return PreserveReport::failed(busy),
        };
        let mut phase = PhaseGuard {
            phase: &self.phase,
            exit: previous,
        };

        let mut captured = IndexMap::new();
        let mut skipped = Vec::new();
        for (key, value) in signals.capture_values() {
            match value {
                Ok(value) => {
                    captured.insert(key, value);
                }
                Err(err) => {
                    tracing::warn!(
                        key = %key,
                        error = %err,
                        "skipping signal that could not be captured"
                    );
                    skipped.push(key);
                }
            }
        }

        let subscriptions = bus.descriptors();
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        let snapshot = Snapshot {
            signals: captured,
            subscriptions,
            timestamp_ms: self.clock.now_ms(),
            ttl_ms,
        };

        let report = PreserveReport {
            success: true,
            preserved_signals: snapshot.signals.len(),
            preserved_subscriptions: snapshot.subscriptions.len(),
            snapshot: Some(snapshot.clone()),
            skipped,
            error: None,
        };

        *self.snapshot.write() = Some(snapshot);
        phase.exit = PreservationPhase::Preserved;

        tracing::info!(
            signals = report.preserved_signals,
            subscriptions = report.preserved_subscriptions,
            skipped = report.skipped.len(),
            "state preserved"
        );
        report
    }

    /// Replay the held snapshot onto a (normally fresh) manager and bus.
    ///
    /// Call after the replacement module instance has registered its own
    /// signals and subscriptions. Values for keys it has not registered yet
    /// are parked and picked up on first access.
    pub fn restore_state<P>(&self, signals: &SignalManager, bus: &PubSub<P>) -> RestoreReport
    where
        P: Send + Sync + 'static,
    {
        let snapshot = match self.restorable_snapshot() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "restore refused");
                return RestoreReport::failed(err.to_string());
            }
        };

        let previous = match self.enter(PreservationPhase::Restoring) {
            Ok(previous) => previous,
            Err(busy) => return RestoreReport::failed(busy),
        };
        tracing::debug!(from = ?previous, "restoring state");
        let _phase = PhaseGuard {
            phase: &self.phase,
            exit: PreservationPhase::Idle,
        };

        let mut restored_signals = 0;
        let mut hydrated_signals = 0;
        let mut missed = Vec::new();
        for (key, value) in snapshot.signals {
            match signals.restore_value(&key, value) {
                Ok(outcome) => {
                    restored_signals += 1;
                    if outcome == RestoreOutcome::Hydrated {
                        hydrated_signals += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "signal could not be restored");
                    missed.push(key);
                }
            }
        }

        let subscriptions = bus.restore_descriptors(&snapshot.subscriptions);

        tracing::info!(
            signals = restored_signals,
            hydrated = hydrated_signals,
            subscriptions = subscriptions.total(),
            missed = missed.len(),
            "state restored"
        );

        RestoreReport {
            success: true,
            restored_signals,
            restored_subscriptions: subscriptions.total(),
            hydrated_signals,
            missed,
            error: None,
        }
    }

    /// Install a snapshot produced elsewhere, typically one decoded from bytes
    /// handed over by the previous module instance.
    pub fn adopt_snapshot(&self, snapshot: Snapshot) {
        *self.snapshot.write() = Some(snapshot);
        self.set_phase(PreservationPhase::Preserved);
    }

    /// Discard the held snapshot. Later restores fail with "no snapshot".
    pub fn cleanup(&self) {
        let had_snapshot = self.snapshot.write().take().is_some();
        self.set_phase(PreservationPhase::Idle);
        tracing::debug!(had_snapshot, "preservation manager cleaned up");
    }

    fn restorable_snapshot(&self) -> Result<Snapshot, StateError> {
        let snapshot = self.snapshot.read().clone().ok_or(StateError::NoSnapshot)?;
        let now = self.clock.now_ms();
        if snapshot.is_expired(now) {
            let age_ms = u64::try_from(snapshot.age(now).as_millis()).unwrap_or(u64::MAX);
            return Err(StateError::SnapshotExpired {
                age_ms,
                ttl_ms: snapshot.ttl_ms,
            });
        }
        Ok(snapshot)
    }

    /// Move into a working phase, refusing if another one is in progress.
    fn enter(&self, next: PreservationPhase) -> Result<PreservationPhase, String> {
        let mut phase = self.phase.lock();
        match *phase {
            PreservationPhase::Preserving | PreservationPhase::Restoring => Err(format!(
                "cannot start {next:?} while {:?} is in progress",
                *phase
            )),
            previous => {
                *phase = next;
                Ok(previous)
            }
        }
    }

    fn set_phase(&self, next: PreservationPhase) {
        let mut phase = self.phase.lock();
        tracing::trace!(from = ?*phase, to = ?next, "preservation phase change");
        *phase = next;
    }
}

impl std::fmt::Debug for StatePreservationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatePreservationManager")
            .field("ttl", &self.ttl)
            .field("phase", &self.phase())
            .field("has_snapshot", &self.snapshot.read().is_some())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preserve::ManualClock;
    use serde::{Deserialize, Serialize, Serializer};
    use serde_json::{json, Value};

    fn manager_with_clock(ttl_ms: u64) -> (StatePreservationManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = TesseraConfig {
            snapshot_ttl_ms: ttl_ms,
        };
        (StatePreservationManager::with_clock(&config, clock.clone()), clock)
    }

    #[test]
    fn preserve_records_values_and_descriptors() {
        let (preserver, _clock) = manager_with_clock(60_000);
        let signals = SignalManager::new();
        let bus: PubSub = PubSub::new();

        signals.create_signal(42, Some("counter")).unwrap();
        signals.create_signal(vec!["a".to_string()], Some("items")).unwrap();
        bus.subscribe("save", |_| {}, "toolbar");

        let report = preserver.preserve_state(&signals, &bus);
        assert!(report.success);
        assert_eq!(report.preserved_signals, 2);
        assert_eq!(report.preserved_subscriptions, 1);
        assert_eq!(preserver.phase(), PreservationPhase::Preserved);

        let snapshot = report.snapshot.unwrap();
        assert_eq!(snapshot.signals["counter"], json!(42));
        assert_eq!(snapshot.signals["items"], json!(["a"]));
        assert_eq!(snapshot.timestamp_ms, 1_000_000);
        assert_eq!(snapshot.ttl_ms, 60_000);
        assert_eq!(preserver.current_snapshot(), Some(snapshot));
    }

    #[test]
    fn snapshot_is_independent_of_later_writes() {
        let (preserver, _clock) = manager_with_clock(60_000);
        let signals = SignalManager::new();
        let bus: PubSub = PubSub::new();

        let user = signals
            .create_signal(json!({"name": "ada"}), Some("user"))
            .unwrap();
        preserver.preserve_state(&signals, &bus);

        user.update(|v| {
            let mut next = v.clone();
            next["name"] = json!("grace");
            next
        });

        let snapshot = preserver.current_snapshot().unwrap();
        assert_eq!(snapshot.signals["user"]["name"], json!("ada"));
    }

    struct Unserializable;

    impl Clone for Unserializable {
        fn clone(&self) -> Self {
            Unserializable
        }
    }

    impl PartialEq for Unserializable {
        fn eq(&self, _: &Self) -> bool {
            true
        }
    }

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("opaque handle"))
        }
    }

    impl<'de> serde::Deserialize<'de> for Unserializable {
        fn deserialize<D: serde::Deserializer<'de>>(_: D) -> Result<Self, D::Error> {
            Ok(Unserializable)
        }
    }

    #[test]
    fn capture_failure_skips_item_but_succeeds() {
        let (preserver, _clock) = manager_with_clock(60_000);
        let signals = SignalManager::new();
        let bus: PubSub = PubSub::new();

        signals.create_signal(1, Some("good")).unwrap();
        signals.create_signal(Unserializable, Some("handle")).unwrap();

        let report = preserver.preserve_state(&signals, &bus);
        assert!(report.success);
        assert_eq!(report.preserved_signals, 1);
        assert_eq!(report.skipped, vec!["handle"]);
        assert!(!report.snapshot.unwrap().signals.contains_key("handle"));
    }

    #[test]
    fn restore_without_snapshot_fails_explicitly() {
        let (preserver, _clock) = manager_with_clock(60_000);
        let signals = SignalManager::new();
        let bus: PubSub = PubSub::new();

        let report = preserver.restore_state(&signals, &bus);
        assert!(!report.success);
        assert_eq!(report.restored_signals, 0);
        assert_eq!(report.restored_subscriptions, 0);
        assert!(report.error.unwrap().contains("no snapshot"));
    }

    #[test]
    fn restore_after_cleanup_fails() {
        let (preserver, _clock) = manager_with_clock(60_000);
        let signals = SignalManager::new();
        let bus: PubSub = PubSub::new();
        signals.create_signal(1, Some("a")).unwrap();

        preserver.preserve_state(&signals, &bus);
        preserver.cleanup();

        assert!(preserver.current_snapshot().is_none());
        assert_eq!(preserver.phase(), PreservationPhase::Idle);
        let report = preserver.restore_state(&SignalManager::new(), &bus);
        assert!(!report.success);
        assert!(report.error.unwrap().contains("no snapshot"));
    }

    #[test]
    fn expired_snapshot_is_refused() {
        let (preserver, clock) = manager_with_clock(1_000);
        let signals = SignalManager::new();
        let bus: PubSub = PubSub::new();
        signals.create_signal(5, Some("a")).unwrap();
        preserver.preserve_state(&signals, &bus);

        clock.advance(Duration::from_millis(1_001));
        let fresh = SignalManager::new();
        let report = preserver.restore_state(&fresh, &bus);

        assert!(!report.success);
        assert!(report.error.unwrap().contains("expired"));
        assert_eq!(fresh.signal_count(), 0);
    }

    #[test]
    fn restore_into_fresh_instances() {
        let (preserver, _clock) = manager_with_clock(60_000);
        let old_signals = SignalManager::new();
        let old_bus: PubSub = PubSub::new();

        let counter = old_signals.create_signal(0, Some("counter")).unwrap();
        counter.set(42);
        old_bus.subscribe("x", |_| {}, "c1");
        old_bus.subscribe("y", |_| {}, "c2");

        assert!(preserver.preserve_state(&old_signals, &old_bus).success);
        old_signals.cleanup();
        old_bus.clear();

        let new_signals = SignalManager::new();
        let new_bus: PubSub = PubSub::new();
        let report = preserver.restore_state(&new_signals, &new_bus);

        assert!(report.success);
        assert_eq!(report.restored_signals, 1);
        assert_eq!(report.hydrated_signals, 1);
        assert_eq!(report.restored_subscriptions, 2);
        assert_eq!(preserver.phase(), PreservationPhase::Idle);

        assert_eq!(new_signals.get_signal::<i32>("counter").unwrap().get(), 42);
        let mut descriptors = new_bus.descriptors();
        descriptors.sort();
        let mut expected = vec![
            crate::pubsub::SubscriptionDescriptor::new("x", "c1"),
            crate::pubsub::SubscriptionDescriptor::new("y", "c2"),
        ];
        expected.sort();
        assert_eq!(descriptors, expected);
    }

    #[test]
    fn restore_type_mismatch_is_a_counted_miss() {
        let (preserver, _clock) = manager_with_clock(60_000);
        let signals = SignalManager::new();
        let bus: PubSub = PubSub::new();
        signals.create_signal(String::from("hello"), Some("greeting")).unwrap();
        signals.create_signal(3, Some("count")).unwrap();
        preserver.preserve_state(&signals, &bus);

        let fresh = SignalManager::new();
        fresh.create_signal(0_u8, Some("greeting")).unwrap();
        fresh.create_signal(0, Some("count")).unwrap();

        let report = preserver.restore_state(&fresh, &bus);
        assert!(report.success);
        assert_eq!(report.restored_signals, 1);
        assert_eq!(report.missed, vec!["greeting"]);
        assert_eq!(fresh.get_signal::<i32>("count").unwrap().get(), 3);
        assert_eq!(fresh.get_signal::<u8>("greeting").unwrap().get(), 0);
    }

    #[test]
    fn restore_from_subscriber_cannot_start_preserve() {
        let (preserver, _clock) = manager_with_clock(60_000);
        let preserver = Arc::new(preserver);
        let signals = SignalManager::new();
        let bus: PubSub = PubSub::new();
        signals.create_signal(1, Some("a")).unwrap();
        preserver.preserve_state(&signals, &bus);

        let fresh = Arc::new(SignalManager::new());
        let a = fresh.create_signal(0, Some("a")).unwrap();
        let nested: Arc<Mutex<Option<PreserveReport>>> = Arc::new(Mutex::new(None));
        {
            let preserver = Arc::clone(&preserver);
            let fresh = Arc::clone(&fresh);
            let nested = Arc::clone(&nested);
            let _sub = a.subscribe(move |_| {
                let bus: PubSub<Value> = PubSub::new();
                *nested.lock() = Some(preserver.preserve_state(&fresh, &bus));
            });
        }

        let report = preserver.restore_state(&fresh, &bus);
        assert!(report.success);
        let nested = nested.lock().take().unwrap();
        assert!(!nested.success);
        assert!(nested.error.unwrap().contains("Restoring"));
    }

    /// Rejects negative values by panicking instead of returning an error.
    #[derive(Clone, PartialEq, Serialize)]
    struct Touchy(i64);

    impl<'de> serde::Deserialize<'de> for Touchy {
        fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
            let value = i64::deserialize(d)?;
            if value < 0 {
                panic!("negative touchy value");
            }
            Ok(Touchy(value))
        }
    }

    #[test]
    fn panicking_deserializer_is_a_counted_miss() {
        let (preserver, _clock) = manager_with_clock(60_000);
        let signals = SignalManager::new();
        let bus: PubSub = PubSub::new();
        signals.create_signal(Touchy(-5), Some("touchy")).unwrap();
        signals.create_signal(1, Some("fine")).unwrap();
        preserver.preserve_state(&signals, &bus);

        let fresh = SignalManager::new();
        let touchy = fresh.create_signal(Touchy(0), Some("touchy")).unwrap();
        let report = preserver.restore_state(&fresh, &bus);

        assert!(report.success);
        assert_eq!(report.restored_signals, 1);
        assert_eq!(report.missed, vec!["touchy"]);
        assert!(touchy.get() == Touchy(0));
        assert_eq!(preserver.phase(), PreservationPhase::Idle);

        let again = preserver.preserve_state(&fresh, &bus);
        assert!(again.success, "{:?}", again.error);
    }

    #[test]
    fn restored_computed_follows_reloaded_formula() {
        let (preserver, _clock) = manager_with_clock(60_000);
        let old = SignalManager::new();
        let bus: PubSub = PubSub::new();
        let price = old.create_signal(100, Some("price")).unwrap();
        let qty = old.create_signal(2, Some("qty")).unwrap();
        let (p, q) = (price.clone(), qty.clone());
        old.create_computed(move || p.get() * q.get(), &[&price, &qty], Some("subtotal"))
            .unwrap();
        price.set(150);
        preserver.preserve_state(&old, &bus);
        old.cleanup();

        let fresh = SignalManager::new();
        let price = fresh.create_signal(100, Some("price")).unwrap();
        let qty = fresh.create_signal(2, Some("qty")).unwrap();
        let (p, q) = (price.clone(), qty.clone());
        let subtotal = fresh
            .create_computed(move || p.get() * q.get() * 2, &[&price, &qty], Some("subtotal"))
            .unwrap();

        let report = preserver.restore_state(&fresh, &bus);
        assert!(report.success);
        assert_eq!(report.restored_signals, 3);
        assert_eq!(price.get(), 150);
        assert_eq!(subtotal.get(), 600);
    }

    #[test]
    fn adopted_snapshot_can_be_restored() {
        let (source, _clock) = manager_with_clock(60_000);
        let signals = SignalManager::new();
        let bus: PubSub = PubSub::new();
        signals.create_signal(true, Some("dark_mode")).unwrap();
        let bytes = source
            .preserve_state(&signals, &bus)
            .snapshot
            .unwrap()
            .encode()
            .unwrap();

        let (target, _clock) = manager_with_clock(60_000);
        target.adopt_snapshot(Snapshot::decode(&bytes).unwrap());
        assert_eq!(target.phase(), PreservationPhase::Preserved);

        let fresh = SignalManager::new();
        assert!(target.restore_state(&fresh, &bus).success);
        assert!(fresh.get_signal::<bool>("dark_mode").unwrap().get());
    }
}
