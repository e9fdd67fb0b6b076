//! State Context
//!
//! Components need to find shared signals and events by name, which makes
//! the registry effectively global. Rather than hiding it in module-level
//! statics, the registry, the bus and the preservation manager are bundled
//! in an explicit [`StateContext`] that is passed to whoever needs it.
//!
//! Tests and multi-app hosts build private contexts. Everyone else can use
//! the single process-wide default from [`StateContext::global`].

use std::sync::OnceLock;

use crate::config::TesseraConfig;
use crate::preserve::{PreserveReport, RestoreReport, StatePreservationManager};
use crate::pubsub::PubSub;
use crate::reactive::SignalManager;

/// One module instance's worth of shared reactive state.
pub struct StateContext<P = serde_json::Value> {
    signals: SignalManager,
    bus: PubSub<P>,
    preservation: StatePreservationManager,
}

static GLOBAL: OnceLock<StateContext> = OnceLock::new();

impl StateContext {
    /// The process-wide default context, configured from the environment on
    /// first use.
    pub fn global() -> &'static StateContext {
        GLOBAL.get_or_init(|| {
            let config = TesseraConfig::from_env().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "ignoring invalid environment configuration");
                TesseraConfig::default()
            });
            StateContext::new(&config)
        })
    }
}

impl<P> Default for StateContext<P>
where
    P: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(&TesseraConfig::default())
    }
}

impl<P> StateContext<P>
where
    P: Send + Sync + 'static,
{
    pub fn new(config: &TesseraConfig) -> Self {
        Self::from_parts(
            SignalManager::new(),
            PubSub::new(),
            StatePreservationManager::new(config),
        )
    }

    pub fn from_parts(
        signals: SignalManager,
        bus: PubSub<P>,
        preservation: StatePreservationManager,
    ) -> Self {
        Self {
            signals,
            bus,
            preservation,
        }
    }

    pub fn signals(&self) -> &SignalManager {
        &self.signals
    }

    pub fn bus(&self) -> &PubSub<P> {
        &self.bus
    }

    pub fn preservation(&self) -> &StatePreservationManager {
        &self.preservation
    }

    /// Snapshot this context's signals and subscriptions.
    pub fn preserve(&self) -> PreserveReport {
        self.preservation.preserve_state(&self.signals, &self.bus)
    }

    /// Restore this context's held snapshot onto its own manager and bus.
    pub fn restore(&self) -> RestoreReport {
        self.preservation.restore_state(&self.signals, &self.bus)
    }

    /// Hand state over to the context of a freshly loaded module instance.
    ///
    /// Preserves this context, tears it down, and restores the snapshot
    /// into `next`. `next` should already have registered its signals and
    /// subscriptions; anything it has not registered yet is parked and
    /// picked up later.
    pub fn hand_over(&self, next: &StateContext<P>) -> RestoreReport {
        let preserved = self.preserve();
        let Some(snapshot) = preserved.snapshot else {
            let error = preserved
                .error
                .unwrap_or_else(|| "preserve produced no snapshot".to_string());
            return RestoreReport::failed(error);
        };

        self.teardown();
        next.preservation.adopt_snapshot(snapshot);
        next.restore()
    }

    /// Drop all state: pending batches, signals, subscriptions and any held
    /// snapshot.
    pub fn teardown(&self) {
        self.signals.cleanup();
        self.bus.clear();
        self.preservation.cleanup();
    }
}

impl<P> std::fmt::Debug for StateContext<P>
where
    P: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateContext")
            .field("signals", &self.signals)
            .field("bus", &self.bus)
            .field("preservation", &self.preservation)
            .finish()
    }
}
