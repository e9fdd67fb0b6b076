//! Reactive Primitives
//!
//! This module implements the shared-state half of the crate: signals,
//! computed signals, and the keyed registry that ties them to names.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A [`Signal`] is a container for mutable state. Subscribers register a
//! callback and are notified synchronously, in subscription order, whenever
//! the value changes. Setting an equal value notifies nobody.
//!
//! ## Computed Signals
//!
//! A [`ComputedSignal`] derives its value from declared dependencies and
//! recomputes eagerly, inside the dependency's notification. Chains of
//! computed signals settle before the originating `set` returns.
//!
//! ## Signal Manager
//!
//! A [`SignalManager`] maps string keys to signals so that components written
//! against different UI frameworks can share one value by name. It also
//! coalesces batched updates into a single end-of-tick flush.
//!
//! # Implementation Notes
//!
//! Dependencies are declared explicitly rather than tracked automatically.
//! Generated wrapper code knows its inputs statically, and explicit edges
//! make teardown order (detach from dependencies, then clear subscribers)
//! straightforward.

mod batch;
mod computed;
mod manager;
mod signal;
mod subscriber;

pub use batch::{ManualTick, Task, TickScheduler, TokioTick};
pub use computed::ComputedSignal;
pub use manager::{RestoreOutcome, SignalManager, StateValue};
pub use signal::{Dependency, Signal, SignalCallback, SignalValue};
pub use subscriber::{SubscriberId, Subscription};

pub(crate) use subscriber::invoke_isolated;
