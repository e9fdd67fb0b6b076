//! State Preservation
//!
//! During development the surrounding program may tear down and rebuild the
//! module instance that owns a [`SignalManager`](crate::reactive::SignalManager)
//! and a [`PubSub`](crate::pubsub::PubSub). This module carries state across
//! that boundary.
//!
//! - [`Snapshot`] holds deep copies of every keyed signal value plus the
//!   `(event, component_id)` identity of every subscription, stamped with a
//!   capture time and a TTL.
//! - [`StatePreservationManager`] produces snapshots from one manager/bus pair
//!   and replays them onto another.
//!
//! Callbacks are not preserved. The reloaded components subscribe again
//! through the normal path and pick up the restored bookkeeping.

mod clock;
mod manager;
mod snapshot;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::{PreservationPhase, PreserveReport, RestoreReport, StatePreservationManager};
pub use snapshot::Snapshot;
