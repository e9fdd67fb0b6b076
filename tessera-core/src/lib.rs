//! Tessera Core
//!
//! Shared reactive state for UI components written in different front-end
//! frameworks. It implements:
//!
//! - Reactive primitives (signals and computed signals)
//! - A keyed signal registry with batched updates
//! - A component-scoped Pub/Sub bus
//! - State preservation across development-time hot reloads
//!
//! Framework adapters and generated wrapper code bind to four call shapes:
//! create/get a keyed signal, subscribe to a signal, update a signal, and
//! subscribe/emit on the bus by event name.
//!
//! # Architecture
//!
//! - `reactive`: signals, computed signals and the [`SignalManager`]
//! - `pubsub`: the named-event [`PubSub`] bus
//! - `preserve`: snapshots and the [`StatePreservationManager`]
//! - `context`: [`StateContext`], the injectable bundle of all three
//!
//! Everything runs synchronously on the caller's thread. The only deferred
//! work is the end-of-tick flush of batched updates.
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_core::StateContext;
//!
//! let ctx: StateContext = StateContext::default();
//!
//! let price = ctx.signals().create_signal(100, Some("price"))?;
//! let qty = ctx.signals().create_signal(2, Some("qty"))?;
//! let (p, q) = (price.clone(), qty.clone());
//! let subtotal = ctx
//!     .signals()
//!     .create_computed(move || p.get() * q.get(), &[&price, &qty], Some("subtotal"))?;
//!
//! price.set(150);
//! assert_eq!(subtotal.get(), 300);
//!
//! ctx.bus().subscribe("checkout", |payload| println!("{payload}"), "cart-widget");
//! ctx.bus().emit("checkout", &serde_json::json!({ "total": subtotal.get() }));
//! ctx.bus().cleanup("cart-widget");
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod preserve;
pub mod pubsub;
pub mod reactive;

pub use config::TesseraConfig;
pub use context::StateContext;
pub use error::{Result, StateError};
pub use preserve::{PreserveReport, RestoreReport, Snapshot, StatePreservationManager};
pub use pubsub::{PubSub, SubscriptionDescriptor};
pub use reactive::{ComputedSignal, Signal, SignalManager, Subscription};
