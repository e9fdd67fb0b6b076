//! Pub/Sub Bus
//!
//! A multi-producer, multi-consumer registry of named events. Every
//! subscription is tagged with the id of the component that owns it, so a
//! framework adapter can drop everything a component registered with one
//! `cleanup(component_id)` call when that component unmounts.
//!
//! # Guarantees
//!
//! - `emit` is synchronous and invokes subscribers in subscription order.
//! - `emit` walks a copy of the subscriber list, so callbacks may
//!   unsubscribe or clean up components (including other components on the
//!   same event) without corrupting the iteration.
//! - A panicking subscriber is logged and skipped; `emit` itself never fails.
//! - `cleanup(component_id)` removes exactly that component's subscriptions.
//!
//! # Restored Subscriptions
//!
//! Across a hot reload only `(event, component_id)` pairs survive. They come
//! back as *dormant* entries with no callback. When the reloaded component
//! subscribes again, its callback is attached to the dormant entry.

mod bus;

pub use bus::{DescriptorRestore, EventCallback, PubSub, SubscriptionDescriptor};
