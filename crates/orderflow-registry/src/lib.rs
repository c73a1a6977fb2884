//! Orderflow Registry — which handlers receive which order event kinds.
//!
//! The registry is the in-memory view of the durable subscription table.
//! Writes go to the store first and are then swapped into memory, so a
//! lookup never observes a subscription that was not persisted.

pub mod registry;

pub use registry::{SubscriptionRegistry, Unregistered};
