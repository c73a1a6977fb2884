//! Orderflow Dispatch — delivers committed order events to handlers.
//!
//! The [`Dispatcher`] fans every appended event out into one delivery record
//! per subscribed handler, claims due records within its worker budget,
//! invokes the handler with a timeout, and records the outcome: delivered,
//! scheduled for retry with jittered exponential backoff, or dead-lettered.
//!
//! Delivery is at-least-once. Within one (order, handler) lane events are
//! delivered strictly in sequence order, and at most one is in flight.

pub mod backoff;
pub mod config;
pub mod dispatcher;

pub use config::DispatcherConfig;
pub use dispatcher::{DeliveryOutcome, Dispatcher, TickReport};
