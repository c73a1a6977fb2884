//! Orderflow API — HTTP surface of the dispatch core.
//!
//! Producers append order events, operators manage subscriptions, and the
//! delivery and dead-letter tables are exposed for audit and manual retry.

pub mod config;
pub mod error;
pub mod retention;
pub mod routes;
pub mod state;
pub mod telemetry;
