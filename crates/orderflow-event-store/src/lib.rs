//! Orderflow Event Store — `SQLite` persistence for the dispatch core.
//!
//! A single [`SqliteStore`] implements the event log, the delivery-state
//! table, and the subscription table over one connection pool, so
//! cross-table operations (fan-out, unregistration drain, compaction) commit
//! atomically.

pub mod config;
mod deliveries;
mod events;
mod rows;
pub mod sqlite_store;
mod subscriptions;

pub use config::SqliteStoreConfig;
pub use sqlite_store::SqliteStore;
