//! Orderflow Idempotency — duplicate-effect suppression for handlers.
//!
//! Delivery is at-least-once, so a handler may see the same event more than
//! once. Handlers derive an idempotency key for each side effect, check it
//! with [`DedupCache::seen`] before acting, and the dispatcher records it with
//! [`DedupCache::mark_seen`] once the handler acknowledges.
//!
//! ```text
//! handler: seen(key)? ──yes──► skip side effect, Ack(key)
//!              │ no
//!              ▼
//!        perform effect ──► Ack(key) ──► dispatcher: mark_seen(key)
//! ```
//!
//! Keys are kept for at least the redelivery window of the subscription that
//! produced them, and the cache never holds more than `capacity` keys.

pub mod cache;
pub mod config;

pub use cache::DedupCache;
pub use config::DedupConfig;
