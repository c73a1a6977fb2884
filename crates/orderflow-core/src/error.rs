//! Domain error types.

use thiserror::Error;

/// Top-level domain error type.
///
/// Every error here surfaces synchronously to the caller that triggered it.
/// Dispatch-time failures are never expressed as a `DomainError`; they are
/// recorded on the delivery record instead.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Malformed input, rejected before anything is written. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A caller-supplied sequence number collided with the order's stream.
    #[error("sequence conflict on order {order_id}: expected sequence {expected}, next is {actual}")]
    Conflict {
        /// The order whose stream rejected the append.
        order_id: String,
        /// The sequence number the producer asked for.
        expected: u64,
        /// The sequence number the store would have assigned.
        actual: u64,
    },

    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A durable read or write failed. Fatal to the call; the caller retries.
    #[error("storage error: {0}")]
    Storage(String),
}
