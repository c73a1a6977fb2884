//! The capability every downstream consumer implements.

use async_trait::async_trait;
use thiserror::Error;

use crate::event::OrderEvent;

/// Successful handling of an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    /// Key identifying the business-side effect, so later redeliveries of
    /// the same effect can be collapsed.
    pub idempotency_key: Option<String>,
}

impl Ack {
    /// An acknowledgement without an idempotency key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An acknowledgement carrying an idempotency key.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            idempotency_key: Some(key.into()),
        }
    }
}

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Retryable failure: timeout, network trouble, a dependency being down.
    #[error("transient handler error: {0}")]
    Transient(String),

    /// The handler will never accept this event. Not retried.
    #[error("permanent handler error: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Whether the dispatcher should schedule another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

/// A downstream consumer of order events.
///
/// The dispatcher knows nothing about what a handler does; it only calls
/// `handle` and interprets the result. Handlers see at-least-once delivery
/// and must tolerate duplicates.
#[async_trait]
pub trait OrderEventHandler: Send + Sync {
    /// Stable identifier the handler subscribes under.
    fn handler_id(&self) -> &str;

    /// Processes one event.
    async fn handle(&self, event: &OrderEvent) -> Result<Ack, HandlerError>;
}
