//! Order-lifecycle events.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// The lifecycle stage an order event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The order was placed.
    Created,
    /// Payment for the order was requested.
    PaymentRequested,
    /// Payment was captured.
    PaymentSucceeded,
    /// Payment was declined.
    PaymentFailed,
    /// The customer was notified.
    NotificationSent,
}

impl EventKind {
    /// All kinds, in lifecycle order.
    pub const ALL: [EventKind; 5] = [
        EventKind::Created,
        EventKind::PaymentRequested,
        EventKind::PaymentSucceeded,
        EventKind::PaymentFailed,
        EventKind::NotificationSent,
    ];

    /// Stable wire name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::PaymentRequested => "payment_requested",
            EventKind::PaymentSucceeded => "payment_succeeded",
            EventKind::PaymentFailed => "payment_failed",
            EventKind::NotificationSent => "notification_sent",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DomainError::Validation(format!("unknown event kind: {s:?}")))
    }
}

/// An immutable, committed order event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderEvent {
    /// Globally unique event identifier.
    pub event_id: Uuid,
    /// The order this event belongs to.
    pub order_id: String,
    /// Lifecycle stage.
    pub kind: EventKind,
    /// Opaque producer payload, passed through unchanged.
    pub payload: Vec<u8>,
    /// Position within the order's stream, starting at 1 with no gaps.
    pub sequence: u64,
    /// Time the store accepted the event.
    pub occurred_at: DateTime<Utc>,
}

/// A producer's request to append an event.
#[derive(Debug, Clone)]
pub struct NewOrderEvent {
    /// The order to append to.
    pub order_id: String,
    /// Lifecycle stage.
    pub kind: EventKind,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// Optional optimistic-concurrency guard: the sequence the producer
    /// expects this event to receive.
    pub expected_sequence: Option<u64>,
}

impl NewOrderEvent {
    /// Creates an append request that takes whatever sequence is next.
    pub fn new(order_id: impl Into<String>, kind: EventKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            order_id: order_id.into(),
            kind,
            payload: payload.into(),
            expected_sequence: None,
        }
    }

    /// Requires the appended event to receive exactly `sequence`.
    #[must_use]
    pub fn expecting(mut self, sequence: u64) -> Self {
        self.expected_sequence = Some(sequence);
        self
    }

    /// Rejects requests that cannot be appended.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a blank order id or a zero
    /// expected sequence.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.order_id.trim().is_empty() {
            return Err(DomainError::Validation("order id must not be empty".into()));
        }
        if self.expected_sequence == Some(0) {
            return Err(DomainError::Validation(
                "expected sequence starts at 1".into(),
            ));
        }
        Ok(())
    }
}

/// Position in the global append log. Holds the offset of the last entry
/// consumed; `EventCursor::START` reads from the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventCursor(pub u64);

impl EventCursor {
    /// Cursor positioned before the first entry.
    pub const START: EventCursor = EventCursor(0);
}

/// An event together with its global append offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Global append offset, starting at 1.
    pub offset: u64,
    /// The committed event.
    pub event: OrderEvent,
}

impl LogEntry {
    /// Cursor that resumes reading after this entry.
    #[must_use]
    pub fn cursor(&self) -> EventCursor {
        EventCursor(self.offset)
    }
}
