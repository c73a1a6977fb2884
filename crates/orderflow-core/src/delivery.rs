//! Delivery bookkeeping: one record per (event, handler) pair.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::event::LogEntry;

/// Where a delivery stands.
///
/// ```text
/// Pending --claim--> InFlight --ok--> Delivered
///    ^                  |
///    +----retry---------+--exhausted/permanent--> DeadLettered
/// ```
///
/// `Failed` is terminal for records whose event can no longer be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Waiting for `next_attempt_at`.
    Pending,
    /// Claimed by a worker; the handler is running.
    InFlight,
    /// The handler acknowledged the event.
    Delivered,
    /// The event could not be loaded for delivery.
    Failed,
    /// Retry budget exhausted, handler refused, or handler unregistered.
    DeadLettered,
}

impl DeliveryState {
    /// Stable storage name of the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "in_flight",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Failed => "failed",
            DeliveryState::DeadLettered => "dead_lettered",
        }
    }

    /// Whether no further transition happens without operator action.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered | DeliveryState::Failed | DeliveryState::DeadLettered
        )
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryState::Pending),
            "in_flight" => Ok(DeliveryState::InFlight),
            "delivered" => Ok(DeliveryState::Delivered),
            "failed" => Ok(DeliveryState::Failed),
            "dead_lettered" => Ok(DeliveryState::DeadLettered),
            other => Err(DomainError::Storage(format!(
                "unknown delivery state: {other:?}"
            ))),
        }
    }
}

/// Delivery state of one event to one handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    /// The delivered event.
    pub event_id: Uuid,
    /// The receiving handler.
    pub handler_id: String,
    /// Order of the event; with `handler_id` this forms the ordering lane.
    pub order_id: String,
    /// Sequence of the event within its order.
    pub sequence: u64,
    /// Global log offset of the event.
    pub event_offset: u64,
    /// Current state.
    pub state: DeliveryState,
    /// Completed handler invocations.
    pub attempts: u32,
    /// Earliest time the next attempt may start.
    pub next_attempt_at: DateTime<Utc>,
    /// Most recent failure, if any.
    pub last_error: Option<String>,
    /// Time of the last state change.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// A fresh record for `entry`, due immediately.
    #[must_use]
    pub fn pending(entry: &LogEntry, handler_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            event_id: entry.event.event_id,
            handler_id: handler_id.into(),
            order_id: entry.event.order_id.clone(),
            sequence: entry.event.sequence,
            event_offset: entry.offset,
            state: DeliveryState::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            updated_at: now,
        }
    }

    /// Records a successful attempt.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.state = DeliveryState::Delivered;
        self.updated_at = now;
    }

    /// Records a failed attempt. With `retry_at` the record goes back to
    /// `Pending`; without it the record is dead-lettered.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = Some(error.into());
        self.updated_at = now;
        match retry_at {
            Some(at) => {
                self.state = DeliveryState::Pending;
                self.next_attempt_at = at;
            }
            None => self.state = DeliveryState::DeadLettered,
        }
    }

    /// Marks the record undeliverable without counting an attempt.
    pub fn record_undeliverable(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.state = DeliveryState::Failed;
        self.last_error = Some(reason.into());
        self.updated_at = now;
    }
}
