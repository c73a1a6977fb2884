//! Row types and conversions between `SQLite` rows and domain values.

use chrono::{DateTime, Utc};
use orderflow_core::delivery::DeliveryRecord;
use orderflow_core::error::DomainError;
use orderflow_core::event::{LogEntry, OrderEvent};
use orderflow_core::subscription::{DeliveryPolicy, Subscription};
use uuid::Uuid;

use crate::sqlite_store::from_db;

/// Timestamps are stored as Unix milliseconds so they compare numerically.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>, DomainError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| DomainError::Storage(format!("timestamp out of range: {millis}")))
}

/// Drops sub-millisecond precision so a value survives a storage round trip.
pub(crate) fn truncate_to_millis(at: DateTime<Utc>) -> Result<DateTime<Utc>, DomainError> {
    from_millis(to_millis(at))
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EventRow {
    pub log_offset: i64,
    pub event_id: Uuid,
    pub order_id: String,
    pub kind: String,
    pub payload: Vec<u8>,
    pub sequence: i64,
    pub occurred_at: i64,
}

impl EventRow {
    pub(crate) fn into_event(self) -> Result<OrderEvent, DomainError> {
        Ok(self.into_entry()?.event)
    }

    pub(crate) fn into_entry(self) -> Result<LogEntry, DomainError> {
        let kind = self
            .kind
            .parse()
            .map_err(|e| DomainError::Storage(format!("stored event kind is invalid: {e}")))?;
        Ok(LogEntry {
            offset: from_db(self.log_offset)?,
            event: OrderEvent {
                event_id: self.event_id,
                order_id: self.order_id,
                kind,
                payload: self.payload,
                sequence: from_db(self.sequence)?,
                occurred_at: from_millis(self.occurred_at)?,
            },
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct DeliveryRow {
    pub event_id: Uuid,
    pub handler_id: String,
    pub order_id: String,
    pub sequence: i64,
    pub event_offset: i64,
    pub state: String,
    pub attempts: i64,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

impl TryFrom<DeliveryRow> for DeliveryRecord {
    type Error = DomainError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        Ok(DeliveryRecord {
            event_id: row.event_id,
            handler_id: row.handler_id,
            order_id: row.order_id,
            sequence: from_db(row.sequence)?,
            event_offset: from_db(row.event_offset)?,
            state: row.state.parse()?,
            attempts: u32::try_from(row.attempts)
                .map_err(|_| DomainError::Storage(format!("invalid attempts {}", row.attempts)))?,
            next_attempt_at: from_millis(row.next_attempt_at)?,
            last_error: row.last_error,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

pub(crate) fn into_records(rows: Vec<DeliveryRow>) -> Result<Vec<DeliveryRecord>, DomainError> {
    rows.into_iter().map(DeliveryRecord::try_from).collect()
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SubscriptionRow {
    pub handler_id: String,
    pub event_kinds: String,
    pub max_attempts: i64,
    pub backoff_base_ms: i64,
    pub backoff_cap_ms: i64,
    pub registered_at: i64,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = DomainError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let event_kinds = serde_json::from_str(&row.event_kinds).map_err(|e| {
            DomainError::Storage(format!("stored event kinds are invalid: {e}"))
        })?;
        Ok(Subscription {
            handler_id: row.handler_id,
            event_kinds,
            delivery_policy: DeliveryPolicy {
                max_attempts: u32::try_from(row.max_attempts).map_err(|_| {
                    DomainError::Storage(format!("invalid max_attempts {}", row.max_attempts))
                })?,
                backoff_base_ms: from_db(row.backoff_base_ms)?,
                backoff_cap_ms: from_db(row.backoff_cap_ms)?,
            },
            registered_at: from_millis(row.registered_at)?,
        })
    }
}
