//! Storage abstractions for events, deliveries, and subscriptions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::delivery::DeliveryRecord;
use crate::error::DomainError;
use crate::event::{EventCursor, LogEntry, NewOrderEvent, OrderEvent};
use crate::subscription::Subscription;

/// Append-only log of order events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends an event, assigning the next sequence for its order. The event
    /// is committed before this returns.
    async fn append(&self, request: NewOrderEvent) -> Result<OrderEvent, DomainError>;

    /// Reads up to `limit` entries after `cursor`, in global append order.
    async fn read_from(
        &self,
        cursor: EventCursor,
        limit: usize,
    ) -> Result<Vec<LogEntry>, DomainError>;

    /// Loads a single event by id.
    async fn load_event(&self, event_id: Uuid) -> Result<Option<OrderEvent>, DomainError>;

    /// Cursor positioned at the newest committed entry.
    async fn head(&self) -> Result<EventCursor, DomainError>;

    /// Receiver that observes the newest committed offset after every append.
    fn append_notifications(&self) -> watch::Receiver<u64>;

    /// Removes events older than `horizon` whose deliveries were all
    /// delivered. Events with dead-lettered or failed records are kept.
    /// Returns the number of events removed.
    async fn compact(&self, horizon: DateTime<Utc>) -> Result<u64, DomainError>;
}

/// Durable delivery-state table owned by the dispatcher.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Offset of the last event already fanned out into delivery records.
    async fn fan_out_cursor(&self) -> Result<EventCursor, DomainError>;

    /// Inserts new `Pending` records and advances the fan-out cursor in one
    /// transaction. Records that already exist are left untouched. A record
    /// whose handler is no longer subscribed is inserted as `DeadLettered`.
    async fn commit_fan_out(
        &self,
        records: &[DeliveryRecord],
        cursor: EventCursor,
    ) -> Result<(), DomainError>;

    /// Moves up to `limit` due records to `InFlight` and returns them. Never
    /// claims a record whose lane has an earlier record still `Pending` or
    /// `InFlight`, or whose handler is no longer subscribed.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, DomainError>;

    /// Persists the outcome of an attempt on an `InFlight` record.
    async fn save_outcome(&self, record: &DeliveryRecord) -> Result<(), DomainError>;

    /// Returns every `InFlight` record to `Pending`, due at `now`.
    async fn requeue_in_flight(&self, now: DateTime<Utc>) -> Result<u64, DomainError>;

    /// Earliest `next_attempt_at` among records that `claim_due` could take.
    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, DomainError>;

    /// All records for an event, for audit.
    async fn deliveries_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<Vec<DeliveryRecord>, DomainError>;

    /// Records in `DeadLettered` or `Failed`, oldest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeliveryRecord>, DomainError>;

    /// Resets dead-lettered records of an event to `Pending` with zero
    /// attempts. Returns how many were requeued.
    async fn retry_dead_letters(
        &self,
        event_id: Uuid,
        handler_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, DomainError>;
}

/// Durable subscription table.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Loads every subscription.
    async fn load_subscriptions(&self) -> Result<Vec<Subscription>, DomainError>;

    /// Inserts or replaces a subscription.
    async fn save_subscription(&self, subscription: &Subscription) -> Result<(), DomainError>;

    /// Deletes a subscription and dead-letters the handler's pending records
    /// in the same transaction. Returns `None` if there was no subscription,
    /// otherwise the number of records dead-lettered.
    async fn delete_subscription(
        &self,
        handler_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, DomainError>;
}
