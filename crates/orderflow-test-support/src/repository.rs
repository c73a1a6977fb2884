//! Test stores — storage trait implementations for error-path tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orderflow_core::delivery::DeliveryRecord;
use orderflow_core::error::DomainError;
use orderflow_core::event::{EventCursor, LogEntry, NewOrderEvent, OrderEvent};
use orderflow_core::repository::{DeliveryStore, EventStore, SubscriptionStore};
use orderflow_core::subscription::Subscription;
use tokio::sync::watch;
use uuid::Uuid;

fn unavailable() -> DomainError {
    DomainError::Storage("connection refused".into())
}

/// A store whose every operation returns a storage error.
#[derive(Debug)]
pub struct FailingStore {
    head: watch::Sender<u64>,
}

impl FailingStore {
    /// Create a failing store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: watch::channel(0).0,
        }
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for FailingStore {
    async fn append(&self, _request: NewOrderEvent) -> Result<OrderEvent, DomainError> {
        Err(unavailable())
    }

    async fn read_from(
        &self,
        _cursor: EventCursor,
        _limit: usize,
    ) -> Result<Vec<LogEntry>, DomainError> {
        Err(unavailable())
    }

    async fn load_event(&self, _event_id: Uuid) -> Result<Option<OrderEvent>, DomainError> {
        Err(unavailable())
    }

    async fn head(&self) -> Result<EventCursor, DomainError> {
        Err(unavailable())
    }

    fn append_notifications(&self) -> watch::Receiver<u64> {
        self.head.subscribe()
    }

    async fn compact(&self, _horizon: DateTime<Utc>) -> Result<u64, DomainError> {
        Err(unavailable())
    }
}

#[async_trait]
impl DeliveryStore for FailingStore {
    async fn fan_out_cursor(&self) -> Result<EventCursor, DomainError> {
        Err(unavailable())
    }

    async fn commit_fan_out(
        &self,
        _records: &[DeliveryRecord],
        _cursor: EventCursor,
    ) -> Result<(), DomainError> {
        Err(unavailable())
    }

    async fn claim_due(
        &self,
        _now: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<DeliveryRecord>, DomainError> {
        Err(unavailable())
    }

    async fn save_outcome(&self, _record: &DeliveryRecord) -> Result<(), DomainError> {
        Err(unavailable())
    }

    async fn requeue_in_flight(&self, _now: DateTime<Utc>) -> Result<u64, DomainError> {
        Err(unavailable())
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, DomainError> {
        Err(unavailable())
    }

    async fn deliveries_for_event(
        &self,
        _event_id: Uuid,
    ) -> Result<Vec<DeliveryRecord>, DomainError> {
        Err(unavailable())
    }

    async fn dead_letters(&self, _limit: usize) -> Result<Vec<DeliveryRecord>, DomainError> {
        Err(unavailable())
    }

    async fn retry_dead_letters(
        &self,
        _event_id: Uuid,
        _handler_id: Option<&str>,
        _now: DateTime<Utc>,
    ) -> Result<u64, DomainError> {
        Err(unavailable())
    }
}

#[async_trait]
impl SubscriptionStore for FailingStore {
    async fn load_subscriptions(&self) -> Result<Vec<Subscription>, DomainError> {
        Err(unavailable())
    }

    async fn save_subscription(&self, _subscription: &Subscription) -> Result<(), DomainError> {
        Err(unavailable())
    }

    async fn delete_subscription(
        &self,
        _handler_id: &str,
        _now: DateTime<Utc>,
    ) -> Result<Option<u64>, DomainError> {
        Err(unavailable())
    }
}
