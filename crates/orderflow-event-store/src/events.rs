//! Event log operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orderflow_core::error::DomainError;
use orderflow_core::event::{EventCursor, LogEntry, NewOrderEvent, OrderEvent};
use orderflow_core::repository::EventStore;
use tokio::sync::watch;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::rows::{EventRow, to_millis, truncate_to_millis};
use crate::sqlite_store::{SqliteStore, from_db, storage_error, to_db};

// An event is eligible for compaction once it is older than the horizon, has
// been fanned out, and every one of its deliveries was delivered. Dead-lettered
// and failed records stay until they are retried.
const DELETE_COMPACTED_DELIVERIES: &str = r"
    DELETE FROM deliveries WHERE event_id IN (
        SELECT e.event_id FROM events e
        WHERE e.occurred_at < ?1
          AND e.log_offset <= (SELECT last_offset FROM dispatch_cursor WHERE id = 1)
          AND NOT EXISTS (
              SELECT 1 FROM deliveries d
              WHERE d.event_id = e.event_id AND d.state <> 'delivered'
          )
    )
";

const DELETE_COMPACTED_EVENTS: &str = r"
    DELETE FROM events
    WHERE occurred_at < ?1
      AND log_offset <= (SELECT last_offset FROM dispatch_cursor WHERE id = 1)
      AND NOT EXISTS (
          SELECT 1 FROM deliveries d
          WHERE d.event_id = events.event_id AND d.state <> 'delivered'
      )
";

#[async_trait]
impl EventStore for SqliteStore {
    #[instrument(skip(self, request), fields(order_id = %request.order_id, kind = %request.kind))]
    async fn append(&self, request: NewOrderEvent) -> Result<OrderEvent, DomainError> {
        request.validate()?;

        let occurred_at = truncate_to_millis(self.clock.now())?;
        let event_id = Uuid::now_v7();

        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        // The counter bump is the first write of the transaction, so the
        // database write lock is held from here until commit; the order's
        // sequence cannot move underneath us.
        let assigned: i64 = sqlx::query_scalar(
            r"
            INSERT INTO order_streams (order_id, last_sequence) VALUES (?1, 1)
            ON CONFLICT (order_id) DO UPDATE SET last_sequence = last_sequence + 1
            RETURNING last_sequence
            ",
        )
        .bind(&request.order_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_error)?;
        let sequence = from_db(assigned)?;

        if let Some(expected) = request.expected_sequence.filter(|&e| e != sequence) {
            tx.rollback().await.map_err(storage_error)?;
            return Err(DomainError::Conflict {
                order_id: request.order_id,
                expected,
                actual: sequence,
            });
        }

        let offset: i64 = sqlx::query_scalar(
            r"
            INSERT INTO events (event_id, order_id, kind, payload, sequence, occurred_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING log_offset
            ",
        )
        .bind(event_id)
        .bind(&request.order_id)
        .bind(request.kind.as_str())
        .bind(&request.payload)
        .bind(assigned)
        .bind(to_millis(occurred_at))
        .fetch_one(&mut *tx)
        .await
        .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)?;

        let offset = from_db(offset)?;
        self.publish_head(offset);
        debug!(%event_id, sequence, offset, "event appended");

        Ok(OrderEvent {
            event_id,
            order_id: request.order_id,
            kind: request.kind,
            payload: request.payload,
            sequence,
            occurred_at,
        })
    }

    async fn read_from(
        &self,
        cursor: EventCursor,
        limit: usize,
    ) -> Result<Vec<LogEntry>, DomainError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<EventRow> = sqlx::query_as(
            r"
            SELECT log_offset, event_id, order_id, kind, payload, sequence, occurred_at
            FROM events
            WHERE log_offset > ?1
            ORDER BY log_offset
            LIMIT ?2
            ",
        )
        .bind(to_db(cursor.0)?)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.into_iter().map(EventRow::into_entry).collect()
    }

    async fn load_event(&self, event_id: Uuid) -> Result<Option<OrderEvent>, DomainError> {
        let row: Option<EventRow> = sqlx::query_as(
            r"
            SELECT log_offset, event_id, order_id, kind, payload, sequence, occurred_at
            FROM events
            WHERE event_id = ?1
            ",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.map(EventRow::into_event).transpose()
    }

    async fn head(&self) -> Result<EventCursor, DomainError> {
        Ok(EventCursor(*self.head.borrow()))
    }

    fn append_notifications(&self) -> watch::Receiver<u64> {
        self.head.subscribe()
    }

    #[instrument(skip(self))]
    async fn compact(&self, horizon: DateTime<Utc>) -> Result<u64, DomainError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        sqlx::query(DELETE_COMPACTED_DELIVERIES)
            .bind(to_millis(horizon))
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;

        let removed = sqlx::query(DELETE_COMPACTED_EVENTS)
            .bind(to_millis(horizon))
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?
            .rows_affected();

        tx.commit().await.map_err(storage_error)?;

        if removed > 0 {
            info!(removed, %horizon, "compacted event log");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use orderflow_core::event::{EventKind, NewOrderEvent};
    use orderflow_core::repository::EventStore;
    use orderflow_test_support::FixedClock;

    use super::*;

    async fn store() -> SqliteStore {
        let clock = FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap());
        SqliteStore::in_memory(Arc::new(clock)).await.unwrap()
    }

    #[tokio::test]
    async fn test_append_assigns_gapless_sequences_per_order() {
        // Arrange
        let store = store().await;

        // Act
        let mut sequences = Vec::new();
        for kind in [EventKind::Created, EventKind::PaymentRequested, EventKind::PaymentSucceeded] {
            let event = store
                .append(NewOrderEvent::new("O1", kind, b"{}".to_vec()))
                .await
                .unwrap();
            sequences.push(event.sequence);
        }
        let other = store
            .append(NewOrderEvent::new("O2", EventKind::Created, Vec::new()))
            .await
            .unwrap();

        // Assert
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(other.sequence, 1);
    }

    #[tokio::test]
    async fn test_append_with_colliding_expected_sequence_conflicts() {
        // Arrange
        let store = store().await;
        store
            .append(NewOrderEvent::new("O1", EventKind::Created, Vec::new()))
            .await
            .unwrap();

        // Act
        let result = store
            .append(NewOrderEvent::new("O1", EventKind::PaymentRequested, Vec::new()).expecting(1))
            .await;

        // Assert
        match result {
            Err(DomainError::Conflict {
                order_id,
                expected,
                actual,
            }) => {
                assert_eq!(order_id, "O1");
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected Conflict, got {other:?}"),
        }

        // The rejected append must not burn a sequence number.
        let next = store
            .append(NewOrderEvent::new("O1", EventKind::PaymentRequested, Vec::new()).expecting(2))
            .await
            .unwrap();
        assert_eq!(next.sequence, 2);
    }

    #[tokio::test]
    async fn test_append_rejects_blank_order_id() {
        let store = store().await;

        let result = store
            .append(NewOrderEvent::new("", EventKind::Created, Vec::new()))
            .await;

        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert_eq!(store.head().await.unwrap(), EventCursor::START);
    }

    #[tokio::test]
    async fn test_read_from_returns_global_append_order_and_resumes() {
        // Arrange
        let store = store().await;
        let a1 = store
            .append(NewOrderEvent::new("A", EventKind::Created, Vec::new()))
            .await
            .unwrap();
        let b1 = store
            .append(NewOrderEvent::new("B", EventKind::Created, Vec::new()))
            .await
            .unwrap();
        let a2 = store
            .append(NewOrderEvent::new("A", EventKind::PaymentRequested, Vec::new()))
            .await
            .unwrap();

        // Act
        let first_page = store.read_from(EventCursor::START, 2).await.unwrap();
        let second_page = store
            .read_from(first_page[1].cursor(), 10)
            .await
            .unwrap();

        // Assert
        let ids: Vec<Uuid> = first_page
            .iter()
            .chain(second_page.iter())
            .map(|entry| entry.event.event_id)
            .collect();
        assert_eq!(ids, vec![a1.event_id, b1.event_id, a2.event_id]);
        assert_eq!(second_page[0].offset, 3);
    }

    #[tokio::test]
    async fn test_load_event_returns_committed_event() {
        let store = store().await;
        let appended = store
            .append(NewOrderEvent::new("O1", EventKind::Created, b"{\"total\":42}".to_vec()))
            .await
            .unwrap();

        let loaded = store.load_event(appended.event_id).await.unwrap();

        assert_eq!(loaded, Some(appended));
        assert_eq!(store.load_event(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_append_publishes_new_head() {
        let store = store().await;
        let mut notifications = store.append_notifications();

        store
            .append(NewOrderEvent::new("O1", EventKind::Created, Vec::new()))
            .await
            .unwrap();

        assert!(notifications.has_changed().unwrap());
        assert_eq!(*notifications.borrow_and_update(), 1);
        assert_eq!(store.head().await.unwrap(), EventCursor(1));
    }
}
