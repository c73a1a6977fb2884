//! Delivery-state table operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orderflow_core::delivery::{DeliveryRecord, DeliveryState};
use orderflow_core::error::DomainError;
use orderflow_core::event::EventCursor;
use orderflow_core::repository::DeliveryStore;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::rows::{DeliveryRow, from_millis, into_records, to_millis};
use crate::sqlite_store::{SqliteStore, from_db, storage_error, to_db};

const DELIVERY_COLUMNS: &str = "event_id, handler_id, order_id, sequence, event_offset, state, \
     attempts, next_attempt_at, last_error, updated_at";

// A pending record is claimable when its handler is still subscribed and its
// lane (order, handler) has nothing earlier still waiting and nothing running.
const CLAIMABLE: &str = r"
    d.state = 'pending'
    AND EXISTS (SELECT 1 FROM subscriptions s WHERE s.handler_id = d.handler_id)
    AND NOT EXISTS (
        SELECT 1 FROM deliveries p
        WHERE p.order_id = d.order_id
          AND p.handler_id = d.handler_id
          AND p.sequence < d.sequence
          AND p.state IN ('pending', 'in_flight')
    )
    AND NOT EXISTS (
        SELECT 1 FROM deliveries q
        WHERE q.order_id = d.order_id
          AND q.handler_id = d.handler_id
          AND q.state = 'in_flight'
    )
";

#[async_trait]
impl DeliveryStore for SqliteStore {
    async fn fan_out_cursor(&self) -> Result<EventCursor, DomainError> {
        let offset: i64 = sqlx::query_scalar("SELECT last_offset FROM dispatch_cursor WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(EventCursor(from_db(offset)?))
    }

    #[instrument(skip(self, records), fields(records = records.len(), cursor = cursor.0))]
    async fn commit_fan_out(
        &self,
        records: &[DeliveryRecord],
        cursor: EventCursor,
    ) -> Result<(), DomainError> {
        // The handler may have been unregistered after it was resolved; its
        // record then lands dead-lettered, as the unregistration drain would
        // have left it.
        let insert = format!(
            r"
            INSERT OR IGNORE INTO deliveries ({DELIVERY_COLUMNS})
            SELECT ?1, ?2, ?3, ?4, ?5,
                   CASE WHEN subscribed THEN ?6 ELSE 'dead_lettered' END,
                   ?7, ?8,
                   CASE WHEN subscribed THEN ?9 ELSE 'handler unregistered' END,
                   ?10
            FROM (SELECT EXISTS (SELECT 1 FROM subscriptions WHERE handler_id = ?2) AS subscribed)
            "
        );
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        for record in records {
            sqlx::query(&insert)
                .bind(record.event_id)
                .bind(&record.handler_id)
                .bind(&record.order_id)
                .bind(to_db(record.sequence)?)
                .bind(to_db(record.event_offset)?)
                .bind(record.state.as_str())
                .bind(i64::from(record.attempts))
                .bind(to_millis(record.next_attempt_at))
                .bind(record.last_error.as_deref())
                .bind(to_millis(record.updated_at))
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?;
        }

        sqlx::query("UPDATE dispatch_cursor SET last_offset = MAX(last_offset, ?1) WHERE id = 1")
            .bind(to_db(cursor.0)?)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, DomainError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        // One statement: the candidate subquery is materialized before any
        // row changes, and the write lock is taken up front.
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            r"
            UPDATE deliveries SET state = 'in_flight', updated_at = ?1
            WHERE rowid IN (
                SELECT d.rowid FROM deliveries d
                WHERE d.next_attempt_at <= ?1 AND {CLAIMABLE}
                ORDER BY d.next_attempt_at, d.event_offset
                LIMIT ?2
            )
            RETURNING {DELIVERY_COLUMNS}
            "
        ))
        .bind(to_millis(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        let mut records = into_records(rows)?;
        records.sort_by_key(|r| (r.next_attempt_at, r.event_offset));
        if !records.is_empty() {
            debug!(claimed = records.len(), "claimed due deliveries");
        }
        Ok(records)
    }

    async fn save_outcome(&self, record: &DeliveryRecord) -> Result<(), DomainError> {
        let updated = sqlx::query(
            r"
            UPDATE deliveries
            SET state = ?3, attempts = ?4, next_attempt_at = ?5, last_error = ?6, updated_at = ?7
            WHERE event_id = ?1 AND handler_id = ?2 AND state = 'in_flight'
            ",
        )
        .bind(record.event_id)
        .bind(&record.handler_id)
        .bind(record.state.as_str())
        .bind(i64::from(record.attempts))
        .bind(to_millis(record.next_attempt_at))
        .bind(record.last_error.as_deref())
        .bind(to_millis(record.updated_at))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?
        .rows_affected();

        if updated == 0 {
            warn!(
                event_id = %record.event_id,
                handler_id = %record.handler_id,
                "delivery was no longer in flight; outcome not recorded"
            );
        }
        Ok(())
    }

    async fn requeue_in_flight(&self, now: DateTime<Utc>) -> Result<u64, DomainError> {
        let requeued = sqlx::query(
            r"
            UPDATE deliveries SET state = 'pending', next_attempt_at = ?1, updated_at = ?1
            WHERE state = 'in_flight'
            ",
        )
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?
        .rows_affected();
        Ok(requeued)
    }

    async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>, DomainError> {
        let next: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MIN(d.next_attempt_at) FROM deliveries d WHERE {CLAIMABLE}"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        next.map(from_millis).transpose()
    }

    async fn deliveries_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<Vec<DeliveryRecord>, DomainError> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE event_id = ?1 ORDER BY handler_id"
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        into_records(rows)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeliveryRecord>, DomainError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<DeliveryRow> = sqlx::query_as(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries \
             WHERE state IN (?1, ?2) \
             ORDER BY updated_at, event_offset \
             LIMIT ?3"
        ))
        .bind(DeliveryState::DeadLettered.as_str())
        .bind(DeliveryState::Failed.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        into_records(rows)
    }

    #[instrument(skip(self))]
    async fn retry_dead_letters(
        &self,
        event_id: Uuid,
        handler_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, DomainError> {
        // Only records whose handler is still subscribed can be redelivered;
        // requeueing the others would leave them pending forever.
        let requeued = sqlx::query(
            r"
            UPDATE deliveries
            SET state = 'pending', attempts = 0, next_attempt_at = ?2, updated_at = ?2
            WHERE event_id = ?1
              AND state = 'dead_lettered'
              AND (?3 IS NULL OR handler_id = ?3)
              AND handler_id IN (SELECT handler_id FROM subscriptions)
            ",
        )
        .bind(event_id)
        .bind(to_millis(now))
        .bind(handler_id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?
        .rows_affected();

        Ok(requeued)
    }
}
