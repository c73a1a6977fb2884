//! Subscription table operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orderflow_core::error::DomainError;
use orderflow_core::repository::SubscriptionStore;
use orderflow_core::subscription::Subscription;
use tracing::{info, instrument};

use crate::rows::{SubscriptionRow, to_millis};
use crate::sqlite_store::{SqliteStore, storage_error, to_db};

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn load_subscriptions(&self) -> Result<Vec<Subscription>, DomainError> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            r"
            SELECT handler_id, event_kinds, max_attempts, backoff_base_ms, backoff_cap_ms,
                   registered_at
            FROM subscriptions
            ORDER BY handler_id
            ",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.into_iter().map(Subscription::try_from).collect()
    }

    #[instrument(skip(self, subscription), fields(handler_id = %subscription.handler_id))]
    async fn save_subscription(&self, subscription: &Subscription) -> Result<(), DomainError> {
        let event_kinds = serde_json::to_string(&subscription.event_kinds)
            .map_err(|e| DomainError::Storage(format!("event kinds serialization failed: {e}")))?;
        let policy = subscription.delivery_policy;

        sqlx::query(
            r"
            INSERT INTO subscriptions
                (handler_id, event_kinds, max_attempts, backoff_base_ms, backoff_cap_ms,
                 registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (handler_id) DO UPDATE SET
                event_kinds = excluded.event_kinds,
                max_attempts = excluded.max_attempts,
                backoff_base_ms = excluded.backoff_base_ms,
                backoff_cap_ms = excluded.backoff_cap_ms,
                registered_at = excluded.registered_at
            ",
        )
        .bind(&subscription.handler_id)
        .bind(event_kinds)
        .bind(i64::from(policy.max_attempts))
        .bind(to_db(policy.backoff_base_ms)?)
        .bind(to_db(policy.backoff_cap_ms)?)
        .bind(to_millis(subscription.registered_at))
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_subscription(
        &self,
        handler_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, DomainError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let deleted = sqlx::query("DELETE FROM subscriptions WHERE handler_id = ?1")
            .bind(handler_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?
            .rows_affected();

        if deleted == 0 {
            tx.rollback().await.map_err(storage_error)?;
            return Ok(None);
        }

        let drained = sqlx::query(
            r"
            UPDATE deliveries
            SET state = 'dead_lettered', last_error = 'handler unregistered', updated_at = ?2
            WHERE handler_id = ?1 AND state = 'pending'
            ",
        )
        .bind(handler_id)
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?
        .rows_affected();

        tx.commit().await.map_err(storage_error)?;

        info!(drained, "subscription removed");
        Ok(Some(drained))
    }
}
