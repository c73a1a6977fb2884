//! `SQLite` implementation of the Orderflow storage traits.

use std::str::FromStr;
use std::sync::Arc;

use orderflow_core::clock::Clock;
use orderflow_core::error::DomainError;
use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tokio::sync::watch;
use tracing::info;

use crate::config::SqliteStoreConfig;

static MIGRATOR: Migrator = sqlx::migrate!();

/// SQLite-backed store for events, deliveries, and subscriptions.
///
/// Writes are committed with `synchronous = FULL` in WAL mode, so an append
/// that returned survives a crash and readers never block the writer.
#[derive(Clone)]
pub struct SqliteStore {
    pub(crate) pool: SqlitePool,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) head: Arc<watch::Sender<u64>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("pool", &self.pool)
            .field("head", &*self.head.borrow())
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (creating if needed) the database described by `config` and runs
    /// pending migrations.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Storage` if the URL is invalid, the database
    /// cannot be opened, or a migration fails.
    pub async fn connect(
        config: &SqliteStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DomainError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(storage_error)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(storage_error)?;

        info!(database_url = %config.database_url, "opened event store");
        Self::from_pool(pool, clock).await
    }

    /// Opens a private in-memory database. Everything is lost on drop.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Storage` if the database cannot be created.
    pub async fn in_memory(clock: Arc<dyn Clock>) -> Result<Self, DomainError> {
        // Every connection to `:memory:` is a separate database, so the pool
        // holds exactly one connection for its whole lifetime.
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(storage_error)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(storage_error)?;
        Self::from_pool(pool, clock).await
    }

    /// Wraps an existing pool, running pending migrations.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Storage` if a migration or the head lookup fails.
    pub async fn from_pool(pool: SqlitePool, clock: Arc<dyn Clock>) -> Result<Self, DomainError> {
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| DomainError::Storage(format!("migration failed: {e}")))?;

        // The AUTOINCREMENT high-water mark survives compaction of the
        // newest events, unlike MAX(log_offset).
        let head: Option<i64> =
            sqlx::query_scalar("SELECT seq FROM sqlite_sequence WHERE name = 'events'")
                .fetch_optional(&pool)
                .await
                .map_err(storage_error)?;
        let (head_tx, _) = watch::channel(from_db(head.unwrap_or(0))?);

        Ok(Self {
            pool,
            clock,
            head: Arc::new(head_tx),
        })
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Publishes a newly committed offset without ever moving the head back.
    pub(crate) fn publish_head(&self, offset: u64) {
        self.head.send_if_modified(|head| {
            if offset > *head {
                *head = offset;
                true
            } else {
                false
            }
        });
    }
}

pub(crate) fn storage_error(err: sqlx::Error) -> DomainError {
    DomainError::Storage(err.to_string())
}

/// Converts an unsigned domain value to an `SQLite` integer.
pub(crate) fn to_db(value: u64) -> Result<i64, DomainError> {
    i64::try_from(value).map_err(|_| DomainError::Storage(format!("{value} exceeds i64")))
}

/// Converts an `SQLite` integer to an unsigned domain value.
pub(crate) fn from_db(value: i64) -> Result<u64, DomainError> {
    u64::try_from(value).map_err(|_| DomainError::Storage(format!("negative value {value}")))
}
