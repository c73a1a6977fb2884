//! Store configuration.

use std::time::Duration;

use serde::Deserialize;

/// Connection settings for [`crate::SqliteStore`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SqliteStoreConfig {
    /// `SQLite` connection URL, e.g. `sqlite://orderflow.db`.
    pub database_url: String,
    /// Upper bound on pooled connections.
    pub max_connections: u32,
    /// How long a writer waits for the database lock, in milliseconds.
    #[serde(rename = "busy_timeout_ms", with = "millis")]
    pub busy_timeout: Duration,
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://orderflow.db".to_owned(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
