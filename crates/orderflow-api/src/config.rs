//! Server configuration.
//!
//! Settings come from an optional YAML file named by `ORDERFLOW_CONFIG`,
//! then `HOST`, `PORT`, `DATABASE_URL` and `OTEL_EXPORTER_OTLP_ENDPOINT`
//! override individual fields.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use orderflow_core::event::EventKind;
use orderflow_core::subscription::DeliveryPolicy;
use orderflow_dispatch::DispatcherConfig;
use orderflow_event_store::SqliteStoreConfig;
use orderflow_handlers::{NotificationHandler, PaymentHandler};
use orderflow_idempotency::DedupConfig;
use serde::{Deserialize, Deserializer};

use crate::error::AppError;

/// Environment variable naming the YAML configuration file.
pub const CONFIG_PATH_VAR: &str = "ORDERFLOW_CONFIG";

/// Everything the server needs to start.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Interface to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// Database settings.
    pub store: SqliteStoreConfig,
    /// Dispatch loop tuning.
    pub dispatcher: DispatcherConfig,
    /// Event retention.
    pub retention: RetentionConfig,
    /// Maximum idempotency keys remembered.
    pub dedup_capacity: usize,
    /// Subscriptions created at startup for handlers not yet registered.
    pub subscriptions: Vec<SubscriptionConfig>,
    /// OTLP gRPC endpoint; traces are only exported when set.
    pub otlp_endpoint: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 3000,
            store: SqliteStoreConfig::default(),
            dispatcher: DispatcherConfig::default(),
            retention: RetentionConfig::default(),
            dedup_capacity: orderflow_idempotency::config::DEFAULT_CAPACITY,
            subscriptions: vec![
                SubscriptionConfig::new(PaymentHandler::HANDLER_ID, &PaymentHandler::EVENT_KINDS),
                SubscriptionConfig::new(
                    NotificationHandler::HANDLER_ID,
                    &NotificationHandler::EVENT_KINDS,
                ),
            ],
            otlp_endpoint: None,
        }
    }
}

/// How long fully delivered events are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Minimum age before an event may be compacted.
    #[serde(rename = "horizon_ms", deserialize_with = "millis")]
    pub horizon: Duration,
    /// Time between compaction passes.
    #[serde(rename = "compaction_interval_ms", deserialize_with = "millis")]
    pub compaction_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            horizon: Duration::from_secs(7 * 24 * 60 * 60),
            compaction_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// A subscription declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionConfig {
    /// The handler to subscribe.
    pub handler_id: String,
    /// Kinds delivered to it.
    pub event_kinds: BTreeSet<EventKind>,
    /// Retry policy; the default policy when omitted.
    #[serde(default)]
    pub delivery_policy: DeliveryPolicy,
}

impl SubscriptionConfig {
    fn new(handler_id: &str, event_kinds: &[EventKind]) -> Self {
        Self {
            handler_id: handler_id.to_owned(),
            event_kinds: event_kinds.iter().copied().collect(),
            delivery_policy: DeliveryPolicy::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or parsed, an
    /// override is malformed, or the result fails validation.
    pub fn load() -> Result<Self, AppError> {
        Self::load_with(|name| std::env::var(name).ok())
    }

    /// Loads configuration, reading variables through `env`.
    ///
    /// # Errors
    ///
    /// See [`AppConfig::load`].
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = match env(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(&env)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML configuration file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }

    /// Parses YAML configuration text. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the text is not a valid configuration.
    pub fn from_yaml(text: &str) -> Result<Self, AppError> {
        serde_yaml::from_str(text).map_err(|e| AppError::Config(format!("invalid config: {e}")))
    }

    fn apply_overrides(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<(), AppError> {
        if let Some(host) = env("HOST") {
            self.host = host;
        }
        if let Some(port) = env("PORT") {
            self.port = port
                .parse()
                .map_err(|e| AppError::Config(format!("PORT must be a valid u16: {e}")))?;
        }
        if let Some(url) = env("DATABASE_URL") {
            self.store.database_url = url;
        }
        if let Some(endpoint) = env("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.otlp_endpoint = Some(endpoint);
        }
        Ok(())
    }

    /// Rejects settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first invalid setting.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.dispatcher.workers == 0 {
            return Err(AppError::Config("dispatcher.workers must be at least 1".into()));
        }
        if self.dispatcher.fan_out_batch == 0 {
            return Err(AppError::Config(
                "dispatcher.fan_out_batch must be at least 1".into(),
            ));
        }
        if self.retention.compaction_interval.is_zero() {
            return Err(AppError::Config(
                "retention.compaction_interval_ms must be positive".into(),
            ));
        }
        for subscription in &self.subscriptions {
            if subscription.event_kinds.is_empty() {
                return Err(AppError::Config(format!(
                    "subscription {:?} needs at least one event kind",
                    subscription.handler_id
                )));
            }
            subscription.delivery_policy.validate().map_err(|e| {
                AppError::Config(format!("subscription {:?}: {e}", subscription.handler_id))
            })?;
        }
        Ok(())
    }

    /// Address the server binds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if host and port do not form an address.
    pub fn socket_addr(&self) -> Result<SocketAddr, AppError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| AppError::Config(format!("invalid HOST:PORT combination: {e}")))
    }

    /// Dedup bounds whose horizon covers every configured subscription.
    #[must_use]
    pub fn dedup_config(&self) -> DedupConfig {
        self.subscriptions.iter().fold(
            DedupConfig::for_policy(&DeliveryPolicy::default()).with_capacity(self.dedup_capacity),
            |config, subscription| config.covering(&subscription.delivery_policy),
        )
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
