//! Handler subscriptions and their delivery policies.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::event::EventKind;

/// Retry budget and backoff shape for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPolicy {
    /// Total handler invocations allowed before dead-lettering.
    #[serde(alias = "max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(alias = "backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on any single retry delay, in milliseconds.
    #[serde(alias = "backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl DeliveryPolicy {
    /// Delay before the first retry.
    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Upper bound on any retry delay.
    #[must_use]
    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Longest window over which a single delivery can still be redelivered.
    #[must_use]
    pub fn redelivery_window(&self) -> Duration {
        self.backoff_cap().saturating_mul(self.max_attempts)
    }

    /// Checks the policy is usable.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` if `max_attempts` is zero, the base is
    /// zero, or the cap is below the base.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.max_attempts == 0 {
            return Err(DomainError::Validation(
                "maxAttempts must be at least 1".into(),
            ));
        }
        if self.backoff_base_ms == 0 {
            return Err(DomainError::Validation(
                "backoffBaseMs must be positive".into(),
            ));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(DomainError::Validation(
                "backoffCapMs must not be below backoffBaseMs".into(),
            ));
        }
        Ok(())
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 60_000,
        }
    }
}

/// A handler's interest in a set of event kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// The subscribed handler.
    pub handler_id: String,
    /// Kinds delivered to the handler.
    pub event_kinds: BTreeSet<EventKind>,
    /// Retry policy for deliveries to this handler.
    pub delivery_policy: DeliveryPolicy,
    /// When this registration took effect.
    pub registered_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether events of `kind` are delivered to this handler.
    #[must_use]
    pub fn matches(&self, kind: EventKind) -> bool {
        self.event_kinds.contains(&kind)
    }

    /// Checks the subscription is usable.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a blank handler id, an empty kind
    /// set, or an invalid policy.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.handler_id.trim().is_empty() {
            return Err(DomainError::Validation("handler id must not be empty".into()));
        }
        if self.event_kinds.is_empty() {
            return Err(DomainError::Validation(
                "a subscription needs at least one event kind".into(),
            ));
        }
        self.delivery_policy.validate()
    }
}
