//! Dedup cache configuration.

use std::time::Duration;

use orderflow_core::subscription::DeliveryPolicy;
use serde::Deserialize;

/// Default number of keys held before the oldest is evicted.
pub const DEFAULT_CAPACITY: usize = 100_000;

/// Bounds on the dedup cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Maximum number of keys retained. The oldest key is evicted first.
    pub capacity: usize,
    /// How long a key is remembered after it was marked.
    #[serde(rename = "horizon_ms", deserialize_with = "millis")]
    pub horizon: Duration,
}

impl DedupConfig {
    /// A configuration whose horizon covers every redelivery `policy` allows.
    #[must_use]
    pub fn for_policy(policy: &DeliveryPolicy) -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            horizon: policy.redelivery_window(),
        }
    }

    /// Replaces the key capacity.
    #[must_use]
    pub fn with_capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Widens the horizon so it also covers `policy`.
    #[must_use]
    pub fn covering(self, policy: &DeliveryPolicy) -> Self {
        Self {
            horizon: self.horizon.max(policy.redelivery_window()),
            ..self
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self::for_policy(&DeliveryPolicy::default())
    }
}

fn millis<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
