//! Dispatcher configuration.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Tuning for the dispatch loop. Durations are read as milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Handler invocations allowed to run at once.
    pub workers: usize,
    /// Longest a single handler invocation may run before it counts as a
    /// failed attempt.
    #[serde(rename = "handler_timeout_ms", deserialize_with = "millis")]
    pub handler_timeout: Duration,
    /// Upper bound on how long the loop sleeps without any other wake-up.
    #[serde(rename = "idle_poll_interval_ms", deserialize_with = "millis")]
    pub idle_poll_interval: Duration,
    /// How long shutdown waits for in-flight deliveries.
    #[serde(rename = "shutdown_grace_ms", deserialize_with = "millis")]
    pub shutdown_grace: Duration,
    /// Events read per fan-out page.
    pub fan_out_batch: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            handler_timeout: Duration::from_secs(30),
            idle_poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
            fan_out_batch: 500,
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
