//! Bounded idempotency key cache.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use orderflow_core::clock::Clock;
use tracing::debug;

use crate::config::DedupConfig;

/// Remembers idempotency keys until they expire or are evicted.
///
/// Shared between the dispatcher and handlers behind an `Arc`.
pub struct DedupCache {
    config: DedupConfig,
    horizon: TimeDelta,
    clock: Arc<dyn Clock>,
    inner: Mutex<Entries>,
}

#[derive(Default)]
struct Entries {
    /// Key to the instant it expires.
    expires: HashMap<String, DateTime<Utc>>,
    /// Keys in the order they were marked. A key re-marked later leaves a
    /// stale entry behind, recognised by its expiry not matching `expires`.
    order: VecDeque<(String, DateTime<Utc>)>,
}

impl Entries {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        while let Some((_, expires_at)) = self.order.front() {
            if *expires_at > now {
                break;
            }
            if let Some((key, expires_at)) = self.order.pop_front() {
                self.remove_if_current(&key, expires_at);
            }
        }
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((key, expires_at)) = self.order.pop_front() {
            if self.remove_if_current(&key, expires_at) {
                return true;
            }
        }
        false
    }

    fn remove_if_current(&mut self, key: &str, expires_at: DateTime<Utc>) -> bool {
        if self.expires.get(key) == Some(&expires_at) {
            self.expires.remove(key);
            true
        } else {
            false
        }
    }

    /// Keeps only the newest order entry of each live key.
    fn drop_stale(&mut self) {
        let mut kept = HashSet::with_capacity(self.expires.len());
        let mut order = VecDeque::with_capacity(self.expires.len());
        for (key, expires_at) in self.order.drain(..).rev() {
            if self.expires.get(&key) == Some(&expires_at) && kept.insert(key.clone()) {
                order.push_front((key, expires_at));
            }
        }
        self.order = order;
    }
}

impl DedupCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(config: DedupConfig, clock: Arc<dyn Clock>) -> Self {
        let horizon = TimeDelta::from_std(config.horizon).unwrap_or(TimeDelta::MAX);
        Self {
            config,
            horizon,
            clock,
            inner: Mutex::new(Entries::default()),
        }
    }

    /// The bounds this cache enforces.
    #[must_use]
    pub fn config(&self) -> DedupConfig {
        self.config
    }

    /// Whether `key` was marked within the horizon.
    pub fn seen(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut entries = self.lock();
        entries.purge_expired(now);
        entries.expires.contains_key(key)
    }

    /// Records `key`, restarting its horizon if it was already present.
    pub fn mark_seen(&self, key: &str) {
        if self.config.capacity == 0 {
            return;
        }
        let now = self.clock.now();
        let expires_at = now.checked_add_signed(self.horizon).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut entries = self.lock();
        entries.purge_expired(now);
        entries.expires.insert(key.to_owned(), expires_at);
        entries.order.push_back((key.to_owned(), expires_at));

        while entries.expires.len() > self.config.capacity {
            if !entries.evict_oldest() {
                break;
            }
            debug!(capacity = self.config.capacity, "evicted oldest idempotency key");
        }
        if entries.order.len() > self.config.capacity.saturating_mul(2) {
            entries.drop_stale();
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        entries.purge_expired(now);
        entries.expires.len()
    }

    /// Whether no live key is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        // The entries stay consistent even if a holder panicked mid-update,
        // so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
