//! Shared application state.

use std::sync::Arc;

use orderflow_core::clock::Clock;
use orderflow_core::repository::{DeliveryStore, EventStore};
use orderflow_dispatch::Dispatcher;
use orderflow_registry::SubscriptionRegistry;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The append-only event log.
    pub events: Arc<dyn EventStore>,
    /// Delivery records, read for audit and dead-letter retry.
    pub deliveries: Arc<dyn DeliveryStore>,
    /// Subscription lookup and management.
    pub registry: Arc<SubscriptionRegistry>,
    /// The running dispatcher, woken after manual retries.
    pub dispatcher: Arc<Dispatcher>,
    /// Clock used for retry timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventStore>,
        deliveries: Arc<dyn DeliveryStore>,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            events,
            deliveries,
            registry,
            dispatcher,
            clock,
        }
    }
}
