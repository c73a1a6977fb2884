//! The subscription registry.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use orderflow_core::clock::Clock;
use orderflow_core::error::DomainError;
use orderflow_core::event::EventKind;
use orderflow_core::repository::SubscriptionStore;
use orderflow_core::subscription::{DeliveryPolicy, Subscription};
use tokio::sync::Mutex;
use tracing::{info, instrument};

/// Outcome of removing a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    /// The removed handler.
    pub handler_id: String,
    /// Pending deliveries moved to the dead-letter state.
    pub dead_lettered: u64,
}

/// In-memory subscription lookup backed by a durable store.
pub struct SubscriptionRegistry {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
    // Serializes persist-then-swap so memory applies writes in store order.
    writes: Mutex<()>,
}

impl SubscriptionRegistry {
    /// Hydrates a registry from every persisted subscription.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Storage` if the subscriptions cannot be loaded.
    pub async fn load(
        store: Arc<dyn SubscriptionStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DomainError> {
        let loaded = store.load_subscriptions().await?;
        info!(subscriptions = loaded.len(), "subscription registry loaded");
        let subscriptions = loaded
            .into_iter()
            .map(|sub| (sub.handler_id.clone(), Arc::new(sub)))
            .collect();
        Ok(Self {
            store,
            clock,
            subscriptions: RwLock::new(subscriptions),
            writes: Mutex::new(()),
        })
    }

    /// Registers `handler_id` for `event_kinds`, replacing any existing
    /// subscription of the same handler.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` for a blank handler id, an empty kind
    /// set, or an invalid policy, and `DomainError::Storage` if persisting
    /// fails. Nothing changes on error.
    #[instrument(skip(self, event_kinds, policy))]
    pub async fn register(
        &self,
        handler_id: &str,
        event_kinds: BTreeSet<EventKind>,
        policy: DeliveryPolicy,
    ) -> Result<Arc<Subscription>, DomainError> {
        let subscription = Subscription {
            handler_id: handler_id.trim().to_owned(),
            event_kinds,
            delivery_policy: policy,
            registered_at: self.clock.now(),
        };
        subscription.validate()?;

        let _guard = self.writes.lock().await;
        self.store.save_subscription(&subscription).await?;

        let subscription = Arc::new(subscription);
        self.write()
            .insert(subscription.handler_id.clone(), Arc::clone(&subscription));
        info!(
            kinds = subscription.event_kinds.len(),
            max_attempts = subscription.delivery_policy.max_attempts,
            "handler registered"
        );
        Ok(subscription)
    }

    /// Removes `handler_id`. Its pending deliveries are dead-lettered in the
    /// same transaction; deliveries already in flight run to completion.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::NotFound` if the handler is not registered and
    /// `DomainError::Storage` if the store fails.
    #[instrument(skip(self))]
    pub async fn unregister(&self, handler_id: &str) -> Result<Unregistered, DomainError> {
        let _guard = self.writes.lock().await;
        let dead_lettered = self
            .store
            .delete_subscription(handler_id, self.clock.now())
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("handler {handler_id}")))?;

        self.write().remove(handler_id);
        info!(dead_lettered, "handler unregistered");
        Ok(Unregistered {
            handler_id: handler_id.to_owned(),
            dead_lettered,
        })
    }

    /// Handlers subscribed to `kind`.
    #[must_use]
    pub fn resolve(&self, kind: EventKind) -> BTreeSet<String> {
        self.read()
            .values()
            .filter(|sub| sub.matches(kind))
            .map(|sub| sub.handler_id.clone())
            .collect()
    }

    /// The current subscription of `handler_id`, if any.
    #[must_use]
    pub fn get(&self, handler_id: &str) -> Option<Arc<Subscription>> {
        self.read().get(handler_id).cloned()
    }

    /// Every subscription, ordered by handler id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Subscription>> {
        let mut all: Vec<_> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.handler_id.cmp(&b.handler_id));
        all
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Subscription>>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Subscription>>> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscriptions", &self.read().len())
            .finish_non_exhaustive()
    }
}
