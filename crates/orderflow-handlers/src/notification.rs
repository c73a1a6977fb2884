//! Customer notifications.

use std::sync::Arc;

use async_trait::async_trait;
use orderflow_core::event::{EventKind, NewOrderEvent, OrderEvent};
use orderflow_core::handler::{Ack, HandlerError, OrderEventHandler};
use orderflow_core::repository::EventStore;
use orderflow_idempotency::DedupCache;
use thiserror::Error;
use tracing::{info, instrument};

use crate::keys::notification_key;

/// A message to the customer about an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The order concerned.
    pub order_id: String,
    /// The event being reported.
    pub about: EventKind,
    /// Human-readable text.
    pub message: String,
}

impl Notification {
    fn for_event(event: &OrderEvent) -> Self {
        let message = match event.kind {
            EventKind::Created => format!("Order {} was received.", event.order_id),
            EventKind::PaymentSucceeded => {
                format!("Payment for order {} went through.", event.order_id)
            }
            EventKind::PaymentFailed => {
                format!("Payment for order {} was declined.", event.order_id)
            }
            other => format!("Order {} update: {other}.", event.order_id),
        };
        Self {
            order_id: event.order_id.clone(),
            about: event.kind,
            message,
        }
    }
}

/// Why a notification was not sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// The recipient can never be reached, e.g. no contact address.
    #[error("notification rejected: {0}")]
    Rejected(String),

    /// The channel is temporarily down.
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
}

/// The outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends `notification`.
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// A notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            order_id = %notification.order_id,
            about = %notification.about,
            message = %notification.message,
            "notification sent"
        );
        Ok(())
    }
}

/// Tells the customer about order milestones and records each message as a
/// `NotificationSent` event.
pub struct NotificationHandler {
    store: Arc<dyn EventStore>,
    notifier: Arc<dyn Notifier>,
    dedup: Arc<DedupCache>,
}

impl NotificationHandler {
    /// Handler id the notification handler subscribes under.
    pub const HANDLER_ID: &'static str = "notification";

    /// Kinds the handler acts on.
    pub const EVENT_KINDS: [EventKind; 3] = [
        EventKind::Created,
        EventKind::PaymentSucceeded,
        EventKind::PaymentFailed,
    ];

    /// Creates a handler that appends its results to `store`.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        notifier: Arc<dyn Notifier>,
        dedup: Arc<DedupCache>,
    ) -> Self {
        Self {
            store,
            notifier,
            dedup,
        }
    }
}

#[async_trait]
impl OrderEventHandler for NotificationHandler {
    fn handler_id(&self) -> &str {
        Self::HANDLER_ID
    }

    #[instrument(skip(self, event), fields(event_id = %event.event_id, order_id = %event.order_id))]
    async fn handle(&self, event: &OrderEvent) -> Result<Ack, HandlerError> {
        // Never notify about our own notifications.
        if !Self::EVENT_KINDS.contains(&event.kind) {
            return Ok(Ack::new());
        }

        let key = notification_key(event.event_id);
        if self.dedup.seen(&key) {
            info!("notification already sent; skipping");
            return Ok(Ack::with_key(key));
        }

        let notification = Notification::for_event(event);
        self.notifier
            .notify(&notification)
            .await
            .map_err(|e| match e {
                NotifyError::Rejected(_) => HandlerError::Permanent(e.to_string()),
                NotifyError::Unavailable(_) => HandlerError::Transient(e.to_string()),
            })?;

        let payload = serde_json::to_vec(&serde_json::json!({
            "about": event.kind,
            "eventId": event.event_id,
        }))
        .map_err(|e| HandlerError::Permanent(format!("payload serialization failed: {e}")))?;
        self.store
            .append(NewOrderEvent::new(
                event.order_id.clone(),
                EventKind::NotificationSent,
                payload,
            ))
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))?;

        Ok(Ack::with_key(key))
    }
}
