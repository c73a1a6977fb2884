//! Idempotency key derivation.

use sha2::{Digest, Sha256};
use uuid::Uuid;

fn digest(scope: &str, subject: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update([0]);
    hasher.update(subject);
    format!("{scope}:{:x}", hasher.finalize())
}

/// Key for charging an order. At most one charge per order.
#[must_use]
pub fn payment_key(order_id: &str) -> String {
    digest("payment", order_id.as_bytes())
}

/// Key for the notification about one event.
#[must_use]
pub fn notification_key(event_id: Uuid) -> String {
    digest("notification", event_id.as_bytes())
}
