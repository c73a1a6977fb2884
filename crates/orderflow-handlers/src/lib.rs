//! Orderflow Handlers — the downstream consumers shipped with the core.
//!
//! Each handler implements [`OrderEventHandler`], guards its side effect
//! with an idempotency key checked against the shared [`DedupCache`], and
//! records what it did by appending a follow-up event to the store.
//!
//! [`OrderEventHandler`]: orderflow_core::handler::OrderEventHandler
//! [`DedupCache`]: orderflow_idempotency::DedupCache

pub mod keys;
pub mod notification;
pub mod payment;

pub use notification::{LogNotifier, Notification, NotificationHandler, Notifier, NotifyError};
pub use payment::{GatewayError, LogPaymentGateway, PaymentGateway, PaymentHandler, PaymentReceipt};
