//! Payment capture.

use std::sync::Arc;

use async_trait::async_trait;
use orderflow_core::event::{EventKind, NewOrderEvent, OrderEvent};
use orderflow_core::handler::{Ack, HandlerError, OrderEventHandler};
use orderflow_core::repository::EventStore;
use orderflow_idempotency::DedupCache;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::keys::payment_key;

/// Proof of a captured payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentReceipt {
    /// Gateway reference for the charge.
    pub reference: String,
}

/// Why a charge did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The payment was refused. Retrying will not help.
    #[error("payment declined: {0}")]
    Declined(String),

    /// The gateway could not be reached or failed internally.
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
}

/// The payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charges `order_id`. `idempotency_key` is stable across redeliveries
    /// so the provider can collapse duplicate charges.
    async fn charge(
        &self,
        order_id: &str,
        idempotency_key: &str,
        payload: &[u8],
    ) -> Result<PaymentReceipt, GatewayError>;
}

/// A gateway that accepts every charge and logs it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPaymentGateway;

#[async_trait]
impl PaymentGateway for LogPaymentGateway {
    async fn charge(
        &self,
        order_id: &str,
        idempotency_key: &str,
        payload: &[u8],
    ) -> Result<PaymentReceipt, GatewayError> {
        let reference = format!("pay_{}", Uuid::new_v4().simple());
        info!(order_id, idempotency_key, payload_bytes = payload.len(), %reference, "payment captured");
        Ok(PaymentReceipt { reference })
    }
}

/// Charges an order when payment is requested and records the result as
/// `PaymentSucceeded` or `PaymentFailed`.
pub struct PaymentHandler {
    store: Arc<dyn EventStore>,
    gateway: Arc<dyn PaymentGateway>,
    dedup: Arc<DedupCache>,
}

impl PaymentHandler {
    /// Handler id the payment handler subscribes under.
    pub const HANDLER_ID: &'static str = "payment";

    /// Kinds the handler acts on.
    pub const EVENT_KINDS: [EventKind; 1] = [EventKind::PaymentRequested];

    /// Creates a handler that appends its results to `store`.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        gateway: Arc<dyn PaymentGateway>,
        dedup: Arc<DedupCache>,
    ) -> Self {
        Self {
            store,
            gateway,
            dedup,
        }
    }

    async fn record(
        &self,
        order_id: &str,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<(), HandlerError> {
        let payload = serde_json::to_vec(&payload)
            .map_err(|e| HandlerError::Permanent(format!("payload serialization failed: {e}")))?;
        self.store
            .append(NewOrderEvent::new(order_id, kind, payload))
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl OrderEventHandler for PaymentHandler {
    fn handler_id(&self) -> &str {
        Self::HANDLER_ID
    }

    #[instrument(skip(self, event), fields(event_id = %event.event_id, order_id = %event.order_id))]
    async fn handle(&self, event: &OrderEvent) -> Result<Ack, HandlerError> {
        if event.kind != EventKind::PaymentRequested {
            return Ok(Ack::new());
        }

        let key = payment_key(&event.order_id);
        if self.dedup.seen(&key) {
            info!("order already charged; skipping");
            return Ok(Ack::with_key(key));
        }

        match self
            .gateway
            .charge(&event.order_id, &key, &event.payload)
            .await
        {
            Ok(receipt) => {
                self.record(
                    &event.order_id,
                    EventKind::PaymentSucceeded,
                    serde_json::json!({ "reference": receipt.reference }),
                )
                .await?;
                info!(reference = %receipt.reference, "payment succeeded");
                Ok(Ack::with_key(key))
            }
            Err(GatewayError::Declined(reason)) => {
                self.record(
                    &event.order_id,
                    EventKind::PaymentFailed,
                    serde_json::json!({ "reason": reason }),
                )
                .await?;
                warn!(%reason, "payment declined");
                // Nothing was charged, so a later request may charge again.
                Ok(Ack::new())
            }
            Err(e @ GatewayError::Unavailable(_)) => {
                Err(HandlerError::Transient(e.to_string()))
            }
        }
    }
}
