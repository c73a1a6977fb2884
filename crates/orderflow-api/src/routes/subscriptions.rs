//! Routes for managing handler subscriptions.

use std::collections::BTreeSet;

use axum::extract::{Path, State};
use axum::{Json, Router, routing::delete, routing::get};
use orderflow_core::error::DomainError;
use orderflow_core::event::EventKind;
use orderflow_core::subscription::{DeliveryPolicy, Subscription};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::ApiError;
use crate::state::AppState;

/// Request body for POST /subscriptions.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// An installed handler implementation.
    pub handler_id: String,
    /// Kinds to deliver, by wire name.
    pub event_kinds: Vec<String>,
    /// Retry policy; the default policy when omitted.
    pub delivery_policy: Option<DeliveryPolicy>,
}

/// Response body for DELETE /subscriptions/{handlerId}.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterResponse {
    /// The removed handler.
    pub handler_id: String,
    /// Pending deliveries moved to the dead-letter state.
    pub dead_lettered: u64,
}

/// POST /subscriptions
#[instrument(skip(state, request), fields(handler_id = %request.handler_id))]
async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Subscription>, ApiError> {
    let handler_id = request.handler_id.trim();
    if !state.dispatcher.has_handler(handler_id) {
        return Err(DomainError::Validation(format!(
            "no handler implementation named {handler_id:?}; installed: {}",
            state.dispatcher.handler_ids().join(", ")
        ))
        .into());
    }
    let event_kinds = request
        .event_kinds
        .iter()
        .map(|kind| kind.parse())
        .collect::<Result<BTreeSet<EventKind>, DomainError>>()?;

    let subscription = state
        .registry
        .register(
            handler_id,
            event_kinds,
            request.delivery_policy.unwrap_or_default(),
        )
        .await?;
    info!("subscription saved");

    Ok(Json(Subscription::clone(&subscription)))
}

/// GET /subscriptions
async fn list(State(state): State<AppState>) -> Json<Vec<Subscription>> {
    Json(
        state
            .registry
            .snapshot()
            .iter()
            .map(|sub| Subscription::clone(sub))
            .collect(),
    )
}

/// DELETE /subscriptions/{handlerId}
#[instrument(skip(state))]
async fn unregister(
    State(state): State<AppState>,
    Path(handler_id): Path<String>,
) -> Result<Json<UnregisterResponse>, ApiError> {
    let removed = state.registry.unregister(&handler_id).await?;
    info!(dead_lettered = removed.dead_lettered, "subscription removed");

    Ok(Json(UnregisterResponse {
        handler_id: removed.handler_id,
        dead_lettered: removed.dead_lettered,
    }))
}

/// Returns the router for subscription management.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/subscriptions", get(list).post(register))
        .route("/subscriptions/{handler_id}", delete(unregister))
}
