//! Delivery audit route.

use axum::extract::{Path, State};
use axum::{Json, Router, routing::get};
use orderflow_core::delivery::DeliveryRecord;
use orderflow_core::error::DomainError;
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Response body for GET /deliveries/{eventId}.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveriesResponse {
    /// The audited event.
    pub event_id: Uuid,
    /// One record per handler the event was fanned out to.
    pub deliveries: Vec<DeliveryRecord>,
}

/// GET /deliveries/{eventId}
#[instrument(skip(state))]
async fn deliveries_for_event(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<DeliveriesResponse>, ApiError> {
    let deliveries = state.deliveries.deliveries_for_event(event_id).await?;
    // An event with no subscribers, or not yet fanned out, has no records.
    if deliveries.is_empty() && state.events.load_event(event_id).await?.is_none() {
        return Err(DomainError::NotFound(format!("event {event_id}")).into());
    }

    Ok(Json(DeliveriesResponse {
        event_id,
        deliveries,
    }))
}

/// Returns the router for delivery audit.
pub fn router() -> Router<AppState> {
    Router::new().route("/deliveries/{event_id}", get(deliveries_for_event))
}
