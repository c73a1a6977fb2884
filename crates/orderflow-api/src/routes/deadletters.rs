//! Dead-letter inspection and manual retry.

use axum::extract::{Path, Query, State};
use axum::{Json, Router, routing::get, routing::post};
use orderflow_core::clock::Clock;
use orderflow_core::delivery::DeliveryRecord;
use orderflow_core::error::DomainError;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Records listed when `limit` is omitted.
pub const DEFAULT_LIMIT: usize = 100;

/// Query parameters for GET /deadletters.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Maximum records to return.
    pub limit: Option<usize>,
}

/// Query parameters for POST /deadletters/{eventId}/retry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryQuery {
    /// Restricts the retry to one handler.
    pub handler_id: Option<String>,
}

/// Response body for POST /deadletters/{eventId}/retry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    /// The retried event.
    pub event_id: Uuid,
    /// Records moved back to `Pending`.
    pub requeued: u64,
}

/// GET /deadletters
#[instrument(skip(state))]
async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DeliveryRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).max(1);
    Ok(Json(state.deliveries.dead_letters(limit).await?))
}

/// POST /deadletters/{eventId}/retry
#[instrument(skip(state, query), fields(handler_id = ?query.handler_id))]
async fn retry(
    State(state): State<AppState>,
    Path(event_id): Path<Uuid>,
    Query(query): Query<RetryQuery>,
) -> Result<Json<RetryResponse>, ApiError> {
    let requeued = state
        .deliveries
        .retry_dead_letters(event_id, query.handler_id.as_deref(), state.clock.now())
        .await?;
    if requeued == 0 {
        return Err(DomainError::NotFound(format!(
            "dead-lettered deliveries of event {event_id}"
        ))
        .into());
    }

    state.dispatcher.wake();
    info!(requeued, "dead letters requeued");

    Ok(Json(RetryResponse { event_id, requeued }))
}

/// Returns the router for dead-letter handling.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/deadletters", get(list))
        .route("/deadletters/{event_id}/retry", post(retry))
}
