//! Routes for appending and replaying order events.

use axum::extract::{Query, State};
use axum::{Json, Router, routing::get};
use chrono::{DateTime, Utc};
use orderflow_core::error::DomainError;
use orderflow_core::event::{EventCursor, EventKind, LogEntry, NewOrderEvent, OrderEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Page size used when `limit` is omitted.
pub const DEFAULT_PAGE_SIZE: usize = 100;
/// Largest page a single read returns.
pub const MAX_PAGE_SIZE: usize = 1_000;

/// Request body for POST /events.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEventRequest {
    /// The order to append to.
    pub order_id: String,
    /// Lifecycle stage, e.g. `payment_requested`.
    pub kind: String,
    /// Producer payload, stored as given.
    #[serde(default)]
    pub payload: Value,
    /// Sequence the producer expects the event to receive.
    pub expected_sequence: Option<u64>,
}

/// A committed event as returned by the API.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventView {
    /// Globally unique event identifier.
    pub event_id: Uuid,
    /// The order the event belongs to.
    pub order_id: String,
    /// Lifecycle stage.
    pub kind: EventKind,
    /// Producer payload.
    pub payload: Value,
    /// Position within the order's stream.
    pub sequence: u64,
    /// Time the store accepted the event.
    pub occurred_at: DateTime<Utc>,
}

impl From<OrderEvent> for EventView {
    fn from(event: OrderEvent) -> Self {
        Self {
            payload: decode_payload(&event.payload),
            event_id: event.event_id,
            order_id: event.order_id,
            kind: event.kind,
            sequence: event.sequence,
            occurred_at: event.occurred_at,
        }
    }
}

/// An event with its position in the global log.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntryView {
    /// Global append offset.
    pub offset: u64,
    /// The event.
    #[serde(flatten)]
    pub event: EventView,
}

impl From<LogEntry> for LogEntryView {
    fn from(entry: LogEntry) -> Self {
        Self {
            offset: entry.offset,
            event: entry.event.into(),
        }
    }
}

/// Response body for GET /events.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    /// Entries after the requested cursor, in append order.
    pub entries: Vec<LogEntryView>,
    /// Cursor to pass as `after` for the next page.
    pub next: EventCursor,
}

/// Query parameters for GET /events.
#[derive(Debug, Deserialize)]
pub struct ReadEventsQuery {
    /// Offset of the last entry already read; 0 reads from the start.
    #[serde(default)]
    pub after: u64,
    /// Maximum entries to return.
    pub limit: Option<usize>,
}

fn encode_payload(payload: &Value) -> Result<Vec<u8>, DomainError> {
    if payload.is_null() {
        return Ok(Vec::new());
    }
    serde_json::to_vec(payload)
        .map_err(|e| DomainError::Validation(format!("payload is not serializable: {e}")))
}

/// Payloads written through the API are JSON; anything else is shown as text
/// when it is valid UTF-8.
fn decode_payload(payload: &[u8]) -> Value {
    if payload.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(payload).unwrap_or_else(|_| {
        std::str::from_utf8(payload).map_or(Value::Null, |text| Value::String(text.to_owned()))
    })
}

/// POST /events
#[instrument(skip(state, request), fields(order_id = %request.order_id, kind = %request.kind))]
async fn append_event(
    State(state): State<AppState>,
    Json(request): Json<AppendEventRequest>,
) -> Result<Json<EventView>, ApiError> {
    let kind: EventKind = request.kind.parse()?;
    let mut new_event = NewOrderEvent::new(request.order_id, kind, encode_payload(&request.payload)?);
    new_event.expected_sequence = request.expected_sequence;

    let event = state.events.append(new_event).await?;
    info!(event_id = %event.event_id, sequence = event.sequence, "event appended");

    Ok(Json(event.into()))
}

/// GET /events
#[instrument(skip(state))]
async fn read_events(
    State(state): State<AppState>,
    Query(query): Query<ReadEventsQuery>,
) -> Result<Json<EventPage>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let after = EventCursor(query.after);

    let entries = state.events.read_from(after, limit).await?;
    let next = entries.last().map_or(after, LogEntry::cursor);

    Ok(Json(EventPage {
        entries: entries.into_iter().map(LogEntryView::from).collect(),
        next,
    }))
}

/// Returns the router for the event log.
pub fn router() -> Router<AppState> {
    Router::new().route("/events", get(read_events).post(append_event))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::StatusCode;
    use serde_json::json;

    use crate::routes::testing::{failing_state, send, sqlite_state};

    #[tokio::test]
    async fn test_append_returns_event_with_first_sequence() {
        // Arrange
        let (state, _) = sqlite_state().await;
        let app = router().with_state(state);
        let body = json!({ "orderId": "O1", "kind": "created", "payload": { "total": 42 } });

        // Act
        let (status, json) = send(app, "POST", "/events", Some(body)).await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["orderId"], "O1");
        assert_eq!(json["kind"], "created");
        assert_eq!(json["sequence"], 1);
        assert_eq!(json["payload"]["total"], 42);
        Uuid::parse_str(json["eventId"].as_str().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_append_rejects_unknown_kind() {
        let (state, _) = sqlite_state().await;
        let app = router().with_state(state);

        let (status, json) = send(
            app,
            "POST",
            "/events",
            Some(json!({ "orderId": "O1", "kind": "shipped" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_append_rejects_blank_order_id() {
        let (state, _) = sqlite_state().await;
        let app = router().with_state(state);

        let (status, _) = send(
            app,
            "POST",
            "/events",
            Some(json!({ "orderId": " ", "kind": "created" })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_append_with_stale_expected_sequence_returns_409() {
        // Arrange
        let (state, _) = sqlite_state().await;
        let first = json!({ "orderId": "O1", "kind": "created", "expectedSequence": 1 });
        send(router().with_state(state.clone()), "POST", "/events", Some(first.clone())).await;

        // Act
        let (status, json) = send(router().with_state(state), "POST", "/events", Some(first)).await;

        // Assert
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"], "sequence_conflict");
    }

    #[tokio::test]
    async fn test_append_returns_500_when_store_fails() {
        let app = router().with_state(failing_state().await);

        let (status, json) = send(
            app,
            "POST",
            "/events",
            Some(json!({ "orderId": "O1", "kind": "created" })),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "storage_error");
    }

    #[tokio::test]
    async fn test_read_pages_through_log() {
        // Arrange
        let (state, _) = sqlite_state().await;
        for kind in ["created", "payment_requested", "payment_succeeded"] {
            let body = json!({ "orderId": "O1", "kind": kind });
            send(router().with_state(state.clone()), "POST", "/events", Some(body)).await;
        }

        // Act
        let (status, first) =
            send(router().with_state(state.clone()), "GET", "/events?limit=2", None).await;
        let (_, rest) = send(router().with_state(state), "GET", "/events?after=2", None).await;

        // Assert
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["entries"].as_array().unwrap().len(), 2);
        assert_eq!(first["entries"][0]["offset"], 1);
        assert_eq!(first["next"], 2);
        assert_eq!(rest["entries"][0]["kind"], "payment_succeeded");
        assert_eq!(rest["next"], 3);
    }

    #[tokio::test]
    async fn test_read_past_head_keeps_cursor() {
        let (state, _) = sqlite_state().await;
        let app = router().with_state(state);

        let (_, json) = send(app, "GET", "/events?after=7", None).await;

        assert_eq!(json["entries"], json!([]));
        assert_eq!(json["next"], 7);
    }

    #[test]
    fn test_non_json_payload_is_shown_as_text() {
        assert_eq!(decode_payload(b"plain"), Value::String("plain".into()));
        assert_eq!(decode_payload(&[0xff, 0xfe]), Value::Null);
        assert_eq!(decode_payload(b""), Value::Null);
    }
}
