//! State and request helpers for route unit tests.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use orderflow_core::clock::Clock;
use orderflow_core::repository::{DeliveryStore, EventStore};
use orderflow_dispatch::{Dispatcher, DispatcherConfig};
use orderflow_event_store::SqliteStore;
use orderflow_registry::SubscriptionRegistry;
use orderflow_test_support::{FailingStore, FixedClock, MockRng, ScriptedHandler};
use serde_json::Value;
use tower::ServiceExt;

use crate::state::AppState;

fn fixed_clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock(Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap()))
}

async fn state_with(
    events: Arc<dyn EventStore>,
    deliveries: Arc<dyn DeliveryStore>,
    subscriptions: Arc<SqliteStore>,
    clock: Arc<dyn Clock>,
) -> AppState {
    let registry = Arc::new(
        SubscriptionRegistry::load(subscriptions, clock.clone())
            .await
            .unwrap(),
    );
    let dispatcher = Dispatcher::new(
        events.clone(),
        deliveries.clone(),
        registry.clone(),
        clock.clone(),
        DispatcherConfig::default(),
    )
    .with_handler(Arc::new(ScriptedHandler::succeeding("payment")))
    .with_handler(Arc::new(ScriptedHandler::rejecting("refunds")))
    .with_rng(MockRng);
    AppState::new(events, deliveries, registry, Arc::new(dispatcher), clock)
}

/// State over one in-memory database, with `payment` and `refunds` handlers
/// installed but not subscribed.
pub(crate) async fn sqlite_state() -> (AppState, Arc<SqliteStore>) {
    let clock = fixed_clock();
    let store = Arc::new(SqliteStore::in_memory(clock.clone()).await.unwrap());
    let state = state_with(store.clone(), store.clone(), store.clone(), clock).await;
    (state, store)
}

/// State whose event and delivery stores fail every call.
pub(crate) async fn failing_state() -> AppState {
    let clock = fixed_clock();
    let subscriptions = Arc::new(SqliteStore::in_memory(clock.clone()).await.unwrap());
    let failing = Arc::new(FailingStore::new());
    state_with(failing.clone(), failing, subscriptions, clock).await
}

/// Sends one request and decodes the JSON response body.
pub(crate) async fn send(
    app: Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap()
    };

    (status, json)
}
