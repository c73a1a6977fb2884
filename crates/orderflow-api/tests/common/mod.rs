//! Shared test helpers for API integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use orderflow_api::routes;
use orderflow_api::state::AppState;
use orderflow_core::clock::Clock;
use orderflow_core::handler::OrderEventHandler;
use orderflow_dispatch::{Dispatcher, DispatcherConfig, TickReport};
use orderflow_event_store::SqliteStore;
use orderflow_handlers::{LogNotifier, LogPaymentGateway, NotificationHandler, PaymentHandler};
use orderflow_idempotency::{DedupCache, DedupConfig};
use orderflow_registry::SubscriptionRegistry;
use orderflow_test_support::{ManualClock, SequenceRng};
use tower::ServiceExt;

/// A wired application over an in-memory store. The dispatcher is not
/// running; tests drive it with [`TestApp::drain`].
pub struct TestApp {
    router: Router,
    pub store: Arc<SqliteStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub clock: Arc<ManualClock>,
}

impl TestApp {
    /// A router over the shared state.
    pub fn app(&self) -> Router {
        self.router.clone()
    }

    /// Ticks the dispatcher until a tick neither fans out nor claims anything.
    pub async fn drain(&self) -> TickReport {
        let mut total = TickReport::default();
        for _ in 0..20 {
            let report = self.dispatcher.tick().await.unwrap();
            if report.fanned_out == 0 && report.claimed == 0 {
                break;
            }
            total.fanned_out += report.fanned_out;
            total.claimed += report.claimed;
            total.delivered += report.delivered;
            total.retried += report.retried;
            total.dead_lettered += report.dead_lettered;
            total.failed += report.failed;
        }
        total
    }
}

/// Fixed start time used across all integration tests.
fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
    ))
}

/// Build the full app with the payment and notification handlers. Uses the
/// same router as `main.rs`.
pub async fn build_test_app() -> TestApp {
    build_test_app_with(|store, dedup| {
        let payment: Arc<dyn OrderEventHandler> = Arc::new(PaymentHandler::new(
            store.clone(),
            Arc::new(LogPaymentGateway),
            dedup.clone(),
        ));
        let notification: Arc<dyn OrderEventHandler> =
            Arc::new(NotificationHandler::new(store, Arc::new(LogNotifier), dedup));
        vec![payment, notification]
    })
    .await
}

/// Build the full app with handlers produced by `handlers`.
pub async fn build_test_app_with(
    handlers: impl FnOnce(Arc<SqliteStore>, Arc<DedupCache>) -> Vec<Arc<dyn OrderEventHandler>>,
) -> TestApp {
    let clock = manual_clock();
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let store = Arc::new(SqliteStore::in_memory(dyn_clock.clone()).await.unwrap());
    let registry = Arc::new(
        SubscriptionRegistry::load(store.clone(), dyn_clock.clone())
            .await
            .unwrap(),
    );
    let dedup = Arc::new(DedupCache::new(DedupConfig::default(), dyn_clock.clone()));

    let dispatcher = handlers(store.clone(), dedup.clone())
        .into_iter()
        .fold(
            Dispatcher::new(
                store.clone(),
                store.clone(),
                registry.clone(),
                dyn_clock.clone(),
                DispatcherConfig::default(),
            ),
            Dispatcher::with_handler,
        )
        .with_dedup(dedup)
        .with_rng(SequenceRng::new(vec![0.5]));
    let dispatcher = Arc::new(dispatcher);

    let state = AppState::new(
        store.clone(),
        store.clone(),
        registry,
        dispatcher.clone(),
        dyn_clock,
    );

    TestApp {
        router: routes::app(state),
        store,
        dispatcher,
        clock,
    }
}

/// Send a request with an optional JSON body and return the response.
pub async fn send_json(
    app: Router,
    method: &str,
    uri: &str,
    body: Option<&serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body_bytes).unwrap();

    (status, json)
}

/// Send a POST request with a JSON body and return the response.
pub async fn post_json(
    app: Router,
    uri: &str,
    body: &serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    send_json(app, "POST", uri, Some(body)).await
}

/// Send a GET request and return the response.
pub async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    send_json(app, "GET", uri, None).await
}

/// Send a DELETE request and return the response.
pub async fn delete_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    send_json(app, "DELETE", uri, None).await
}
