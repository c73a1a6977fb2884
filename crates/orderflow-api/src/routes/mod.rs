//! Route modules, one per resource.

pub mod deadletters;
pub mod deliveries;
pub mod events;
pub mod health;
pub mod subscriptions;

#[cfg(test)]
mod testing;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Builds the full application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(events::router())
        .merge(subscriptions::router())
        .merge(deliveries::router())
        .merge(deadletters::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
