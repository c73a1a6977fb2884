//! Orderflow API server entry point.

use std::sync::Arc;

use orderflow_api::config::AppConfig;
use orderflow_api::error::AppError;
use orderflow_api::state::AppState;
use orderflow_api::{retention, routes, telemetry};
use orderflow_core::clock::{Clock, SystemClock};
use orderflow_dispatch::Dispatcher;
use orderflow_event_store::SqliteStore;
use orderflow_handlers::{LogNotifier, LogPaymentGateway, NotificationHandler, PaymentHandler};
use orderflow_idempotency::DedupCache;
use orderflow_registry::SubscriptionRegistry;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let tracer_provider = telemetry::init(config.otlp_endpoint.as_deref())?;

    let result = serve(config).await;
    if let Err(e) = &result {
        error!(error = %e, "server stopped with an error");
    }

    telemetry::shutdown(tracer_provider);
    result
}

async fn serve(config: AppConfig) -> Result<(), AppError> {
    info!("Starting Orderflow API server");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(SqliteStore::connect(&config.store, clock.clone()).await?);
    let registry = Arc::new(SubscriptionRegistry::load(store.clone(), clock.clone()).await?);
    let dedup = Arc::new(DedupCache::new(config.dedup_config(), clock.clone()));

    let payment = PaymentHandler::new(store.clone(), Arc::new(LogPaymentGateway), dedup.clone());
    let notification =
        NotificationHandler::new(store.clone(), Arc::new(LogNotifier), dedup.clone());
    let dispatcher = Arc::new(
        Dispatcher::new(
            store.clone(),
            store.clone(),
            registry.clone(),
            clock.clone(),
            config.dispatcher,
        )
        .with_handler(Arc::new(payment))
        .with_handler(Arc::new(notification))
        .with_dedup(dedup),
    );

    register_configured_subscriptions(&config, &registry, &dispatcher).await?;

    // Background workers stop when this flips to true.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch_task = tokio::spawn(Arc::clone(&dispatcher).run(shutdown_rx.clone()));
    let compaction_task = tokio::spawn(retention::run_compaction(
        store.clone(),
        clock.clone(),
        config.retention,
        shutdown_rx,
    ));

    let app = routes::app(AppState::new(
        store.clone(),
        store.clone(),
        registry,
        dispatcher,
        clock,
    ));

    let addr = config.socket_addr()?;
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("HTTP server stopped; draining background workers");
    // Receivers may already be gone if a worker exited early.
    let _ = shutdown_tx.send(true);
    match dispatch_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "dispatcher stopped with an error"),
        Err(e) => error!(error = %e, "dispatcher task failed"),
    }
    if let Err(e) = compaction_task.await {
        error!(error = %e, "compaction task failed");
    }
    store.close().await;

    served.map_err(AppError::from)
}

/// Subscribes configured handlers that have no subscription yet. Existing
/// subscriptions, including ones changed through the API, are left alone.
async fn register_configured_subscriptions(
    config: &AppConfig,
    registry: &SubscriptionRegistry,
    dispatcher: &Dispatcher,
) -> Result<(), AppError> {
    for subscription in &config.subscriptions {
        if !dispatcher.has_handler(&subscription.handler_id) {
            return Err(AppError::Config(format!(
                "subscription for unknown handler {:?}; installed: {}",
                subscription.handler_id,
                dispatcher.handler_ids().join(", ")
            )));
        }
        if registry.get(&subscription.handler_id).is_some() {
            continue;
        }
        registry
            .register(
                &subscription.handler_id,
                subscription.event_kinds.clone(),
                subscription.delivery_policy,
            )
            .await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c; shutting down");
    }
    info!("shutdown requested");
}
