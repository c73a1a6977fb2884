//! The dispatch loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use orderflow_core::clock::Clock;
use orderflow_core::delivery::{DeliveryRecord, DeliveryState};
use orderflow_core::error::DomainError;
use orderflow_core::event::{LogEntry, OrderEvent};
use orderflow_core::handler::{Ack, HandlerError, OrderEventHandler};
use orderflow_core::repository::{DeliveryStore, EventStore};
use orderflow_core::rng::{DeterministicRng, SystemRng};
use orderflow_core::subscription::Subscription;
use orderflow_idempotency::DedupCache;
use orderflow_registry::SubscriptionRegistry;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::retry_delay;
use crate::config::DispatcherConfig;

/// What happened to one claimed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The handler acknowledged the event.
    Delivered,
    /// The attempt failed and another is scheduled.
    RetryScheduled(DateTime<Utc>),
    /// The delivery will not be retried without operator action.
    DeadLettered,
    /// The event could not be loaded.
    Failed,
}

/// Summary of one [`Dispatcher::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Delivery records created by fan-out.
    pub fanned_out: usize,
    /// Records claimed and attempted.
    pub claimed: usize,
    /// Attempts that ended in `Delivered`.
    pub delivered: usize,
    /// Attempts that failed and were rescheduled.
    pub retried: usize,
    /// Attempts that ended in `DeadLettered`.
    pub dead_lettered: usize,
    /// Records marked `Failed`.
    pub failed: usize,
}

impl TickReport {
    fn record(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.delivered += 1,
            DeliveryOutcome::RetryScheduled(_) => self.retried += 1,
            DeliveryOutcome::DeadLettered => self.dead_lettered += 1,
            DeliveryOutcome::Failed => self.failed += 1,
        }
    }
}

/// Moves committed events through fan-out, claim, and delivery.
///
/// One dispatcher owns a store's delivery table. Use [`Dispatcher::run`] for
/// the long-running loop, or [`Dispatcher::tick`] to drive single cycles.
pub struct Dispatcher {
    events: Arc<dyn EventStore>,
    deliveries: Arc<dyn DeliveryStore>,
    registry: Arc<SubscriptionRegistry>,
    handlers: HashMap<String, Arc<dyn OrderEventHandler>>,
    dedup: Option<Arc<DedupCache>>,
    clock: Arc<dyn Clock>,
    rng: Mutex<Box<dyn DeterministicRng>>,
    config: DispatcherConfig,
    wake: Notify,
    fan_out_lock: tokio::sync::Mutex<()>,
}

impl Dispatcher {
    /// Creates a dispatcher with no handlers.
    #[must_use]
    pub fn new(
        events: Arc<dyn EventStore>,
        deliveries: Arc<dyn DeliveryStore>,
        registry: Arc<SubscriptionRegistry>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            events,
            deliveries,
            registry,
            handlers: HashMap::new(),
            dedup: None,
            clock,
            rng: Mutex::new(Box::new(SystemRng::new())),
            config,
            wake: Notify::new(),
            fan_out_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Adds a handler implementation, keyed by its handler id.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn OrderEventHandler>) -> Self {
        self.handlers
            .insert(handler.handler_id().to_owned(), handler);
        self
    }

    /// Records acknowledged idempotency keys in `dedup`.
    #[must_use]
    pub fn with_dedup(mut self, dedup: Arc<DedupCache>) -> Self {
        self.dedup = Some(dedup);
        self
    }

    /// Replaces the jitter source.
    #[must_use]
    pub fn with_rng(mut self, rng: impl DeterministicRng + 'static) -> Self {
        self.rng = Mutex::new(Box::new(rng));
        self
    }

    /// Ids of the handler implementations this dispatcher can invoke.
    #[must_use]
    pub fn handler_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether a handler implementation with `handler_id` is installed.
    #[must_use]
    pub fn has_handler(&self, handler_id: &str) -> bool {
        self.handlers.contains_key(handler_id)
    }

    /// Wakes the loop so it claims newly due work immediately.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Returns every record left `InFlight` by a previous process to
    /// `Pending`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Storage` if the store fails.
    pub async fn recover(&self) -> Result<u64, DomainError> {
        let requeued = self.deliveries.requeue_in_flight(self.clock.now()).await?;
        if requeued > 0 {
            warn!(requeued, "requeued deliveries interrupted by a previous shutdown");
        }
        Ok(requeued)
    }

    /// Turns every event after the fan-out cursor into `Pending` delivery
    /// records for the handlers subscribed to its kind. Returns how many
    /// records were created.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Storage` if a read or the commit fails; the
    /// cursor is then left where it was.
    pub async fn fan_out(&self) -> Result<usize, DomainError> {
        let _guard = self.fan_out_lock.lock().await;
        let batch = self.config.fan_out_batch.max(1);
        let mut created = 0;

        loop {
            let cursor = self.deliveries.fan_out_cursor().await?;
            let entries = self.events.read_from(cursor, batch).await?;
            let Some(last) = entries.last().map(LogEntry::cursor) else {
                break;
            };

            let now = self.clock.now();
            let records: Vec<DeliveryRecord> = entries
                .iter()
                .flat_map(|entry| {
                    self.registry
                        .resolve(entry.event.kind)
                        .into_iter()
                        .map(move |handler_id| DeliveryRecord::pending(entry, handler_id, now))
                })
                .collect();

            self.deliveries.commit_fan_out(&records, last).await?;
            debug!(events = entries.len(), records = records.len(), cursor = last.0, "fanned out");
            created += records.len();

            if entries.len() < batch {
                break;
            }
        }
        Ok(created)
    }

    /// Runs one full cycle: fan-out, claim up to `workers` due records, and
    /// deliver them all, waiting for every outcome.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Storage` if fan-out or claiming fails. Delivery
    /// failures are recorded on the records, not returned.
    pub async fn tick(self: &Arc<Self>) -> Result<TickReport, DomainError> {
        let mut report = TickReport {
            fanned_out: self.fan_out().await?,
            ..TickReport::default()
        };

        let claimed = self
            .deliveries
            .claim_due(self.clock.now(), self.config.workers.max(1))
            .await?;
        report.claimed = claimed.len();

        let mut running = JoinSet::new();
        for record in claimed {
            let this = Arc::clone(self);
            running.spawn(async move { this.deliver(record).await });
        }
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(outcome) => report.record(&outcome),
                Err(e) => error!(error = %e, "delivery task failed"),
            }
        }
        Ok(report)
    }

    /// Runs the dispatch loop until `shutdown` becomes `true` or its sender
    /// is dropped.
    ///
    /// On start, deliveries interrupted by a previous process are requeued.
    /// On shutdown, no new work is claimed; in-flight deliveries get
    /// `shutdown_grace` to finish, after which they are aborted together with
    /// their handler tasks and requeued.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Storage` if recovery or the final requeue fails.
    /// Storage errors inside the loop are logged and retried.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), DomainError> {
        self.recover().await?;

        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut appends = self.events.append_notifications();
        let mut running: JoinSet<DeliveryOutcome> = JoinSet::new();
        info!(
            workers = self.config.workers,
            handlers = ?self.handler_ids(),
            "dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            // Mark the head as seen before fan-out so a concurrent append
            // still wakes the wait below.
            let _ = appends.borrow_and_update();

            if let Err(e) = self.fan_out().await {
                error!(error = %e, "fan-out failed");
            }
            self.claim_and_spawn(&permits, &mut running).await;

            let wait = self.next_wait(permits.available_permits() > 0).await;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Ok(()) = appends.changed() => {}
                () = self.wake.notified() => {}
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "delivery task failed");
                    }
                }
                () = tokio::time::sleep(wait) => {}
            }
        }

        self.drain(running).await
    }

    async fn claim_and_spawn(
        self: &Arc<Self>,
        permits: &Arc<Semaphore>,
        running: &mut JoinSet<DeliveryOutcome>,
    ) {
        let free = permits.available_permits();
        if free == 0 {
            return;
        }
        let claimed = match self.deliveries.claim_due(self.clock.now(), free).await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(error = %e, "claiming due deliveries failed");
                return;
            }
        };

        for record in claimed {
            let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
                // Unreachable while this loop is the only permit holder; the
                // record stays InFlight and is requeued on the next start.
                warn!(event_id = %record.event_id, handler_id = %record.handler_id, "no worker permit for claimed delivery");
                continue;
            };
            let this = Arc::clone(self);
            running.spawn(async move {
                let _permit = permit;
                this.deliver(record).await
            });
        }
    }

    /// How long the loop may sleep before the next record falls due.
    async fn next_wait(&self, can_claim: bool) -> Duration {
        let idle = self.config.idle_poll_interval;
        if !can_claim {
            return idle;
        }
        match self.deliveries.next_due_at().await {
            Ok(Some(due)) => (due - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(idle),
            Ok(None) => idle,
            Err(e) => {
                error!(error = %e, "looking up the next due delivery failed");
                idle
            }
        }
    }

    async fn drain(&self, mut running: JoinSet<DeliveryOutcome>) -> Result<(), DomainError> {
        info!(in_flight = running.len(), "dispatcher stopping");

        let grace = tokio::time::timeout(self.config.shutdown_grace, async {
            while running.join_next().await.is_some() {}
        })
        .await;

        if grace.is_err() {
            warn!(
                aborted = running.len(),
                "shutdown grace elapsed; aborting in-flight deliveries"
            );
            running.abort_all();
            while running.join_next().await.is_some() {}
            let requeued = self.deliveries.requeue_in_flight(self.clock.now()).await?;
            info!(requeued, "aborted deliveries returned to pending");
        }

        info!("dispatcher stopped");
        Ok(())
    }

    /// Attempts one claimed record and persists the outcome.
    #[instrument(
        skip(self, record),
        fields(
            event_id = %record.event_id,
            handler_id = %record.handler_id,
            order_id = %record.order_id,
            sequence = record.sequence,
            attempt = record.attempts + 1
        )
    )]
    async fn deliver(&self, mut record: DeliveryRecord) -> DeliveryOutcome {
        let event = match self.events.load_event(record.event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                error!("event no longer in the store; marking delivery failed");
                record.record_undeliverable("event not found", self.clock.now());
                self.save(&record).await;
                return DeliveryOutcome::Failed;
            }
            Err(e) => {
                // Not the handler's fault; retry without spending an attempt.
                warn!(error = %e, "loading event failed; delivery requeued");
                let retry_at = self.clock.now() + self.config.idle_poll_interval;
                record.state = DeliveryState::Pending;
                record.next_attempt_at = retry_at;
                record.updated_at = self.clock.now();
                self.save(&record).await;
                return DeliveryOutcome::RetryScheduled(retry_at);
            }
        };

        let result = match self.handlers.get(&record.handler_id) {
            Some(handler) => self.invoke(Arc::clone(handler), event).await,
            None => Err(HandlerError::Permanent(format!(
                "no handler implementation for {}",
                record.handler_id
            ))),
        };

        let now = self.clock.now();
        let outcome = match result {
            Ok(ack) => {
                record.record_success(now);
                self.remember(&ack);
                info!(attempts = record.attempts, "delivered");
                DeliveryOutcome::Delivered
            }
            Err(HandlerError::Permanent(reason)) => {
                record.record_failure(reason, None, now);
                warn!(error = ?record.last_error, "handler rejected event; dead-lettered");
                DeliveryOutcome::DeadLettered
            }
            Err(HandlerError::Transient(reason)) => {
                let subscription = self.registry.get(&record.handler_id);
                self.fail_attempt(&mut record, reason, subscription.as_deref(), now)
            }
        };

        self.save(&record).await;
        outcome
    }

    /// Runs the handler in its own task so a panic or a timeout is contained
    /// to this attempt.
    async fn invoke(
        &self,
        handler: Arc<dyn OrderEventHandler>,
        event: OrderEvent,
    ) -> Result<Ack, HandlerError> {
        let mut task = tokio::spawn(async move { handler.handle(&event).await });
        // Aborting this delivery (shutdown past its grace) also stops the
        // handler; the record is requeued and must not complete behind it.
        let _abort_on_drop = AbortOnDrop(task.abort_handle());

        match tokio::time::timeout(self.config.handler_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_panic() => {
                Err(HandlerError::Transient("handler panicked".into()))
            }
            Ok(Err(join_error)) => Err(HandlerError::Transient(format!(
                "handler task cancelled: {join_error}"
            ))),
            Err(_) => {
                Err(HandlerError::Transient(format!(
                    "handler timed out after {}ms",
                    self.config.handler_timeout.as_millis()
                )))
            }
        }
    }

    fn fail_attempt(
        &self,
        record: &mut DeliveryRecord,
        reason: String,
        subscription: Option<&Subscription>,
        now: DateTime<Utc>,
    ) -> DeliveryOutcome {
        let Some(subscription) = subscription else {
            record.record_failure(format!("{reason} (handler unregistered)"), None, now);
            warn!(error = ?record.last_error, "handler unregistered during attempt; dead-lettered");
            return DeliveryOutcome::DeadLettered;
        };

        let policy = &subscription.delivery_policy;
        let completed = record.attempts.saturating_add(1);
        if completed >= policy.max_attempts {
            record.record_failure(reason, None, now);
            warn!(
                attempts = completed,
                error = ?record.last_error,
                "retry budget exhausted; dead-lettered"
            );
            return DeliveryOutcome::DeadLettered;
        }

        let delay = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            retry_delay(policy, completed, rng.as_mut())
        };
        let retry_at = now + delay;
        record.record_failure(reason, Some(retry_at), now);
        warn!(
            attempts = completed,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = ?record.last_error,
            "attempt failed; retry scheduled"
        );
        DeliveryOutcome::RetryScheduled(retry_at)
    }

    fn remember(&self, ack: &Ack) {
        if let (Some(dedup), Some(key)) = (&self.dedup, &ack.idempotency_key) {
            dedup.mark_seen(key);
        }
    }

    async fn save(&self, record: &DeliveryRecord) {
        if let Err(e) = self.deliveries.save_outcome(record).await {
            // The record stays InFlight and is redelivered after the next
            // restart's recovery.
            error!(error = %e, state = %record.state, "persisting delivery outcome failed");
        }
    }
}

/// Aborts the wrapped task when dropped. Aborting a finished task is a no-op.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handler_ids())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
