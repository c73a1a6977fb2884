//! Test handlers — scripted `OrderEventHandler` implementations for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use orderflow_core::event::OrderEvent;
use orderflow_core::handler::{Ack, HandlerError, OrderEventHandler};

/// A handler that replays a script of outcomes, one per invocation, then
/// falls back to a fixed outcome. Every delivered event is recorded.
#[derive(Debug)]
pub struct ScriptedHandler {
    id: String,
    script: Mutex<VecDeque<Result<Ack, HandlerError>>>,
    fallback: Mutex<Result<Ack, HandlerError>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<OrderEvent>>,
    completed: AtomicUsize,
}

impl ScriptedHandler {
    /// A handler that acknowledges every event.
    #[must_use]
    pub fn succeeding(id: &str) -> Self {
        Self::new(id, Vec::new(), Ok(Ack::new()))
    }

    /// A handler that fails transiently `times` times, then succeeds.
    #[must_use]
    pub fn failing_times(id: &str, times: usize) -> Self {
        let script = (0..times)
            .map(|n| Err(HandlerError::Transient(format!("scripted failure {}", n + 1))))
            .collect();
        Self::new(id, script, Ok(Ack::new()))
    }

    /// A handler that always fails transiently until `recover` is called.
    #[must_use]
    pub fn always_failing(id: &str) -> Self {
        Self::new(
            id,
            Vec::new(),
            Err(HandlerError::Transient("downstream unavailable".into())),
        )
    }

    /// A handler that rejects every event permanently.
    #[must_use]
    pub fn rejecting(id: &str) -> Self {
        Self::new(
            id,
            Vec::new(),
            Err(HandlerError::Permanent("event rejected".into())),
        )
    }

    /// A handler with an explicit script and fallback.
    #[must_use]
    pub fn new(
        id: &str,
        script: Vec<Result<Ack, HandlerError>>,
        fallback: Result<Ack, HandlerError>,
    ) -> Self {
        Self {
            id: id.to_owned(),
            script: Mutex::new(script.into()),
            fallback: Mutex::new(fallback),
            delay: None,
            calls: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        }
    }

    /// Sleep for `delay` inside every invocation before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// From now on, answer every unscripted invocation with success.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn recover(&self) {
        *self.fallback.lock().unwrap() = Ok(Ack::new());
    }

    /// Snapshot of every event this handler was invoked with, in call order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn calls(&self) -> Vec<OrderEvent> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of invocations so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Number of invocations that ran to the end, past any delay.
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderEventHandler for ScriptedHandler {
    fn handler_id(&self) -> &str {
        &self.id
    }

    async fn handle(&self, event: &OrderEvent) -> Result<Ack, HandlerError> {
        self.calls.lock().unwrap().push(event.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }
}

/// A handler that panics on every invocation.
#[derive(Debug)]
pub struct PanickingHandler(pub &'static str);

#[async_trait]
impl OrderEventHandler for PanickingHandler {
    fn handler_id(&self) -> &str {
        self.0
    }

    async fn handle(&self, event: &OrderEvent) -> Result<Ack, HandlerError> {
        panic!("handler {} blew up on event {}", self.0, event.event_id);
    }
}
