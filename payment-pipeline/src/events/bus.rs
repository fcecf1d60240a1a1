//! In-process publish/subscribe.
//!
//! Handlers are registered per [`EventType`]. [`EventBus::publish`] hands the
//! event to every handler as its own task and returns immediately; there is no
//! ordering between handlers and no persistence, so a handler registered after
//! a publish never sees that event. Each handler invocation runs inside a
//! guard: an error or a panic is logged and counted, and neither reaches the
//! publisher or the other handlers.
//!
//! [`EventBus::publish_sync`] runs the handlers one after another on the
//! caller's task and stops at the first failure, which is returned.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::event::{Event, EventType};

pub type HandlerError = anyhow::Error;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    tasks: TaskTracker,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<H>(&self, event_type: EventType, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.subscribe_shared(event_type, Arc::new(handler));
    }

    pub fn subscribe_shared(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        tracing::debug!(
            event_type = %event_type,
            handler = handler.name(),
            "Subscribing event handler"
        );

        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    // Snapshot so no lock is held while handlers run.
    fn handlers_for(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Fan the event out to every subscribed handler, each on its own task.
    ///
    /// Returns the number of handlers dispatched. Must be called from within a
    /// Tokio runtime.
    pub fn publish(&self, event: Event) -> usize {
        let handlers = self.handlers_for(event.event_type());
        if handlers.is_empty() {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type(),
                "No handlers subscribed, dropping event"
            );
            return 0;
        }

        let event = Arc::new(event);
        for handler in &handlers {
            let span = tracing::info_span!(
                "event_handler",
                event_id = %event.id,
                event_type = %event.event_type(),
                handler = handler.name(),
            );
            self.tasks
                .spawn(run_guarded(handler.clone(), event.clone()).instrument(span));
        }

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type(),
            handlers = handlers.len(),
            "Event published"
        );

        handlers.len()
    }

    /// Run handlers sequentially on the calling task. The first error (or
    /// panic) stops the remaining handlers and is returned.
    pub async fn publish_sync(&self, event: Event) -> Result<(), HandlerError> {
        for handler in self.handlers_for(event.event_type()) {
            let outcome = AssertUnwindSafe(handler.handle(&event))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(anyhow::anyhow!(
                        "handler panicked: {}",
                        panic_message(panic.as_ref())
                    ))
                });

            if let Err(e) = outcome {
                record_failure(event.event_type());
                return Err(e.context(format!(
                    "handler '{}' failed on {} event {}",
                    handler.name(),
                    event.event_type(),
                    event.id
                )));
            }
        }

        Ok(())
    }

    /// Wait until every handler dispatched by `publish` so far has finished.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Wait for in-flight handlers during shutdown.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!("Event bus drained");
    }
}

async fn run_guarded(handler: Arc<dyn EventHandler>, event: Arc<Event>) {
    match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
        Ok(Ok(())) => {
            tracing::debug!("Event handled");
        }
        Ok(Err(e)) => {
            record_failure(event.event_type());
            tracing::error!(error = ?e, "Event handler failed");
        }
        Err(panic) => {
            record_failure(event.event_type());
            tracing::error!(
                panic = %panic_message(panic.as_ref()),
                "Event handler panicked"
            );
        }
    }
}

fn record_failure(event_type: EventType) {
    metrics::counter!("event_handler_failures_total", "event_type" => event_type.as_str())
        .increment(1);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
