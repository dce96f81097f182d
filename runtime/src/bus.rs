//! The event bus: handler registry, publish entry point, and fan-out.
//!
//! # Publish Flow
//!
//! 1. Append the event to the [`EventLog`] (`PENDING`). A failed append is logged
//!    and counted, never returned: the event is still dispatched, without a
//!    durable record.
//! 2. Thread the new row's ID into the event metadata (`event_log_id`).
//! 3. Dispatch:
//!    - **Inline**: mark `PROCESSING`, run every handler in the caller's task,
//!      mark `PROCESSED`. Handler failures are logged and swallowed.
//!    - **Queued**: hand a [`DispatchTask`] to the [`DispatchQueue`]. If the queue
//!      refuses it (or none is configured), dispatch inline right away.
//!
//! # Fan-out Isolation
//!
//! Handlers run one at a time in subscription order. Each runs under
//! `catch_unwind`, so an `Err` *or* a panic in one handler is reported in the
//! [`DispatchReport`] and the remaining handlers still run.
//!
//! # Example
//!
//! ```
//! use herald_core::{Event, json};
//! use herald_runtime::{BusConfig, EventBus};
//! use herald_testing::InMemoryEventLog;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let bus = EventBus::new(Arc::new(InMemoryEventLog::new()), BusConfig::default());
//! bus.subscribe_fn("OrderPlaced", "audit", |event| {
//!     let id = event.event_log_id();
//!     async move {
//!         assert!(id.is_some());
//!         Ok(())
//!     }
//! });
//!
//! let receipt = bus.publish(Event::new("OrderPlaced", json!({ "order_id": 1 }))).await;
//! assert!(receipt.event_log_id.is_some());
//! # });
//! ```

use futures::FutureExt;
use herald_core::event::{Event, metadata_keys};
use herald_core::event_log::{EventLog, EventLogId};
use herald_core::handler::{EventHandler, handler_fn};
use herald_core::queue::{DispatchQueue, DispatchTask};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::config::{BusConfig, DispatchMode};
use crate::metrics::BusMetrics;

/// How `publish` ended up dispatching an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchRoute {
    /// Handlers ran in the publisher's task.
    Inline,
    /// The event was handed to the dispatch queue.
    Queued,
    /// Queued dispatch was configured but the queue refused the event, so
    /// handlers ran in the publisher's task.
    InlineFallback,
}

/// Outcome of a `publish` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// The event log row, or `None` if the append failed.
    pub event_log_id: Option<EventLogId>,
    /// Where the handlers ran (or will run).
    pub route: DispatchRoute,
}

/// A handler that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// [`EventHandler::name`] of the failing handler.
    pub handler: String,
    /// Correlation ID of the event, as logged with the failure.
    pub correlation_id: Option<String>,
    /// Error or panic message.
    pub error: String,
}

/// Result of running every handler for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Number of handlers invoked.
    pub invoked: usize,
    /// Handlers that failed, in invocation order.
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    /// Whether every handler succeeded. Zero handlers is a success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// One line naming every failed handler and its error.
    #[must_use]
    pub fn error_summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{}: {}", f.handler, f.error))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

type Registry = HashMap<String, Vec<Arc<dyn EventHandler>>>;

/// In-process publish/subscribe bus backed by a durable event log.
///
/// Construct one per process at the composition root and share it as
/// `Arc<EventBus>`.
pub struct EventBus {
    log: Arc<dyn EventLog>,
    queue: Option<Arc<dyn DispatchQueue>>,
    config: BusConfig,
    handlers: RwLock<Registry>,
}

impl EventBus {
    /// Create a bus over `log`. Without a queue, queued mode always falls back
    /// to inline dispatch.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>, config: BusConfig) -> Self {
        Self {
            log,
            queue: None,
            config,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Attach the queue used in [`DispatchMode::Queued`].
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn DispatchQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// The event log this bus records into.
    #[must_use]
    pub fn log(&self) -> Arc<dyn EventLog> {
        Arc::clone(&self.log)
    }

    /// The bus configuration.
    #[must_use]
    pub const fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Register `handler` for events named `event_name`.
    ///
    /// Handlers run in registration order. Registering the same handler twice
    /// makes it run twice.
    pub fn subscribe(&self, event_name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_name = event_name.into();
        tracing::debug!(event_name = %event_name, handler = handler.name(), "Handler subscribed");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_name)
            .or_default()
            .push(handler);
    }

    /// Register a closure as a named handler.
    pub fn subscribe_fn<F, Fut>(
        &self,
        event_name: impl Into<String>,
        handler_name: impl Into<String>,
        f: F,
    ) where
        F: Fn(&Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe(event_name, Arc::new(handler_fn(handler_name, f)));
    }

    /// Number of handlers registered for `event_name`.
    #[must_use]
    pub fn handler_count(&self, event_name: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Remove every registered handler.
    pub fn clear_subscribers(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn handlers_for(&self, event_name: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Record and dispatch an event. Never fails.
    #[tracing::instrument(
        skip(self, event),
        name = "bus_publish",
        fields(event_name = %event.name(), correlation_id = event.correlation_id())
    )]
    pub async fn publish(&self, event: Event) -> PublishReceipt {
        BusMetrics::record_publish();

        let event_log_id = match self.log.append(&event).await {
            Ok(record) => Some(record.id),
            Err(e) => {
                tracing::error!(
                    event_name = event.name(),
                    correlation_id = event.correlation_id(),
                    error = %e,
                    "event dispatched without durable record"
                );
                BusMetrics::record_unrecorded_dispatch();
                None
            }
        };

        let event = match event_log_id {
            Some(id) => event.with_metadata_entry(
                metadata_keys::EVENT_LOG_ID,
                serde_json::Value::from(id.value()),
            ),
            None => event,
        };

        let route = match (self.config.dispatch_mode, &self.queue) {
            (DispatchMode::Inline, _) => {
                self.dispatch_inline(&event, event_log_id).await;
                DispatchRoute::Inline
            }
            (DispatchMode::Queued, Some(queue)) => {
                let task = DispatchTask::first(event.to_serialized());
                match queue.enqueue(task, Duration::ZERO).await {
                    Ok(()) => {
                        tracing::debug!(event_log_id = ?event_log_id, "Event queued for dispatch");
                        DispatchRoute::Queued
                    }
                    Err(e) => {
                        tracing::warn!(
                            event_name = event.name(),
                            correlation_id = event.correlation_id(),
                            event_log_id = ?event_log_id,
                            error = %e,
                            "Enqueue failed, dispatching inline"
                        );
                        self.fall_back_inline(&event, event_log_id).await
                    }
                }
            }
            (DispatchMode::Queued, None) => {
                tracing::warn!(
                    event_name = event.name(),
                    "Queued dispatch configured without a queue, dispatching inline"
                );
                self.fall_back_inline(&event, event_log_id).await
            }
        };

        PublishReceipt {
            event_log_id,
            route,
        }
    }

    async fn fall_back_inline(&self, event: &Event, event_log_id: Option<EventLogId>) -> DispatchRoute {
        BusMetrics::record_enqueue_fallback();
        self.dispatch_inline(event, event_log_id).await;
        DispatchRoute::InlineFallback
    }

    /// Inline path: handler failures never surface, so the row always ends
    /// `PROCESSED` once every handler has run.
    async fn dispatch_inline(&self, event: &Event, event_log_id: Option<EventLogId>) {
        if let Some(id) = event_log_id {
            if let Err(e) = self.log.mark_processing(id).await {
                tracing::warn!(event_log_id = %id, error = %e, "Could not mark event processing");
            }
        }

        let report = self.dispatch_to_handlers(event).await;

        if let Some(id) = event_log_id {
            if let Err(e) = self.log.mark_processed(id).await {
                tracing::warn!(event_log_id = %id, error = %e, "Could not mark event processed");
            }
        }

        if !report.is_success() {
            tracing::debug!(
                event_log_id = ?event_log_id,
                failed = report.failures.len(),
                "Inline dispatch finished with isolated handler failures"
            );
        }
    }

    /// Run every handler registered for `event.name()`, in subscription order.
    ///
    /// Each handler is isolated: an error or panic is logged with the event name,
    /// correlation ID and handler name, recorded in the report, and the next
    /// handler runs. The registry lock is released before any handler runs.
    #[tracing::instrument(skip(self, event), name = "bus_dispatch", fields(event_name = %event.name()))]
    pub async fn dispatch_to_handlers(&self, event: &Event) -> DispatchReport {
        let handlers = self.handlers_for(event.name());
        let started = Instant::now();
        let mut report = DispatchReport::default();

        for handler in handlers {
            report.invoked += 1;

            let outcome = AssertUnwindSafe(async { handler.handle(event).await })
                .catch_unwind()
                .await;

            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
            };

            tracing::error!(
                event_name = event.name(),
                correlation_id = event.correlation_id(),
                event_log_id = ?event.event_log_id(),
                handler = handler.name(),
                error = %error,
                "Event handler failed"
            );
            BusMetrics::record_handler_failure(event.name(), handler.name());
            report.failures.push(HandlerFailure {
                handler: handler.name().to_string(),
                correlation_id: event.correlation_id().map(str::to_string),
                error,
            });
        }

        BusMetrics::record_dispatch(started.elapsed());
        report
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscriptions: usize = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum();
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("has_queue", &self.queue.is_some())
            .field("subscriptions", &subscriptions)
            .finish_non_exhaustive()
    }
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

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use herald_core::event_log::EventStatus;
    use herald_testing::{
        CallLog, FailingHandler, InMemoryEventLog, RecordingHandler, RecordingQueue,
    };
    use serde_json::json;

    fn bus(log: &Arc<InMemoryEventLog>) -> EventBus {
        EventBus::new(Arc::clone(log) as Arc<dyn EventLog>, BusConfig::default())
    }

    #[tokio::test]
    async fn no_subscribers_still_processes() {
        let log = Arc::new(InMemoryEventLog::new());
        let bus = bus(&log);

        let receipt = bus
            .publish(Event::new("OrderPlaced", json!({ "order_id": 1 })))
            .await;

        let id = receipt.event_log_id.unwrap();
        assert_eq!(receipt.route, DispatchRoute::Inline);
        assert_eq!(
            log.history(id),
            vec![EventStatus::Pending, EventStatus::Processing, EventStatus::Processed]
        );
    }

    #[tokio::test]
    async fn inline_handlers_see_event_log_id() {
        let log = Arc::new(InMemoryEventLog::new());
        let bus = bus(&log);
        let handler = RecordingHandler::new("projection");
        bus.subscribe("OrderPlaced", Arc::new(handler.clone()));

        let receipt = bus.publish(Event::new("OrderPlaced", json!({}))).await;

        assert_eq!(handler.events()[0].event_log_id(), receipt.event_log_id);
    }

    #[tokio::test]
    async fn duplicate_subscription_runs_twice() {
        let log = Arc::new(InMemoryEventLog::new());
        let bus = bus(&log);
        let handler = Arc::new(RecordingHandler::new("twice"));
        bus.subscribe("X", Arc::clone(&handler) as Arc<dyn EventHandler>);
        bus.subscribe("X", Arc::clone(&handler) as Arc<dyn EventHandler>);

        bus.publish(Event::new("X", json!({}))).await;

        assert_eq!(handler.call_count(), 2);
        assert_eq!(bus.handler_count("X"), 2);
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let log = Arc::new(InMemoryEventLog::new());
        let bus = bus(&log);
        let calls = CallLog::new();
        bus.subscribe(
            "X",
            Arc::new(FailingHandler::panicking("bomb").with_call_log(calls.clone())),
        );
        bus.subscribe(
            "X",
            Arc::new(RecordingHandler::new("after").with_call_log(calls.clone())),
        );

        let report = bus.dispatch_to_handlers(&Event::new("X", json!({}))).await;

        assert_eq!(calls.calls(), vec!["bomb", "after"]);
        assert_eq!(report.invoked, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].handler, "bomb");
        assert!(report.failures[0].error.contains("panicked"));
    }

    #[tokio::test]
    async fn queued_mode_enqueues_with_event_log_id() {
        let log = Arc::new(InMemoryEventLog::new());
        let queue = Arc::new(RecordingQueue::new());
        let bus = EventBus::new(
            Arc::clone(&log) as Arc<dyn EventLog>,
            BusConfig::default().with_dispatch_mode(DispatchMode::Queued),
        )
        .with_queue(Arc::clone(&queue) as Arc<dyn DispatchQueue>);
        let handler = RecordingHandler::new("h");
        bus.subscribe("X", Arc::new(handler.clone()));

        let receipt = bus.publish(Event::new("X", json!({}))).await;

        assert_eq!(receipt.route, DispatchRoute::Queued);
        assert_eq!(handler.call_count(), 0);
        let (task, delay) = queue.take().unwrap();
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(task.attempt, 0);
        assert_eq!(task.event.event_log_id(), receipt.event_log_id);
        assert_eq!(
            log.record(receipt.event_log_id.unwrap()).unwrap().status,
            EventStatus::Pending
        );
    }

    #[tokio::test]
    async fn queued_mode_without_queue_falls_back() {
        let log = Arc::new(InMemoryEventLog::new());
        let bus = EventBus::new(
            Arc::clone(&log) as Arc<dyn EventLog>,
            BusConfig::default().with_dispatch_mode(DispatchMode::Queued),
        );
        let handler = RecordingHandler::new("h");
        bus.subscribe("X", Arc::new(handler.clone()));

        let receipt = bus.publish(Event::new("X", json!({}))).await;

        assert_eq!(receipt.route, DispatchRoute::InlineFallback);
        assert_eq!(handler.call_count(), 1);
    }

    #[tokio::test]
    async fn failed_append_still_dispatches() {
        let log = Arc::new(InMemoryEventLog::new());
        log.fail_appends(true);
        let bus = bus(&log);
        let handler = RecordingHandler::new("h");
        bus.subscribe("X", Arc::new(handler.clone()));

        let receipt = bus.publish(Event::new("X", json!({}))).await;

        assert_eq!(receipt.event_log_id, None);
        assert_eq!(handler.call_count(), 1);
        assert_eq!(handler.events()[0].event_log_id(), None);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn clear_subscribers_empties_registry() {
        let log = Arc::new(InMemoryEventLog::new());
        let bus = bus(&log);
        bus.subscribe("X", Arc::new(RecordingHandler::new("h")));

        bus.clear_subscribers();

        assert_eq!(bus.handler_count("X"), 0);
    }

    #[test]
    fn error_summary_names_each_handler() {
        let report = DispatchReport {
            invoked: 3,
            failures: vec![
                HandlerFailure {
                    handler: "a".to_string(),
                    correlation_id: None,
                    error: "boom".to_string(),
                },
                HandlerFailure {
                    handler: "c".to_string(),
                    correlation_id: None,
                    error: "bang".to_string(),
                },
            ],
        };
        assert!(!report.is_success());
        assert_eq!(report.error_summary(), "a: boom; c: bang");
    }
}
