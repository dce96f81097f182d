//! Opt-in duplicate suppression for handlers.
//!
//! Delivery is at-least-once: a retry re-runs every handler for an event, and a
//! replay delivers the event again under a new row. [`Deduplicated`] wraps a
//! handler so it runs at most once successfully per *source* row:
//!
//! - a replayed event is keyed by `replayed_from_event_log_id`
//! - any other event is keyed by `event_log_id`
//! - an event with neither (its append failed) always runs
//!
//! A key is recorded only after the inner handler succeeds, so a failed attempt
//! is retried normally.

use herald_core::event::{Event, metadata_keys};
use herald_core::event_log::EventLogId;
use herald_core::handler::{EventHandler, HandlerFuture};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

/// Boxed future returned by [`ProcessedLedger`] methods.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Store of `(handler, source row)` pairs that have been handled.
pub trait ProcessedLedger: Send + Sync {
    /// Whether `handler` already handled the event keyed by `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    fn is_processed<'a>(&'a self, handler: &'a str, key: EventLogId) -> LedgerFuture<'a, bool>;

    /// Record that `handler` handled the event keyed by `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be written.
    fn mark_processed<'a>(&'a self, handler: &'a str, key: EventLogId) -> LedgerFuture<'a, ()>;
}

/// Process-local [`ProcessedLedger`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    seen: Arc<Mutex<HashSet<(String, EventLogId)>>>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProcessedLedger for InMemoryLedger {
    fn is_processed<'a>(&'a self, handler: &'a str, key: EventLogId) -> LedgerFuture<'a, bool> {
        Box::pin(async move {
            Ok(self
                .seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&(handler.to_string(), key)))
        })
    }

    fn mark_processed<'a>(&'a self, handler: &'a str, key: EventLogId) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            self.seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert((handler.to_string(), key));
            Ok(())
        })
    }
}

/// The source row an event should be deduplicated on.
#[must_use]
pub fn dedupe_key(event: &Event) -> Option<EventLogId> {
    event
        .metadata()
        .get(metadata_keys::REPLAYED_FROM_EVENT_LOG_ID)
        .and_then(Value::as_i64)
        .map(EventLogId::new)
        .or_else(|| event.event_log_id())
}

/// A handler that skips events it already handled successfully.
pub struct Deduplicated<H> {
    inner: H,
    ledger: Arc<dyn ProcessedLedger>,
}

impl<H: EventHandler> Deduplicated<H> {
    /// Wrap `inner`, recording handled events in `ledger`.
    #[must_use]
    pub fn new(inner: H, ledger: Arc<dyn ProcessedLedger>) -> Self {
        Self { inner, ledger }
    }
}

impl<H: EventHandler> EventHandler for Deduplicated<H> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn handle<'a>(&'a self, event: &'a Event) -> HandlerFuture<'a> {
        Box::pin(async move {
            let Some(key) = dedupe_key(event) else {
                return self.inner.handle(event).await;
            };

            if self.ledger.is_processed(self.name(), key).await? {
                tracing::debug!(
                    handler = self.name(),
                    event_log_id = %key,
                    "Duplicate delivery skipped"
                );
                return Ok(());
            }

            self.inner.handle(event).await?;
            self.ledger.mark_processed(self.name(), key).await
        })
    }
}

impl<H> std::fmt::Debug for Deduplicated<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicated").finish_non_exhaustive()
    }
}
