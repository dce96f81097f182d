//! Handler doubles.
//!
//! All doubles can share a [`CallLog`], which records handler names in the
//! order they were invoked across every handler attached to it. That is what
//! ordering assertions ("handlers run in subscription order") are written against.

use herald_core::event::Event;
use herald_core::handler::{EventHandler, HandlerFuture};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Shared, ordered record of handler invocations.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler name.
    pub fn push(&self, name: &str) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
    }

    /// Handler names in invocation order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handler that records every event it receives and always succeeds.
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    name: String,
    events: Arc<Mutex<Vec<Event>>>,
    call_log: Option<CallLog>,
}

impl RecordingHandler {
    /// Create a handler with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Arc::new(Mutex::new(Vec::new())),
            call_log: None,
        }
    }

    /// Also record invocations into a shared call log.
    #[must_use]
    pub fn with_call_log(mut self, call_log: CallLog) -> Self {
        self.call_log = Some(call_log);
        self
    }

    /// Events received so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of events received.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, event: &'a Event) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let Some(log) = &self.call_log {
                log.push(&self.name);
            }
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum FailureMode {
    Always,
    FirstN(usize),
    Panic,
}

/// Handler that fails on demand.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    name: String,
    mode: FailureMode,
    calls: Arc<AtomicUsize>,
    call_log: Option<CallLog>,
}

impl FailingHandler {
    fn with_mode(name: impl Into<String>, mode: FailureMode) -> Self {
        Self {
            name: name.into(),
            mode,
            calls: Arc::new(AtomicUsize::new(0)),
            call_log: None,
        }
    }

    /// Fails on every call.
    #[must_use]
    pub fn always(name: impl Into<String>) -> Self {
        Self::with_mode(name, FailureMode::Always)
    }

    /// Fails on the first `n` calls, then succeeds.
    #[must_use]
    pub fn first_n(name: impl Into<String>, n: usize) -> Self {
        Self::with_mode(name, FailureMode::FirstN(n))
    }

    /// Panics on every call.
    #[must_use]
    pub fn panicking(name: impl Into<String>) -> Self {
        Self::with_mode(name, FailureMode::Panic)
    }

    /// Also record invocations into a shared call log.
    #[must_use]
    pub fn with_call_log(mut self, call_log: CallLog) -> Self {
        self.call_log = Some(call_log);
        self
    }

    /// Number of times the handler was invoked.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EventHandler for FailingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    #[allow(clippy::panic)] // Panicking on demand is the point of this double
    fn handle<'a>(&'a self, event: &'a Event) -> HandlerFuture<'a> {
        Box::pin(async move {
            if let Some(log) = &self.call_log {
                log.push(&self.name);
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                FailureMode::Always => {
                    Err(anyhow::anyhow!("{} rejected {}", self.name, event.name()))
                }
                FailureMode::FirstN(n) if call < n => Err(anyhow::anyhow!(
                    "{} failed attempt {} for {}",
                    self.name,
                    call + 1,
                    event.name()
                )),
                FailureMode::FirstN(_) => Ok(()),
                FailureMode::Panic => panic!("{} panicked on {}", self.name, event.name()),
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn first_n_recovers() {
        let handler = FailingHandler::first_n("flaky", 2);
        let event = Event::new("X", json!({}));

        assert!(handler.handle(&event).await.is_err());
        assert!(handler.handle(&event).await.is_err());
        assert!(handler.handle(&event).await.is_ok());
        assert_eq!(handler.call_count(), 3);
    }

    #[tokio::test]
    async fn call_log_is_shared() {
        let log = CallLog::new();
        let a = RecordingHandler::new("a").with_call_log(log.clone());
        let b = FailingHandler::always("b").with_call_log(log.clone());
        let event = Event::new("X", json!({}));

        a.handle(&event).await.unwrap();
        let _ = b.handle(&event).await;
        a.handle(&event).await.unwrap();

        assert_eq!(log.calls(), vec!["a", "b", "a"]);
        assert_eq!(a.call_count(), 2);
    }
}
