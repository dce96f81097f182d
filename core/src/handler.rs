//! Event handlers: the consumers subscribed to the bus.
//!
//! A handler receives a shared reference to an [`Event`] and returns
//! `anyhow::Result<()>`. The bus isolates handlers from one another: an error (or
//! a panic) in one handler is logged and never prevents its siblings from running.
//!
//! # Idempotency
//!
//! Delivery is at-least-once. Retries and replays redeliver events to handlers
//! that may already have run, so handlers must tolerate duplicates. The runtime
//! offers an opt-in `Deduplicated` wrapper for handlers that cannot.
//!
//! # Example
//!
//! ```
//! use herald_core::handler::{EventHandler, handler_fn};
//!
//! let handler = handler_fn("audit", |event| {
//!     let name = event.name().to_string();
//!     async move {
//!         println!("saw {name}");
//!         Ok(())
//!     }
//! });
//!
//! assert_eq!(handler.name(), "audit");
//! ```

use std::future::Future;
use std::pin::Pin;

use crate::event::Event;

/// Boxed future returned by [`EventHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// A consumer of events with a given name.
///
/// # Dyn Compatibility
///
/// `handle` returns a boxed future so handlers can be stored as
/// `Arc<dyn EventHandler>` in the bus registry.
pub trait EventHandler: Send + Sync {
    /// Stable identity used in logs and failure reports.
    fn name(&self) -> &str;

    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Any error is reported against this handler and, on the queued path,
    /// escalated to a dispatch-level failure that drives retry.
    fn handle<'a>(&'a self, event: &'a Event) -> HandlerFuture<'a>;
}

/// Handler backed by a closure. Built with [`handler_fn`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, event: &'a Event) -> HandlerFuture<'a> {
        Box::pin((self.f)(event))
    }
}

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

/// Wrap a closure as a named handler.
///
/// The closure borrows the event only while building its future, so it should
/// copy out whatever the future needs.
#[must_use]
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(&Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn closure_handler_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn("count", move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let event = Event::new("Tick", json!({}));
        handler.handle(&event).await.unwrap();
        handler.handle(&event).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn closure_handler_propagates_error() {
        let handler = handler_fn("boom", |event| {
            let name = event.name().to_string();
            async move { Err(anyhow::anyhow!("cannot handle {name}")) }
        });

        let err = handler
            .handle(&Event::new("Tick", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot handle Tick");
    }
}
