//! # Herald Core
//!
//! Core types and traits for the Herald durable event bus.
//!
//! This crate holds everything producers, consumers and storage backends share,
//! and nothing else. It depends on no other Herald crate, so the event log,
//! the dispatch worker and domain modules can all depend on it without cycles.
//!
//! ## Core Concepts
//!
//! - **Event**: Immutable business fact (name, payload, timestamp, correlation metadata)
//! - **Event Log**: Durable record of every published event and its processing status
//! - **Event Handler**: Consumer subscribed to an event name
//! - **Dispatch Queue**: Hand-off point to asynchronous dispatch workers
//! - **Clock**: Injected time source
//!
//! ## Flow
//!
//! ```text
//! publish(event)
//!     │
//!     ├── 1. EventLog::append      (status = PENDING)
//!     │
//!     ├── 2a. inline:  dispatch to handlers in the caller's task
//!     │
//!     └── 2b. queued:  DispatchQueue::enqueue ──► worker ──► handlers
//!                          │                        │
//!                          └─ error: inline ─┘      └─ retry / DEAD_LETTER
//! ```
//!
//! ## Example
//!
//! ```
//! use herald_core::event::Event;
//! use serde_json::json;
//!
//! let event = Event::new("MatchCompleted", json!({ "match_id": 42 }))
//!     .with_correlation_id("tournament-7");
//!
//! let wire = event.to_serialized();
//! assert_eq!(wire.name, "MatchCompleted");
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde_json::{Map, Value, json};

pub mod event;
pub mod event_log;
pub mod handler;
pub mod queue;

pub use event::{Event, EventError, SerializedEvent};
pub use event_log::{
    EventLog, EventLogError, EventLogFilter, EventLogId, EventLogRecord, EventLogStats,
    EventStatus, LogOrder,
};
pub use handler::{EventHandler, handler_fn};
pub use queue::{DispatchQueue, DispatchTask, QueueError};

/// Injected dependencies.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Source of the current time.
    ///
    /// Injected into the event log and the operator services so tests can pin
    /// `created_at`, `last_error_at` and replay timestamps.
    pub trait Clock: Send + Sync {
        /// Current time.
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
