//! # Herald Runtime
//!
//! Event bus runtime for the Herald durable event bus.
//!
//! This crate wires the core traits into a working pipeline: publishing with
//! durable recording, fan-out to handlers, asynchronous dispatch with retry and
//! dead-lettering, and the operator services that inspect and replay the log.
//!
//! ## Core Components
//!
//! - **[`EventBus`]**: Handler registry, `publish`, and isolated fan-out
//! - **[`DispatchWorker`]**: Drives the retry / dead-letter state machine for queued events
//! - **[`InProcessQueue`]**: Bounded in-process dispatch queue with delayed redelivery
//! - **[`DeadLetterService`]**: List, acknowledge, reset and summarise dead-lettered events
//! - **[`ReplayService`]**: Republish logged events through the live bus
//! - **[`Deduplicated`]**: Opt-in duplicate suppression for handlers
//!
//! ## Example
//!
//! ```
//! use herald_core::{Event, EventLog, json};
//! use herald_runtime::{BusConfig, DispatchMode, DispatchWorker, EventBus, InProcessQueue};
//! use herald_testing::InMemoryEventLog;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new());
//! let config = BusConfig::default().with_dispatch_mode(DispatchMode::Queued);
//! let (queue, receiver) = InProcessQueue::bounded(config.queue_capacity);
//! let queue = Arc::new(queue);
//!
//! let bus = Arc::new(EventBus::new(log, config).with_queue(queue.clone()));
//! let worker = Arc::new(DispatchWorker::new(Arc::clone(&bus), queue));
//! let (shutdown, shutdown_rx) = tokio::sync::watch::channel(false);
//! let running = tokio::spawn(Arc::clone(&worker).run(receiver, shutdown_rx));
//!
//! bus.publish(Event::new("MatchCompleted", json!({ "match_id": 42 }))).await;
//!
//! shutdown.send(true).ok();
//! running.await.ok();
//! # });
//! ```

/// Bus configuration and environment loading
pub mod config;

/// Event bus: registry, publish, fan-out
pub mod bus;

/// Bounded in-process dispatch queue
pub mod queue;

/// Dispatch worker with retry and dead-lettering
pub mod worker;

/// Exponential backoff policy
pub mod retry;

/// Dead-letter operator service
pub mod dead_letter;

/// Replay operator service
pub mod replay;

/// Opt-in handler deduplication
pub mod dedupe;

/// Prometheus metrics for observability
pub mod metrics;

/// Error types for the operator services
pub mod error {
    use herald_core::event_log::{EventLogError, EventLogId, EventStatus};
    use thiserror::Error;

    /// Why an operator action did not happen.
    ///
    /// Each variant maps to a distinct message an operator can act on: the row
    /// does not exist, the row is in the wrong state, or storage failed.
    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum OperatorError {
        /// No event log row with this ID.
        #[error("Event {0} not found")]
        NotFound(EventLogId),

        /// The row exists but its status does not allow the action.
        #[error("Event {id} is not eligible: status is {status}")]
        NotEligible {
            /// The row.
            id: EventLogId,
            /// Its current status.
            status: EventStatus,
        },

        /// The event log failed.
        #[error("Event log error: {0}")]
        Storage(EventLogError),
    }

    impl From<EventLogError> for OperatorError {
        fn from(error: EventLogError) -> Self {
            match error {
                EventLogError::NotFound(id) => Self::NotFound(id),
                EventLogError::InvalidTransition { id, from, .. } => Self::NotEligible { id, status: from },
                other => Self::Storage(other),
            }
        }
    }
}

pub use bus::{DispatchReport, DispatchRoute, EventBus, HandlerFailure, PublishReceipt};
pub use config::{BusConfig, ConfigError, DispatchMode};
pub use dead_letter::DeadLetterService;
pub use dedupe::{Deduplicated, InMemoryLedger, ProcessedLedger};
pub use error::OperatorError;
pub use queue::{DispatchReceiver, InProcessQueue};
pub use replay::{ReplayOptions, ReplayService, ReplaySummary};
pub use retry::RetryPolicy;
pub use worker::{DispatchWorker, WorkerOutcome};
