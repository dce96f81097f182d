//! Dispatch queue abstraction for the asynchronous dispatch path.
//!
//! In queued mode the bus hands a [`DispatchTask`] to a [`DispatchQueue`]; a
//! dispatch worker consumes it later. The queue technology is an implementation
//! detail. The contract is at-least-once delivery to a worker, with support for
//! delayed redelivery so the worker can schedule backoff.
//!
//! An enqueue error is never fatal: the bus falls back to inline dispatch, so no
//! event is dropped because the queue was unavailable.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

use crate::event::SerializedEvent;

/// Errors raised when handing work to a queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity.
    #[error("Dispatch queue is full")]
    Full,

    /// The consuming side is gone.
    #[error("Dispatch queue is closed")]
    Closed,

    /// Network or broker error.
    #[error("Dispatch queue transport error: {0}")]
    Transport(String),
}

/// One unit of dispatch work.
#[derive(Clone, Debug, PartialEq)]
pub struct DispatchTask {
    /// The event in wire format, with `event_log_id` in its metadata when recorded.
    pub event: SerializedEvent,

    /// Zero-based delivery attempt.
    ///
    /// The event log's `retry_count` is authoritative; this counter is only
    /// consulted when the task has no durable record.
    pub attempt: u32,
}

impl DispatchTask {
    /// First delivery of an event.
    #[must_use]
    pub const fn first(event: SerializedEvent) -> Self {
        Self { event, attempt: 0 }
    }

    /// The same work, one attempt later.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        Self {
            event: self.event.clone(),
            attempt: self.attempt.saturating_add(1),
        }
    }
}

/// A queue that delivers [`DispatchTask`]s to dispatch workers.
pub trait DispatchQueue: Send + Sync {
    /// Enqueue a task for delivery after `delay`.
    ///
    /// Returns once the queue has accepted the task; it must not block waiting
    /// for a broken queue.
    ///
    /// # Errors
    ///
    /// Returns a [`QueueError`] if the task could not be accepted.
    fn enqueue(
        &self,
        task: DispatchTask,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;
}
