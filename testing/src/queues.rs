//! Dispatch queue doubles.

use herald_core::queue::{DispatchQueue, DispatchTask, QueueError};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Queue that accepts every task and keeps it for inspection.
///
/// Nothing is delivered; tests pull tasks with [`RecordingQueue::take`] and feed
/// them to a worker by hand, which makes retry sequences fully deterministic.
#[derive(Debug, Clone, Default)]
pub struct RecordingQueue {
    tasks: Arc<Mutex<Vec<(DispatchTask, Duration)>>>,
}

impl RecordingQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks and their requested delays, oldest first.
    #[must_use]
    pub fn tasks(&self) -> Vec<(DispatchTask, Duration)> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return the oldest task.
    #[must_use]
    pub fn take(&self) -> Option<(DispatchTask, Duration)> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.is_empty() {
            None
        } else {
            Some(tasks.remove(0))
        }
    }

    /// Number of tasks waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no tasks are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DispatchQueue for RecordingQueue {
    fn enqueue(
        &self,
        task: DispatchTask,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        Box::pin(async move {
            self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((task, delay));
            Ok(())
        })
    }
}

/// Queue that refuses every task with a fixed error.
#[derive(Debug, Clone)]
pub struct FailingQueue {
    error: QueueError,
    attempts: Arc<AtomicUsize>,
}

impl FailingQueue {
    /// Refuse with the given error.
    #[must_use]
    pub fn new(error: QueueError) -> Self {
        Self {
            error,
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Refuse with a transport error, as a broker outage would.
    #[must_use]
    pub fn unavailable() -> Self {
        Self::new(QueueError::Transport("connection refused".to_string()))
    }

    /// How many enqueue calls were made.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl DispatchQueue for FailingQueue {
    fn enqueue(
        &self,
        _task: DispatchTask,
        _delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let error = self.error.clone();
        Box::pin(async move { Err(error) })
    }
}
