//! Bounded in-process dispatch queue.
//!
//! [`InProcessQueue`] is the default [`DispatchQueue`]: a bounded `tokio::sync::mpsc`
//! channel whose receiving end is driven by a
//! [`DispatchWorker`](crate::worker::DispatchWorker).
//!
//! - Immediate tasks use `try_send`, so `publish` never waits on a full queue; a
//!   full or closed channel is reported and the bus dispatches inline instead.
//! - Delayed tasks (retries) are held by a spawned timer task and then sent with
//!   back-pressure. If the worker has gone away by then, the task is dropped with
//!   an error log; its event log row stays `FAILED` and can be replayed.

use herald_core::queue::{DispatchQueue, DispatchTask, QueueError};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

/// Receiving end of an [`InProcessQueue`].
pub type DispatchReceiver = mpsc::Receiver<DispatchTask>;

/// Bounded in-process dispatch queue.
#[derive(Debug, Clone)]
pub struct InProcessQueue {
    sender: mpsc::Sender<DispatchTask>,
}

impl InProcessQueue {
    /// Create a queue holding at most `capacity` tasks (minimum 1).
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, DispatchReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Tasks currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Whether no tasks are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DispatchQueue for InProcessQueue {
    fn enqueue(
        &self,
        task: DispatchTask,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        Box::pin(async move {
            if delay.is_zero() {
                return self.sender.try_send(task).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => QueueError::Full,
                    mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
                });
            }

            if self.sender.is_closed() {
                return Err(QueueError::Closed);
            }

            let sender = self.sender.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let event_log_id = task.event.event_log_id();
                let attempt = task.attempt;
                if sender.send(task).await.is_err() {
                    tracing::error!(
                        event_log_id = ?event_log_id,
                        attempt,
                        "Dispatch queue closed before delayed task was delivered"
                    );
                }
            });
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use herald_core::event::Event;
    use serde_json::json;

    fn task() -> DispatchTask {
        DispatchTask::first(Event::new("X", json!({})).to_serialized())
    }

    #[tokio::test]
    async fn immediate_task_is_delivered() {
        let (queue, mut rx) = InProcessQueue::bounded(4);

        queue.enqueue(task(), Duration::ZERO).await.unwrap();

        assert_eq!(queue.len(), 1);
        assert_eq!(rx.recv().await.unwrap().attempt, 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let (queue, _rx) = InProcessQueue::bounded(1);

        queue.enqueue(task(), Duration::ZERO).await.unwrap();
        let err = queue.enqueue(task(), Duration::ZERO).await.unwrap_err();

        assert_eq!(err, QueueError::Full);
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (queue, rx) = InProcessQueue::bounded(1);
        drop(rx);

        assert_eq!(
            queue.enqueue(task(), Duration::ZERO).await.unwrap_err(),
            QueueError::Closed
        );
        assert_eq!(
            queue
                .enqueue(task(), Duration::from_secs(1))
                .await
                .unwrap_err(),
            QueueError::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_task_waits_for_its_delay() {
        let (queue, mut rx) = InProcessQueue::bounded(4);

        queue
            .enqueue(task().next_attempt(), Duration::from_secs(30))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().unwrap().attempt, 1);
    }
}
