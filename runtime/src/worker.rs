//! Dispatch worker: the asynchronous path, and the only place retries happen.
//!
//! # Processing one task
//!
//! 1. Resolve the event log row from `event_log_id`. A missing row is logged and
//!    the task is dispatched without status tracking.
//! 2. `mark_processing`. A row that is already `PROCESSED` or `DEAD_LETTER` is
//!    rejected by the log and the task is skipped, so a duplicate delivery never
//!    reprocesses a finished event.
//! 3. Rebuild the [`Event`] and run [`EventBus::dispatch_to_handlers`]. Every
//!    handler runs; any handler failure fails the attempt.
//! 4. Success: `mark_processed`.
//! 5. Failure, with `n = retry_count` read from the row:
//!    - `n >= max_retries`: `mark_dead_letter`, no reschedule.
//!    - otherwise: `mark_failed` and re-enqueue after
//!      [`RetryPolicy::delay_for_attempt`](crate::retry::RetryPolicy::delay_for_attempt)`(n)`.
//!
//! The row's `retry_count` is the only retry counter. [`DispatchTask::attempt`]
//! is used only for tasks without a durable row, and when it reaches
//! `max_retries` the task is abandoned with an error log.

use herald_core::event::Event;
use herald_core::event_log::{EventLog, EventLogError, EventLogRecord, truncate_error};
use herald_core::queue::{DispatchQueue, DispatchTask};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;

use crate::bus::EventBus;
use crate::config::BusConfig;
use crate::metrics::WorkerMetrics;

/// What happened to one dispatch task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Every handler succeeded.
    Processed,
    /// The attempt failed and a retry was scheduled.
    Retrying {
        /// Failed attempts so far.
        retry_count: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// Retries are exhausted and the row is now `DEAD_LETTER`.
    DeadLettered {
        /// Failed attempts, including this one.
        retry_count: u32,
    },
    /// The row was already finished; nothing ran.
    Skipped {
        /// Why the task was skipped.
        reason: String,
    },
    /// Work stopped without a terminal status: the retry ceiling was reached
    /// for a task with no durable row, or the failure could not be recorded or
    /// rescheduled.
    Abandoned,
}

/// Consumes [`DispatchTask`]s and drives the retry/dead-letter state machine.
pub struct DispatchWorker {
    bus: Arc<EventBus>,
    log: Arc<dyn EventLog>,
    queue: Arc<dyn DispatchQueue>,
    config: BusConfig,
}

impl DispatchWorker {
    /// Create a worker that dispatches through `bus` and reschedules on `queue`.
    #[must_use]
    pub fn new(bus: Arc<EventBus>, queue: Arc<dyn DispatchQueue>) -> Self {
        let log = bus.log();
        let config = bus.config().clone();
        Self {
            bus,
            log,
            queue,
            config,
        }
    }

    /// Process one task to completion.
    #[tracing::instrument(
        skip(self, task),
        name = "worker_process",
        fields(
            event_name = %task.event.name,
            event_log_id = ?task.event.event_log_id(),
            attempt = task.attempt
        )
    )]
    pub async fn process(&self, task: DispatchTask) -> WorkerOutcome {
        let mut record = self.resolve_record(&task).await;

        if let Some(current) = &record {
            match self.log.mark_processing(current.id).await {
                Ok(updated) => record = Some(updated),
                Err(EventLogError::InvalidTransition { from, .. }) => {
                    tracing::info!(status = %from, "Event already finished, skipping task");
                    return WorkerOutcome::Skipped {
                        reason: format!("event log record is {from}"),
                    };
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Could not mark event processing");
                }
            }
        }

        let event = match Event::try_from(task.event.clone()) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "Could not rebuild event from task");
                return self.handle_failure(&task, record.as_ref(), &e.to_string()).await;
            }
        };

        let report = self.bus.dispatch_to_handlers(&event).await;
        if !report.is_success() {
            return self
                .handle_failure(&task, record.as_ref(), &report.error_summary())
                .await;
        }

        if let Some(current) = &record {
            if let Err(e) = self.log.mark_processed(current.id).await {
                tracing::warn!(error = %e, "Could not mark event processed");
            }
        }
        WorkerMetrics::record_processed();
        WorkerOutcome::Processed
    }

    async fn resolve_record(&self, task: &DispatchTask) -> Option<EventLogRecord> {
        let id = task.event.event_log_id()?;
        match self.log.get(id).await {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(
                    event_log_id = %id,
                    error = %e,
                    "Event log record unavailable, dispatching without status tracking"
                );
                None
            }
        }
    }

    async fn handle_failure(
        &self,
        task: &DispatchTask,
        record: Option<&EventLogRecord>,
        error: &str,
    ) -> WorkerOutcome {
        let Some(record) = record else {
            return self.handle_untracked_failure(task, error).await;
        };
        let error: &str = &truncate_error(error, self.config.max_error_length);

        if record.retry_count >= self.config.max_retries {
            return match self.log.mark_dead_letter(record.id, error).await {
                Ok(dead) => {
                    tracing::warn!(
                        event_log_id = %dead.id,
                        event_name = %dead.name,
                        correlation_id = dead.correlation_id.as_deref(),
                        retry_count = dead.retry_count,
                        error,
                        "Retries exhausted, event moved to dead letter"
                    );
                    WorkerMetrics::record_dead_lettered(&dead.name);
                    WorkerOutcome::DeadLettered {
                        retry_count: dead.retry_count,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Could not move event to dead letter");
                    WorkerMetrics::record_abandoned();
                    WorkerOutcome::Abandoned
                }
            };
        }

        let failed = match self.log.mark_failed(record.id, error).await {
            Ok(failed) => failed,
            Err(e) => {
                tracing::error!(error = %e, "Could not record dispatch failure");
                WorkerMetrics::record_abandoned();
                return WorkerOutcome::Abandoned;
            }
        };

        let delay = self
            .config
            .retry
            .delay_for_attempt(failed.retry_count.saturating_sub(1));
        self.reschedule(task, failed.retry_count, delay, error).await
    }

    async fn handle_untracked_failure(&self, task: &DispatchTask, error: &str) -> WorkerOutcome {
        if task.attempt >= self.config.max_retries {
            tracing::error!(
                attempt = task.attempt,
                max_retries = self.config.max_retries,
                error,
                "retry ceiling reached without durable record"
            );
            WorkerMetrics::record_abandoned();
            return WorkerOutcome::Abandoned;
        }

        let delay = self.config.retry.delay_for_attempt(task.attempt);
        self.reschedule(task, task.attempt.saturating_add(1), delay, error)
            .await
    }

    async fn reschedule(
        &self,
        task: &DispatchTask,
        retry_count: u32,
        delay: Duration,
        error: &str,
    ) -> WorkerOutcome {
        match self.queue.enqueue(task.next_attempt(), delay).await {
            Ok(()) => {
                tracing::info!(
                    retry_count,
                    delay_ms = delay.as_millis(),
                    error,
                    "Dispatch failed, retry scheduled"
                );
                WorkerMetrics::record_retry_scheduled();
                WorkerOutcome::Retrying { retry_count, delay }
            }
            Err(e) => {
                tracing::error!(
                    retry_count,
                    error = %e,
                    "Could not reschedule dispatch, event left FAILED for replay"
                );
                WorkerMetrics::record_abandoned();
                WorkerOutcome::Abandoned
            }
        }
    }

    /// Drain `receiver` until it closes or `shutdown` turns `true`.
    ///
    /// At most `worker_concurrency` tasks run at once. On shutdown the queue is
    /// closed, tasks it already holds are processed, and every in-flight task
    /// is awaited before returning. Retries scheduled after the close cannot be
    /// delivered; their rows stay `FAILED` for replay.
    pub async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<DispatchTask>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let concurrency = self.config.worker_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut in_flight = JoinSet::new();

        tracing::info!(concurrency, "Dispatch worker started");

        while !*shutdown.borrow() {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Dispatch task terminated abnormally");
                    }
                }

                next = receiver.recv() => {
                    let Some(task) = next else { break };
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else { break };
                    let worker = Arc::clone(&self);
                    in_flight.spawn(async move {
                        let _permit = permit;
                        worker.process(task).await
                    });
                }
            }
        }

        // Tasks already accepted by the queue still get their delivery.
        receiver.close();
        let mut drained = 0_usize;
        while let Some(task) = receiver.recv().await {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                tracing::error!(
                    event_log_id = ?task.event.event_log_id(),
                    "Dispatch task dropped during shutdown"
                );
                WorkerMetrics::record_abandoned();
                continue;
            };
            drained += 1;
            let worker = Arc::clone(&self);
            in_flight.spawn(async move {
                let _permit = permit;
                worker.process(task).await
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Dispatch task terminated abnormally");
            }
        }

        tracing::info!(drained, "Dispatch worker stopped");
    }
}

impl std::fmt::Debug for DispatchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchWorker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
