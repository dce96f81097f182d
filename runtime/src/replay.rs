//! Replay: rebuild events from the log and republish them through the live bus.
//!
//! A replayed event goes through [`EventBus::publish`] like any other, so it gets
//! a **new** event log row and the same routing, retry and dead-letter handling.
//! The source row is left as it was, except that `FAILED`/`DEAD_LETTER` rows are
//! reset to `PENDING` first when [`ReplayOptions::reset_status`] is set.
//!
//! The replayed event carries the source row's metadata plus:
//!
//! | Key | Value |
//! |---|---|
//! | `is_replay` | `true` |
//! | `replayed_at` | RFC 3339 time of the replay |
//! | `replayed_from_event_log_id` | source row ID |
//! | `replayed_by_user_id` | operator, if given |
//!
//! Replay does not make handlers idempotent. Handlers that cannot tolerate a
//! second delivery should be wrapped in [`Deduplicated`](crate::dedupe::Deduplicated).

use herald_core::environment::{Clock, SystemClock};
use herald_core::event::metadata_keys;
use herald_core::event_log::{EventLog, EventLogFilter, EventLogId, EventLogRecord, EventStatus, LogOrder};
use serde_json::Value;
use std::sync::Arc;

use crate::bus::{EventBus, PublishReceipt};
use crate::error::OperatorError;
use crate::metrics::OperatorMetrics;

/// Default bound on rows replayed or previewed in one call.
pub const DEFAULT_REPLAY_LIMIT: usize = 100;

/// Options for a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Reset `FAILED`/`DEAD_LETTER` source rows to `PENDING` before republishing.
    pub reset_status: bool,
    /// Operator issuing the replay.
    pub actor_user_id: Option<i64>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            reset_status: true,
            actor_user_id: None,
        }
    }
}

impl ReplayOptions {
    /// Leave source row status untouched.
    #[must_use]
    pub const fn without_reset(mut self) -> Self {
        self.reset_status = false;
        self
    }

    /// Record the operator issuing the replay.
    #[must_use]
    pub const fn with_actor(mut self, user_id: i64) -> Self {
        self.actor_user_id = Some(user_id);
        self
    }
}

/// Outcome of a bulk replay.
#[derive(Debug, Default)]
pub struct ReplaySummary {
    /// Rows republished.
    pub replayed: usize,
    /// Rows that could not be replayed, and why.
    pub failures: Vec<(EventLogId, OperatorError)>,
}

/// Republishes logged events through the bus.
pub struct ReplayService {
    bus: Arc<EventBus>,
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
}

impl ReplayService {
    /// Create a service that replays through `bus` from the bus's own log.
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        let log = bus.log();
        Self {
            bus,
            log,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for `replayed_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Republish one logged event.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::NotFound`] for an unknown ID,
    /// [`OperatorError::NotEligible`] if the reset races with an in-flight
    /// attempt, or [`OperatorError::Storage`] on a storage failure.
    #[tracing::instrument(skip(self, options), name = "replay_one", fields(event_log_id = %id))]
    pub async fn replay_one(
        &self,
        id: EventLogId,
        options: &ReplayOptions,
    ) -> Result<PublishReceipt, OperatorError> {
        self.try_replay(id, options)
            .await
            .inspect_err(|e| tracing::warn!(event_log_id = %id, error = %e, "Replay failed"))
    }

    async fn try_replay(
        &self,
        id: EventLogId,
        options: &ReplayOptions,
    ) -> Result<PublishReceipt, OperatorError> {
        let mut record = self.log.get(id).await?;

        if options.reset_status
            && matches!(record.status, EventStatus::Failed | EventStatus::DeadLetter)
        {
            record = self.log.reset_for_replay(id).await?;
        }

        let mut metadata = record.metadata.clone();
        metadata.remove(metadata_keys::EVENT_LOG_ID);
        metadata.insert(metadata_keys::IS_REPLAY.to_string(), Value::Bool(true));
        metadata.insert(
            metadata_keys::REPLAYED_AT.to_string(),
            Value::String(self.clock.now().to_rfc3339()),
        );
        metadata.insert(
            metadata_keys::REPLAYED_FROM_EVENT_LOG_ID.to_string(),
            Value::from(id.value()),
        );
        if let Some(actor) = options.actor_user_id {
            metadata.insert(
                metadata_keys::REPLAYED_BY_USER_ID.to_string(),
                Value::from(actor),
            );
        }

        let event = record.to_event().with_metadata(metadata);
        let receipt = self.bus.publish(event).await;

        tracing::info!(
            source_event_log_id = %id,
            event_log_id = ?receipt.event_log_id,
            event_name = %record.name,
            actor_user_id = options.actor_user_id,
            "Event replayed"
        );
        OperatorMetrics::record_replay();
        Ok(receipt)
    }

    /// Republish every row matching `filter`, oldest `occurred_at` first.
    ///
    /// Individual failures are collected and do not stop the run.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Storage`] if the candidate query fails.
    #[tracing::instrument(skip(self, filter, options), name = "replay_many")]
    pub async fn replay_many(
        &self,
        filter: &EventLogFilter,
        options: &ReplayOptions,
        limit: usize,
    ) -> Result<ReplaySummary, OperatorError> {
        let candidates = self.dry_run(filter, limit).await?;
        let mut summary = ReplaySummary::default();

        for record in candidates {
            match self.replay_one(record.id, options).await {
                Ok(_) => summary.replayed += 1,
                Err(e) => summary.failures.push((record.id, e)),
            }
        }

        tracing::info!(
            replayed = summary.replayed,
            failed = summary.failures.len(),
            "Bulk replay finished"
        );
        Ok(summary)
    }

    /// The rows [`replay_many`](Self::replay_many) would republish, in the same
    /// order. Nothing is changed.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Storage`] if the query fails.
    pub async fn dry_run(
        &self,
        filter: &EventLogFilter,
        limit: usize,
    ) -> Result<Vec<EventLogRecord>, OperatorError> {
        Ok(self.log.query(filter, LogOrder::Chronological, limit).await?)
    }
}

impl std::fmt::Debug for ReplayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayService")
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use herald_core::event::Event;
    use herald_testing::{InMemoryEventLog, RecordingHandler, test_clock};
    use serde_json::json;

    fn setup() -> (Arc<InMemoryEventLog>, Arc<EventBus>, ReplayService) {
        let log = Arc::new(InMemoryEventLog::new());
        let bus = Arc::new(EventBus::new(
            Arc::clone(&log) as Arc<dyn EventLog>,
            BusConfig::default(),
        ));
        let service = ReplayService::new(Arc::clone(&bus)).with_clock(Arc::new(test_clock()));
        (log, bus, service)
    }

    #[tokio::test]
    async fn replay_annotates_new_event() {
        let (log, bus, service) = setup();
        let handler = RecordingHandler::new("h");
        bus.subscribe("A", Arc::new(handler.clone()));
        let source = log.seed(
            &Event::new("A", json!({ "n": 1 })).with_correlation_id("c"),
            EventStatus::Processed,
            0,
        );

        let receipt = service
            .replay_one(source.id, &ReplayOptions::default().with_actor(7))
            .await
            .unwrap();

        let seen = &handler.events()[0];
        assert!(seen.is_replay());
        assert_eq!(seen.correlation_id(), Some("c"));
        assert_eq!(seen.payload().get("n"), Some(&json!(1)));
        assert_eq!(seen.event_log_id(), receipt.event_log_id);
        assert_eq!(
            seen.metadata().get(metadata_keys::REPLAYED_FROM_EVENT_LOG_ID),
            Some(&json!(source.id.value()))
        );
        assert_eq!(
            seen.metadata().get(metadata_keys::REPLAYED_BY_USER_ID),
            Some(&json!(7))
        );
        assert_eq!(
            seen.metadata().get(metadata_keys::REPLAYED_AT),
            Some(&json!(test_clock().now().to_rfc3339()))
        );
    }

    #[tokio::test]
    async fn reset_applies_to_dead_letters() {
        let (log, _bus, service) = setup();
        let source = log.seed(&Event::new("A", json!({})), EventStatus::DeadLetter, 3);

        service
            .replay_one(source.id, &ReplayOptions::default())
            .await
            .unwrap();

        let after = log.record(source.id).unwrap();
        assert_eq!(after.status, EventStatus::Pending);
        assert_eq!(after.retry_count, 0);
    }

    #[tokio::test]
    async fn without_reset_leaves_dead_letter() {
        let (log, _bus, service) = setup();
        let source = log.seed(&Event::new("A", json!({})), EventStatus::DeadLetter, 3);

        service
            .replay_one(source.id, &ReplayOptions::default().without_reset())
            .await
            .unwrap();

        assert_eq!(log.record(source.id).unwrap(), source);
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn replay_of_missing_row_is_not_found() {
        let (_log, _bus, service) = setup();
        let err = service
            .replay_one(EventLogId::new(5), &ReplayOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, OperatorError::NotFound(EventLogId::new(5)));
    }

    #[tokio::test]
    async fn dry_run_changes_nothing() {
        let (log, _bus, service) = setup();
        log.seed(&Event::new("A", json!({})), EventStatus::Failed, 1);
        log.seed(&Event::new("A", json!({})), EventStatus::DeadLetter, 3);
        let before = log.records();

        let candidates = service
            .dry_run(&EventLogFilter::default().with_event_name("A"), DEFAULT_REPLAY_LIMIT)
            .await
            .unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(log.records(), before);
    }
}
