//! Operator surface over events parked in `DEAD_LETTER`.
//!
//! This service reads and annotates dead-lettered rows; it never runs handlers.
//! Re-dispatching is the job of [`ReplayService`](crate::replay::ReplayService).

use herald_core::environment::{Clock, SystemClock};
use herald_core::event::metadata_keys;
use herald_core::event_log::{
    EventLog, EventLogFilter, EventLogId, EventLogRecord, EventLogStats, EventStatus, LogOrder,
};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::OperatorError;
use crate::metrics::OperatorMetrics;

/// Default bound on listed rows.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// List, acknowledge, reset and summarise dead-lettered events.
pub struct DeadLetterService {
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
}

impl DeadLetterService {
    /// Create a service over `log` using wall-clock time.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self {
            log,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for annotation timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Dead-lettered rows matching `filter`, most recent error first.
    ///
    /// Any `status` in `filter` is replaced with `DEAD_LETTER`.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Storage`] if the query fails.
    pub async fn list(
        &self,
        filter: &EventLogFilter,
        limit: usize,
    ) -> Result<Vec<EventLogRecord>, OperatorError> {
        let filter = filter.clone().with_status(EventStatus::DeadLetter);
        Ok(self
            .log
            .query(&filter, LogOrder::RecentErrorFirst, limit)
            .await?)
    }

    /// Annotate a dead-lettered row as acknowledged. The status is not changed.
    ///
    /// Acknowledging again overwrites the timestamp and, if given, the notes.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::NotFound`] for an unknown ID and
    /// [`OperatorError::NotEligible`] if the row is not `DEAD_LETTER`.
    pub async fn acknowledge(
        &self,
        id: EventLogId,
        notes: Option<&str>,
    ) -> Result<EventLogRecord, OperatorError> {
        self.require_dead_letter(id).await?;

        let mut entries = Map::new();
        entries.insert(metadata_keys::ACKNOWLEDGED.to_string(), Value::Bool(true));
        entries.insert(
            metadata_keys::ACKNOWLEDGED_AT.to_string(),
            Value::String(self.clock.now().to_rfc3339()),
        );
        if let Some(notes) = notes {
            entries.insert(
                metadata_keys::ACKNOWLEDGEMENT_NOTES.to_string(),
                Value::String(notes.to_string()),
            );
        }

        let record = self.log.merge_metadata(id, entries).await?;
        tracing::info!(event_log_id = %id, event_name = %record.name, "Dead-lettered event acknowledged");
        OperatorMetrics::record_acknowledged();
        Ok(record)
    }

    /// Reset a dead-lettered row to `PENDING` and stamp `scheduled_for_replay_at`.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::NotFound`] for an unknown ID and
    /// [`OperatorError::NotEligible`] if the row is not `DEAD_LETTER`.
    pub async fn schedule_for_replay(&self, id: EventLogId) -> Result<EventLogRecord, OperatorError> {
        self.require_dead_letter(id).await?;
        self.log.reset_for_replay(id).await?;

        let mut entries = Map::new();
        entries.insert(
            metadata_keys::SCHEDULED_FOR_REPLAY_AT.to_string(),
            Value::String(self.clock.now().to_rfc3339()),
        );
        let record = self.log.merge_metadata(id, entries).await?;

        tracing::info!(event_log_id = %id, event_name = %record.name, "Dead-lettered event scheduled for replay");
        Ok(record)
    }

    /// Count, per-name breakdown and error window of the dead-letter queue.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Storage`] if the query fails.
    pub async fn stats(&self) -> Result<EventLogStats, OperatorError> {
        let filter = EventLogFilter::default().with_status(EventStatus::DeadLetter);
        Ok(self.log.stats(&filter).await?)
    }

    async fn require_dead_letter(&self, id: EventLogId) -> Result<EventLogRecord, OperatorError> {
        let record = self.log.get(id).await?;
        if record.status == EventStatus::DeadLetter {
            Ok(record)
        } else {
            tracing::warn!(event_log_id = %id, status = %record.status, "Event is not dead-lettered");
            Err(OperatorError::NotEligible {
                id,
                status: record.status,
            })
        }
    }
}

impl std::fmt::Debug for DeadLetterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterService").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use herald_core::event::Event;
    use herald_core::environment::Clock;
    use herald_testing::{InMemoryEventLog, ManualClock, test_clock};
    use serde_json::json;

    fn service(log: &Arc<InMemoryEventLog>) -> DeadLetterService {
        DeadLetterService::new(Arc::clone(log) as Arc<dyn EventLog>)
            .with_clock(Arc::new(test_clock()))
    }

    #[tokio::test]
    async fn list_only_returns_dead_letters() {
        let log = Arc::new(InMemoryEventLog::new());
        log.seed(&Event::new("A", json!({})), EventStatus::Processed, 0);
        let dead = log.seed(&Event::new("A", json!({})), EventStatus::DeadLetter, 3);

        let listed = service(&log)
            .list(
                &EventLogFilter::default().with_status(EventStatus::Processed),
                DEFAULT_LIST_LIMIT,
            )
            .await
            .unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, dead.id);
    }

    #[tokio::test]
    async fn list_puts_most_recent_failure_first() {
        let clock = ManualClock::new(test_clock().now());
        let log = Arc::new(InMemoryEventLog::with_clock(Arc::new(clock.clone())));
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = log.append(&Event::new("A", json!({}))).await.unwrap().id;
            log.mark_processing(id).await.unwrap();
            log.mark_dead_letter(id, "boom").await.unwrap();
            ids.push(id);
            clock.advance(chrono::Duration::minutes(5));
        }

        let listed = service(&log)
            .list(&EventLogFilter::default(), DEFAULT_LIST_LIMIT)
            .await
            .unwrap();

        let listed: Vec<_> = listed.iter().map(|r| r.id).collect();
        ids.reverse();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn acknowledge_records_notes() {
        let log = Arc::new(InMemoryEventLog::new());
        let dead = log.seed(&Event::new("A", json!({})), EventStatus::DeadLetter, 3);

        let record = service(&log)
            .acknowledge(dead.id, Some("upstream fixed"))
            .await
            .unwrap();

        assert!(record.is_acknowledged());
        assert_eq!(
            record.metadata.get(metadata_keys::ACKNOWLEDGEMENT_NOTES),
            Some(&json!("upstream fixed"))
        );
        assert_eq!(
            record.metadata.get(metadata_keys::ACKNOWLEDGED_AT),
            Some(&json!(test_clock().now().to_rfc3339()))
        );
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let log = Arc::new(InMemoryEventLog::new());
        let err = service(&log)
            .acknowledge(EventLogId::new(42), None)
            .await
            .unwrap_err();
        assert_eq!(err, OperatorError::NotFound(EventLogId::new(42)));
    }

    #[tokio::test]
    async fn schedule_for_replay_resets_and_stamps() {
        let log = Arc::new(InMemoryEventLog::new());
        let dead = log.seed(&Event::new("A", json!({})), EventStatus::DeadLetter, 3);

        let record = service(&log).schedule_for_replay(dead.id).await.unwrap();

        assert_eq!(record.status, EventStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.last_error, None);
        assert!(record
            .metadata
            .contains_key(metadata_keys::SCHEDULED_FOR_REPLAY_AT));
    }

    #[tokio::test]
    async fn stats_cover_dead_letters_only() {
        let log = Arc::new(InMemoryEventLog::new());
        log.seed(&Event::new("A", json!({})), EventStatus::DeadLetter, 3);
        log.seed(&Event::new("A", json!({})), EventStatus::DeadLetter, 3);
        log.seed(&Event::new("B", json!({})), EventStatus::DeadLetter, 3);
        log.seed(&Event::new("C", json!({})), EventStatus::Failed, 1);

        let stats = service(&log).stats().await.unwrap();

        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_event_name.get("A"), Some(&2));
        assert_eq!(stats.by_event_name.get("C"), None);
    }
}
