//! In-memory event log for fast, deterministic tests.
//!
//! Applies the same compare-and-set transition rules as the `PostgreSQL` log and
//! additionally records every status a row passes through, so tests can assert
//! whole lifecycles (`PENDING → PROCESSING → FAILED → ...`).

#![allow(clippy::missing_panics_doc)] // Lock poisoning is recovered, never panics

use herald_core::environment::{Clock, SystemClock};
use herald_core::event::Event;
use herald_core::event_log::{
    EventLog, EventLogError, EventLogFilter, EventLogId, EventLogRecord, EventLogStats,
    EventStatus, LogFuture, LogOrder, MAX_ERROR_LENGTH, truncate_error,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct LogState {
    next_id: i64,
    records: BTreeMap<EventLogId, EventLogRecord>,
    history: HashMap<EventLogId, Vec<EventStatus>>,
    fail_appends: bool,
}

/// `BTreeMap`-backed [`EventLog`].
///
/// Cloning shares the underlying storage.
///
/// # Example
///
/// ```
/// use herald_core::event::Event;
/// use herald_core::event_log::{EventLog, EventStatus};
/// use herald_testing::InMemoryEventLog;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = InMemoryEventLog::new();
/// let record = log.append(&Event::new("OrderPlaced", json!({}))).await?;
/// log.mark_processing(record.id).await?;
/// log.mark_processed(record.id).await?;
///
/// assert_eq!(
///     log.history(record.id),
///     vec![EventStatus::Pending, EventStatus::Processing, EventStatus::Processed]
/// );
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryEventLog {
    state: Arc<Mutex<LogState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventLog {
    /// Create an empty log using wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty log with an injected clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState::default())),
            clock,
        }
    }

    /// Make subsequent appends fail with a database error.
    pub fn fail_appends(&self, fail: bool) {
        self.lock().fail_appends = fail;
    }

    /// Insert a row directly in a given status, bypassing the state machine.
    ///
    /// Useful for seeding operator-service tests.
    pub fn seed(&self, event: &Event, status: EventStatus, retry_count: u32) -> EventLogRecord {
        let now = self.clock.now();
        let mut state = self.lock();
        state.next_id += 1;
        let id = EventLogId::new(state.next_id);

        let mut record = EventLogRecord::pending(id, event, now);
        record.status = status;
        record.retry_count = retry_count;
        if retry_count > 0 {
            record.last_error = Some("seeded failure".to_string());
            record.last_error_at = Some(now);
        }

        state.records.insert(id, record.clone());
        state.history.insert(id, vec![status]);
        record
    }

    /// Every status a row has been in, oldest first.
    #[must_use]
    pub fn history(&self, id: EventLogId) -> Vec<EventStatus> {
        self.lock().history.get(&id).cloned().unwrap_or_default()
    }

    /// Snapshot of a row, if it exists.
    #[must_use]
    pub fn record(&self, id: EventLogId) -> Option<EventLogRecord> {
        self.lock().records.get(&id).cloned()
    }

    /// All rows in insertion order.
    #[must_use]
    pub fn records(&self) -> Vec<EventLogRecord> {
        self.lock().records.values().cloned().collect()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether the log has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Remove every row (for test isolation).
    pub fn clear(&self) {
        let mut state = self.lock();
        state.records.clear();
        state.history.clear();
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        &self,
        id: EventLogId,
        to: EventStatus,
        apply: impl FnOnce(&mut EventLogRecord),
    ) -> Result<EventLogRecord, EventLogError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let record = state
            .records
            .get_mut(&id)
            .ok_or(EventLogError::NotFound(id))?;

        if !record.status.can_transition_to(to) {
            return Err(EventLogError::InvalidTransition {
                id,
                from: record.status,
                to,
            });
        }

        record.status = to;
        apply(record);
        state.history.entry(id).or_default().push(to);
        Ok(record.clone())
    }

    fn record_failure(
        &self,
        id: EventLogId,
        to: EventStatus,
        error: &str,
    ) -> Result<EventLogRecord, EventLogError> {
        let now = self.clock.now();
        let error = truncate_error(error, MAX_ERROR_LENGTH);
        self.transition(id, to, |record| {
            record.retry_count = record.retry_count.saturating_add(1);
            record.last_error = Some(error);
            record.last_error_at = Some(now);
        })
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventLog")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

fn sort_records(records: &mut [EventLogRecord], order: LogOrder) {
    match order {
        LogOrder::RecentErrorFirst => records.sort_by(|a, b| {
            b.last_error_at
                .cmp(&a.last_error_at)
                .then_with(|| b.id.cmp(&a.id))
        }),
        LogOrder::Chronological => {
            records.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at).then_with(|| a.id.cmp(&b.id)));
        }
        LogOrder::NewestFirst => {
            records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        }
    }
}

impl EventLog for InMemoryEventLog {
    fn append<'a>(&'a self, event: &'a Event) -> LogFuture<'a, EventLogRecord> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut state = self.lock();
            if state.fail_appends {
                return Err(EventLogError::Database(
                    "simulated append failure".to_string(),
                ));
            }

            state.next_id += 1;
            let id = EventLogId::new(state.next_id);
            let record = EventLogRecord::pending(id, event, now);
            state.records.insert(id, record.clone());
            state.history.insert(id, vec![EventStatus::Pending]);
            Ok(record)
        })
    }

    fn get(&self, id: EventLogId) -> LogFuture<'_, EventLogRecord> {
        Box::pin(async move {
            self.lock()
                .records
                .get(&id)
                .cloned()
                .ok_or(EventLogError::NotFound(id))
        })
    }

    fn mark_processing(&self, id: EventLogId) -> LogFuture<'_, EventLogRecord> {
        Box::pin(async move { self.transition(id, EventStatus::Processing, |_| {}) })
    }

    fn mark_processed(&self, id: EventLogId) -> LogFuture<'_, EventLogRecord> {
        Box::pin(async move { self.transition(id, EventStatus::Processed, |_| {}) })
    }

    fn mark_failed<'a>(
        &'a self,
        id: EventLogId,
        error: &'a str,
    ) -> LogFuture<'a, EventLogRecord> {
        Box::pin(async move { self.record_failure(id, EventStatus::Failed, error) })
    }

    fn mark_dead_letter<'a>(
        &'a self,
        id: EventLogId,
        error: &'a str,
    ) -> LogFuture<'a, EventLogRecord> {
        Box::pin(async move { self.record_failure(id, EventStatus::DeadLetter, error) })
    }

    fn reset_for_replay(&self, id: EventLogId) -> LogFuture<'_, EventLogRecord> {
        Box::pin(async move {
            self.transition(id, EventStatus::Pending, |record| {
                record.retry_count = 0;
                record.last_error = None;
                record.last_error_at = None;
            })
        })
    }

    fn merge_metadata(
        &self,
        id: EventLogId,
        entries: Map<String, Value>,
    ) -> LogFuture<'_, EventLogRecord> {
        Box::pin(async move {
            let mut state = self.lock();
            let record = state
                .records
                .get_mut(&id)
                .ok_or(EventLogError::NotFound(id))?;
            record.metadata.extend(entries);
            Ok(record.clone())
        })
    }

    fn query<'a>(
        &'a self,
        filter: &'a EventLogFilter,
        order: LogOrder,
        limit: usize,
    ) -> LogFuture<'a, Vec<EventLogRecord>> {
        Box::pin(async move {
            let mut matching: Vec<EventLogRecord> = self
                .lock()
                .records
                .values()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect();
            sort_records(&mut matching, order);
            matching.truncate(limit);
            Ok(matching)
        })
    }

    fn stats<'a>(&'a self, filter: &'a EventLogFilter) -> LogFuture<'a, EventLogStats> {
        Box::pin(async move {
            let mut stats = EventLogStats::default();
            for record in self.lock().records.values().filter(|r| filter.matches(r)) {
                stats.record(record);
            }
            Ok(stats)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::mocks::test_clock;
    use proptest::prelude::*;
    use serde_json::json;

    fn event(name: &str) -> Event {
        Event::new(name, json!({ "n": 1 }))
    }

    #[tokio::test]
    async fn append_creates_pending_row() {
        let log = InMemoryEventLog::with_clock(Arc::new(test_clock()));
        let record = log.append(&event("OrderPlaced")).await.unwrap();

        assert_eq!(record.status, EventStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.created_at, test_clock().now());
        assert_eq!(log.get(record.id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn failed_append_leaves_log_empty() {
        let log = InMemoryEventLog::new();
        log.fail_appends(true);

        let err = log.append(&event("OrderPlaced")).await.unwrap_err();
        assert!(matches!(err, EventLogError::Database(_)));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn failure_sets_error_and_timestamp_together() {
        let log = InMemoryEventLog::new();
        let id = log.append(&event("X")).await.unwrap().id;
        log.mark_processing(id).await.unwrap();

        let failed = log.mark_failed(id, "boom").await.unwrap();
        assert_eq!(failed.status, EventStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
        assert!(failed.last_error_at.is_some());

        let reset = log.reset_for_replay(id).await.unwrap();
        assert_eq!(reset.retry_count, 0);
        assert!(reset.last_error.is_none());
        assert!(reset.last_error_at.is_none());
    }

    #[tokio::test]
    async fn long_error_is_truncated_to_bound() {
        let log = InMemoryEventLog::new();
        let id = log.append(&event("X")).await.unwrap().id;
        log.mark_processing(id).await.unwrap();

        let long = "e".repeat(MAX_ERROR_LENGTH + 250);
        let record = log.mark_dead_letter(id, &long).await.unwrap();

        assert_eq!(record.last_error.unwrap().len(), MAX_ERROR_LENGTH);
    }

    #[tokio::test]
    async fn rejected_transition_leaves_row_untouched() {
        let log = InMemoryEventLog::new();
        let id = log.append(&event("X")).await.unwrap().id;

        let err = log.mark_processed(id).await.unwrap_err();
        assert_eq!(
            err,
            EventLogError::InvalidTransition {
                id,
                from: EventStatus::Pending,
                to: EventStatus::Processed,
            }
        );
        assert_eq!(log.history(id), vec![EventStatus::Pending]);
    }

    #[tokio::test]
    async fn dead_letter_cannot_be_picked_up_again() {
        let log = InMemoryEventLog::new();
        let record = log.seed(&event("X"), EventStatus::DeadLetter, 3);

        assert!(log.mark_processing(record.id).await.is_err());
        assert_eq!(
            log.get(record.id).await.unwrap().status,
            EventStatus::DeadLetter
        );
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let log = InMemoryEventLog::new();
        let missing = EventLogId::new(99);

        assert_eq!(
            log.mark_processing(missing).await.unwrap_err(),
            EventLogError::NotFound(missing)
        );
        assert_eq!(
            log.merge_metadata(missing, Map::new()).await.unwrap_err(),
            EventLogError::NotFound(missing)
        );
    }

    #[tokio::test]
    async fn query_orders_and_limits() {
        let log = InMemoryEventLog::new();
        let base = test_clock().now();
        let late = log.seed(
            &event("X").with_occurred_at(base + chrono::Duration::hours(2)),
            EventStatus::Processed,
            0,
        );
        let early = log.seed(&event("X").with_occurred_at(base), EventStatus::Processed, 0);
        log.seed(&event("Y").with_occurred_at(base), EventStatus::Processed, 0);

        let filter = EventLogFilter::default().with_event_name("X");
        let rows = log.query(&filter, LogOrder::Chronological, 10).await.unwrap();
        assert_eq!(
            rows.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![early.id, late.id]
        );

        let limited = log.query(&filter, LogOrder::Chronological, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, early.id);
    }

    #[tokio::test]
    async fn recent_error_first_puts_errorless_rows_last() {
        let log = InMemoryEventLog::new();
        let clean = log.seed(&event("X"), EventStatus::Pending, 0);
        let errored = log.seed(&event("X"), EventStatus::DeadLetter, 2);

        let rows = log
            .query(&EventLogFilter::default(), LogOrder::RecentErrorFirst, 10)
            .await
            .unwrap();
        assert_eq!(rows[0].id, errored.id);
        assert_eq!(rows[1].id, clean.id);
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Fail,
        DeadLetter,
        Reset,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Fail), Just(Op::DeadLetter), Just(Op::Reset)]
    }

    proptest! {
        #[test]
        fn retry_count_equals_failures_since_last_reset(ops in proptest::collection::vec(op(), 0..20)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let log = InMemoryEventLog::new();
                let id = log.append(&event("X")).await.unwrap().id;
                let mut expected = 0u32;

                for op in ops {
                    match op {
                        Op::Fail | Op::DeadLetter => {
                            let current = log.get(id).await.unwrap().status;
                            if current == EventStatus::DeadLetter {
                                log.reset_for_replay(id).await.unwrap();
                                expected = 0;
                            }
                            log.mark_processing(id).await.unwrap();
                            if matches!(op, Op::Fail) {
                                log.mark_failed(id, "f").await.unwrap();
                            } else {
                                log.mark_dead_letter(id, "d").await.unwrap();
                            }
                            expected += 1;
                        }
                        Op::Reset => {
                            log.reset_for_replay(id).await.unwrap();
                            expected = 0;
                        }
                    }
                    prop_assert_eq!(log.get(id).await.unwrap().retry_count, expected);
                }
                Ok(())
            })?;
        }
    }
}
