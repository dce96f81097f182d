//! Event log abstraction: the durable system of record for published events.
//!
//! Every event handed to the bus is appended here *before* dispatch is attempted,
//! so a failed dispatch can always be recovered from storage. Each row carries a
//! processing [`EventStatus`] and retry bookkeeping.
//!
//! # State Machine
//!
//! ```text
//!            ┌──────────┐  dispatch starts   ┌────────────┐  all handlers ok  ┌───────────┐
//!  append ──►│ PENDING  │───────────────────►│ PROCESSING │──────────────────►│ PROCESSED │
//!            └──────────┘                    └────────────┘                   └───────────┘
//!                 ▲                            │      ▲
//!                 │                   failure  │      │ scheduled retry
//!                 │                            ▼      │
//!                 │                          ┌────────────┐ retries exhausted ┌─────────────┐
//!                 │                          │   FAILED   │──────────────────►│ DEAD_LETTER │
//!                 │                          └────────────┘                   └─────────────┘
//!                 │                                                                  │
//!                 └──────────────────── operator: reset_for_replay ◄─────────────────┘
//! ```
//!
//! Every transition is a compare-and-set against [`EventStatus::allowed_sources`],
//! so two workers racing on the same row cannot lose an update, and nothing but
//! [`EventLog::reset_for_replay`] ever moves a row out of `DEAD_LETTER`.
//!
//! # Implementations
//!
//! - `PostgresEventLog` (in `herald-postgres`): production storage
//! - `InMemoryEventLog` (in `herald-testing`): fast, deterministic tests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

use crate::event::{Event, metadata_keys};

/// Upper bound on stored error text, in characters.
pub const MAX_ERROR_LENGTH: usize = 5000;

/// Boxed future returned by [`EventLog`] methods.
pub type LogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventLogError>> + Send + 'a>>;

/// Opaque identifier assigned to a row at persistence time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventLogId(i64);

impl EventLogId {
    /// Wrap a raw row ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw row ID.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EventLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Processing status of an event log row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Persisted, dispatch not yet started.
    Pending,
    /// A dispatch attempt is in flight.
    Processing,
    /// All handlers ran. Terminal.
    Processed,
    /// The last attempt failed and a retry may follow.
    Failed,
    /// Retries exhausted. Terminal until an operator resets it.
    DeadLetter,
}

impl EventStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Processed,
        Self::Failed,
        Self::DeadLetter,
    ];

    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Processed => "PROCESSED",
            Self::Failed => "FAILED",
            Self::DeadLetter => "DEAD_LETTER",
        }
    }

    /// Parse a database string.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::Serialization`] if the string is not a known status.
    pub fn parse(s: &str) -> Result<Self, EventLogError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "PROCESSED" => Ok(Self::Processed),
            "FAILED" => Ok(Self::Failed),
            "DEAD_LETTER" => Ok(Self::DeadLetter),
            _ => Err(EventLogError::Serialization(format!(
                "Invalid event status: {s}"
            ))),
        }
    }

    /// Statuses a row may be in for a transition *into* `self` to succeed.
    ///
    /// `PROCESSING → PROCESSING` is allowed so a task redelivered after a worker
    /// crash can continue; `PROCESSING` is not a valid source for a reset because
    /// an attempt is still in flight.
    #[must_use]
    pub const fn allowed_sources(&self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Pending, Self::Processed, Self::Failed, Self::DeadLetter],
            Self::Processing => &[Self::Pending, Self::Failed, Self::Processing],
            Self::Processed | Self::Failed => &[Self::Processing],
            Self::DeadLetter => &[Self::Processing, Self::Failed],
        }
    }

    /// Whether a row in `self` may move to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        next.allowed_sources().contains(self)
    }

    /// Whether no automatic process will move a row out of this status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::DeadLetter)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during event log operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventLogError {
    /// No row with this ID exists.
    #[error("Event log record not found: {0}")]
    NotFound(EventLogId),

    /// The row's current status does not permit the requested transition.
    #[error("Invalid transition for event log record {id}: {from} -> {to}")]
    InvalidTransition {
        /// The row.
        id: EventLogId,
        /// Status the row was found in.
        from: EventStatus,
        /// Status that was requested.
        to: EventStatus,
    },

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Stored data could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A durable event log row.
///
/// The identity and event fields are copied from the [`Event`] at append time and
/// never change. `status`, `retry_count`, `last_error` and `last_error_at` are the
/// mutable lifecycle fields; `metadata` only ever gains keys through
/// [`EventLog::merge_metadata`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventLogRecord {
    /// Row identity.
    pub id: EventLogId,
    /// Event type name.
    pub name: String,
    /// Business payload.
    pub payload: Map<String, Value>,
    /// When the business fact happened.
    pub occurred_at: DateTime<Utc>,
    /// Acting user, if any.
    pub user_id: Option<i64>,
    /// Correlation ID, if any.
    pub correlation_id: Option<String>,
    /// Contextual metadata.
    pub metadata: Map<String, Value>,
    /// When the row was inserted.
    pub created_at: DateTime<Utc>,
    /// Processing status.
    pub status: EventStatus,
    /// Number of failed attempts since the last reset.
    pub retry_count: u32,
    /// Most recent error text, bounded by [`MAX_ERROR_LENGTH`].
    pub last_error: Option<String>,
    /// When the most recent error was recorded.
    pub last_error_at: Option<DateTime<Utc>>,
}

impl EventLogRecord {
    /// Build the initial `PENDING` row for an event.
    #[must_use]
    pub fn pending(id: EventLogId, event: &Event, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: event.name().to_string(),
            payload: event.payload().clone(),
            occurred_at: event.occurred_at(),
            user_id: event.user_id(),
            correlation_id: event.correlation_id().map(str::to_string),
            metadata: event.metadata().clone(),
            created_at,
            status: EventStatus::Pending,
            retry_count: 0,
            last_error: None,
            last_error_at: None,
        }
    }

    /// Rebuild the event this row was created from.
    ///
    /// Metadata is copied as stored; callers extend the copy as needed.
    #[must_use]
    pub fn to_event(&self) -> Event {
        Event::new(self.name.clone(), Value::Object(self.payload.clone()))
            .with_occurred_at(self.occurred_at)
            .with_maybe_user_id(self.user_id)
            .with_maybe_correlation_id(self.correlation_id.clone())
            .with_metadata(self.metadata.clone())
    }

    /// Whether an operator has acknowledged this row.
    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        self.metadata
            .get(metadata_keys::ACKNOWLEDGED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Filter for operator queries. Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventLogFilter {
    /// Exact status.
    pub status: Option<EventStatus>,
    /// Exact event name.
    pub event_name: Option<String>,
    /// Inclusive lower bound on `occurred_at`.
    pub from_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `occurred_at`.
    pub to_date: Option<DateTime<Utc>>,
    /// Exact correlation ID.
    pub correlation_id: Option<String>,
    /// Exact acting user.
    pub user_id: Option<i64>,
    /// Minimum `retry_count`.
    pub min_retry_count: Option<u32>,
}

impl EventLogFilter {
    /// Filter on status.
    #[must_use]
    pub const fn with_status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter on event name.
    #[must_use]
    pub fn with_event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = Some(name.into());
        self
    }

    /// Filter on an inclusive `occurred_at` range; either end may be open.
    #[must_use]
    pub const fn with_date_range(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.from_date = from;
        self.to_date = to;
        self
    }

    /// Filter on correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Filter on acting user.
    #[must_use]
    pub const fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Filter on minimum retry count.
    #[must_use]
    pub const fn with_min_retry_count(mut self, min: u32) -> Self {
        self.min_retry_count = Some(min);
        self
    }

    /// Whether a record satisfies every set criterion.
    #[must_use]
    pub fn matches(&self, record: &EventLogRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self
                .event_name
                .as_deref()
                .is_none_or(|n| record.name == n)
            && self.from_date.is_none_or(|from| record.occurred_at >= from)
            && self.to_date.is_none_or(|to| record.occurred_at <= to)
            && self
                .correlation_id
                .as_deref()
                .is_none_or(|c| record.correlation_id.as_deref() == Some(c))
            && self.user_id.is_none_or(|u| record.user_id == Some(u))
            && self
                .min_retry_count
                .is_none_or(|min| record.retry_count >= min)
    }
}

/// Result ordering for [`EventLog::query`]. Every order ends with an ID
/// tie-break so results are deterministic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogOrder {
    /// `last_error_at` descending (rows without an error last), then ID descending.
    RecentErrorFirst,
    /// `occurred_at` ascending, then ID ascending. Preserves causal order for replay.
    Chronological,
    /// `created_at` descending, then ID descending.
    NewestFirst,
}

/// Aggregate figures over a filtered set of rows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventLogStats {
    /// Number of matching rows.
    pub total: u64,
    /// Matching rows per event name.
    pub by_event_name: BTreeMap<String, u64>,
    /// Earliest `last_error_at` among matching rows.
    pub oldest_error_at: Option<DateTime<Utc>>,
    /// Latest `last_error_at` among matching rows.
    pub newest_error_at: Option<DateTime<Utc>>,
}

impl EventLogStats {
    /// Fold one row into the figures.
    pub fn record(&mut self, record: &EventLogRecord) {
        self.total += 1;
        *self.by_event_name.entry(record.name.clone()).or_insert(0) += 1;
        if let Some(at) = record.last_error_at {
            self.oldest_error_at = Some(self.oldest_error_at.map_or(at, |o| o.min(at)));
            self.newest_error_at = Some(self.newest_error_at.map_or(at, |n| n.max(at)));
        }
    }
}

/// Truncate error text to at most `max` characters without splitting a character.
#[must_use]
pub fn truncate_error(error: &str, max: usize) -> String {
    match error.char_indices().nth(max) {
        Some((byte_index, _)) => error[..byte_index].to_string(),
        None => error.to_string(),
    }
}

/// Durable store of every published event and its processing status.
///
/// # Atomicity
///
/// Each `mark_*`/`reset_for_replay` method is a single compare-and-set: it checks
/// the row's current status against the target's
/// [`allowed_sources`](EventStatus::allowed_sources) and applies the update in one
/// step. A rejected transition returns [`EventLogError::InvalidTransition`] and
/// leaves the row untouched.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the log can be shared as `Arc<dyn EventLog>`
/// between the bus, the dispatch worker and the operator services.
pub trait EventLog: Send + Sync {
    /// Persist a new `PENDING` row with `retry_count = 0`.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::Database`] if the write fails.
    fn append<'a>(&'a self, event: &'a Event) -> LogFuture<'a, EventLogRecord>;

    /// Fetch a row by ID.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::NotFound`] if the row does not exist.
    fn get(&self, id: EventLogId) -> LogFuture<'_, EventLogRecord>;

    /// Move a row to `PROCESSING`.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::NotFound`] or [`EventLogError::InvalidTransition`].
    fn mark_processing(&self, id: EventLogId) -> LogFuture<'_, EventLogRecord>;

    /// Move a row to `PROCESSED`.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::NotFound`] or [`EventLogError::InvalidTransition`].
    fn mark_processed(&self, id: EventLogId) -> LogFuture<'_, EventLogRecord>;

    /// Move a row to `FAILED`, incrementing `retry_count` and recording the error.
    ///
    /// The error text is truncated to [`MAX_ERROR_LENGTH`] characters.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::NotFound`] or [`EventLogError::InvalidTransition`].
    fn mark_failed<'a>(&'a self, id: EventLogId, error: &'a str)
    -> LogFuture<'a, EventLogRecord>;

    /// Move a row to `DEAD_LETTER`, incrementing `retry_count` and recording the error.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::NotFound`] or [`EventLogError::InvalidTransition`].
    fn mark_dead_letter<'a>(
        &'a self,
        id: EventLogId,
        error: &'a str,
    ) -> LogFuture<'a, EventLogRecord>;

    /// Move a row back to `PENDING`, zeroing `retry_count` and clearing the error.
    ///
    /// This is the only way out of `DEAD_LETTER`.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::NotFound`] or [`EventLogError::InvalidTransition`].
    fn reset_for_replay(&self, id: EventLogId) -> LogFuture<'_, EventLogRecord>;

    /// Shallow-merge `entries` into the row's metadata. Never changes status.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::NotFound`] if the row does not exist.
    fn merge_metadata(
        &self,
        id: EventLogId,
        entries: Map<String, Value>,
    ) -> LogFuture<'_, EventLogRecord>;

    /// Query rows matching `filter`, in `order`, returning at most `limit` rows.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::Database`] if the query fails.
    fn query<'a>(
        &'a self,
        filter: &'a EventLogFilter,
        order: LogOrder,
        limit: usize,
    ) -> LogFuture<'a, Vec<EventLogRecord>>;

    /// Aggregate figures over rows matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::Database`] if the query fails.
    fn stats<'a>(&'a self, filter: &'a EventLogFilter) -> LogFuture<'a, EventLogStats>;
}
