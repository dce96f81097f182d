//! [`EventLog`] backed by the `event_log` table.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE event_log (
//!     id BIGSERIAL PRIMARY KEY,
//!     name TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     occurred_at TIMESTAMPTZ NOT NULL,
//!     user_id BIGINT,
//!     correlation_id TEXT,
//!     metadata JSONB NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     status TEXT NOT NULL DEFAULT 'PENDING',
//!     retry_count INTEGER NOT NULL DEFAULT 0,
//!     last_error TEXT,
//!     last_error_at TIMESTAMPTZ
//! );
//! ```
//!
//! The full DDL, including indexes, lives in `migrations/` and is applied by
//! [`PostgresEventLog::migrate`].

use chrono::{DateTime, Utc};
use herald_core::event::Event;
use herald_core::event_log::{
    EventLog, EventLogError, EventLogFilter, EventLogId, EventLogRecord, EventLogStats,
    EventStatus, LogFuture, LogOrder, MAX_ERROR_LENGTH, truncate_error,
};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

const COLUMNS: &str = "id, name, payload, occurred_at, user_id, correlation_id, metadata, \
                       created_at, status, retry_count, last_error, last_error_at";

/// What a guarded status update writes besides `status`.
enum Update {
    StatusOnly,
    Failure(String),
    Reset,
}

impl Update {
    fn sql(&self) -> String {
        let set = match self {
            Self::StatusOnly => "status = $2",
            Self::Failure(_) => {
                "status = $2, retry_count = retry_count + 1, last_error = $4, last_error_at = now()"
            }
            Self::Reset => {
                "status = $2, retry_count = 0, last_error = NULL, last_error_at = NULL"
            }
        };
        format!(
            "UPDATE event_log SET {set} WHERE id = $1 AND status = ANY($3) RETURNING {COLUMNS}"
        )
    }
}

/// PostgreSQL-backed event log.
///
/// Cloning shares the connection pool.
#[derive(Clone, Debug)]
pub struct PostgresEventLog {
    pool: PgPool,
}

impl PostgresEventLog {
    /// Create an event log over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a pool of up to 10 connections.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::Database`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, EventLogError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| EventLogError::Database(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Create the `event_log` table and its indexes if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns [`EventLogError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), EventLogError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EventLogError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn transition(
        &self,
        id: EventLogId,
        to: EventStatus,
        update: Update,
    ) -> Result<EventLogRecord, EventLogError> {
        let sources: Vec<&'static str> = to.allowed_sources().iter().map(EventStatus::as_str).collect();
        let sql = update.sql();

        let mut query = sqlx::query(&sql)
            .bind(id.value())
            .bind(to.as_str())
            .bind(sources);
        if let Update::Failure(error) = &update {
            query = query.bind(error.as_str());
        }

        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error)?;

        match row {
            Some(row) => {
                let record = row_to_record(&row)?;
                tracing::debug!(
                    event_log_id = %id,
                    status = %record.status,
                    retry_count = record.retry_count,
                    "Event log status updated"
                );
                Ok(record)
            }
            None => Err(self.rejection(id, to).await),
        }
    }

    /// Explain why a guarded update matched no row.
    async fn rejection(&self, id: EventLogId, to: EventStatus) -> EventLogError {
        let current: Result<Option<(String,)>, _> =
            sqlx::query_as("SELECT status FROM event_log WHERE id = $1")
                .bind(id.value())
                .fetch_optional(&self.pool)
                .await;

        match current {
            Ok(None) => EventLogError::NotFound(id),
            Ok(Some((status,))) => match EventStatus::parse(&status) {
                Ok(from) => {
                    tracing::debug!(event_log_id = %id, %from, %to, "Event log transition rejected");
                    metrics::counter!(
                        "herald_event_log_transitions_rejected_total",
                        "to" => to.as_str()
                    )
                    .increment(1);
                    EventLogError::InvalidTransition { id, from, to }
                }
                Err(e) => e,
            },
            Err(e) => database_error(e),
        }
    }

    async fn fetch_one_by_id(&self, id: EventLogId) -> Result<EventLogRecord, EventLogError> {
        let sql = format!("SELECT {COLUMNS} FROM event_log WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.value())
            .fetch_optional(&self.pool)
            .await
            .map_err(database_error)?
            .ok_or(EventLogError::NotFound(id))?;

        row_to_record(&row)
    }
}

impl EventLog for PostgresEventLog {
    fn append<'a>(&'a self, event: &'a Event) -> LogFuture<'a, EventLogRecord> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO event_log (name, payload, occurred_at, user_id, correlation_id, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 RETURNING {COLUMNS}"
            );

            let row = sqlx::query(&sql)
                .bind(event.name())
                .bind(Value::Object(event.payload().clone()))
                .bind(event.occurred_at())
                .bind(event.user_id())
                .bind(event.correlation_id())
                .bind(Value::Object(event.metadata().clone()))
                .fetch_one(&self.pool)
                .await
                .map_err(database_error)?;

            let record = row_to_record(&row)?;
            tracing::debug!(event_log_id = %record.id, event_name = %record.name, "Event logged");
            Ok(record)
        })
    }

    fn get(&self, id: EventLogId) -> LogFuture<'_, EventLogRecord> {
        Box::pin(self.fetch_one_by_id(id))
    }

    fn mark_processing(&self, id: EventLogId) -> LogFuture<'_, EventLogRecord> {
        Box::pin(self.transition(id, EventStatus::Processing, Update::StatusOnly))
    }

    fn mark_processed(&self, id: EventLogId) -> LogFuture<'_, EventLogRecord> {
        Box::pin(self.transition(id, EventStatus::Processed, Update::StatusOnly))
    }

    fn mark_failed<'a>(
        &'a self,
        id: EventLogId,
        error: &'a str,
    ) -> LogFuture<'a, EventLogRecord> {
        let error = truncate_error(error, MAX_ERROR_LENGTH);
        Box::pin(self.transition(id, EventStatus::Failed, Update::Failure(error)))
    }

    fn mark_dead_letter<'a>(
        &'a self,
        id: EventLogId,
        error: &'a str,
    ) -> LogFuture<'a, EventLogRecord> {
        let error = truncate_error(error, MAX_ERROR_LENGTH);
        Box::pin(self.transition(id, EventStatus::DeadLetter, Update::Failure(error)))
    }

    fn reset_for_replay(&self, id: EventLogId) -> LogFuture<'_, EventLogRecord> {
        Box::pin(self.transition(id, EventStatus::Pending, Update::Reset))
    }

    fn merge_metadata(
        &self,
        id: EventLogId,
        entries: Map<String, Value>,
    ) -> LogFuture<'_, EventLogRecord> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE event_log SET metadata = metadata || $2 WHERE id = $1 RETURNING {COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(id.value())
                .bind(Value::Object(entries))
                .fetch_optional(&self.pool)
                .await
                .map_err(database_error)?
                .ok_or(EventLogError::NotFound(id))?;

            row_to_record(&row)
        })
    }

    fn query<'a>(
        &'a self,
        filter: &'a EventLogFilter,
        order: LogOrder,
        limit: usize,
    ) -> LogFuture<'a, Vec<EventLogRecord>> {
        Box::pin(async move {
            let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM event_log"));
            push_filter(&mut builder, filter);
            builder.push(order_clause(order));
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

            let rows = builder
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(database_error)?;

            rows.iter().map(row_to_record).collect()
        })
    }

    fn stats<'a>(&'a self, filter: &'a EventLogFilter) -> LogFuture<'a, EventLogStats> {
        Box::pin(async move {
            let mut builder = QueryBuilder::<Postgres>::new(
                "SELECT name, COUNT(*) AS total, \
                 MIN(last_error_at) AS oldest_error_at, MAX(last_error_at) AS newest_error_at \
                 FROM event_log",
            );
            push_filter(&mut builder, filter);
            builder.push(" GROUP BY name");

            let rows = builder
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(database_error)?;

            let mut stats = EventLogStats::default();
            for row in &rows {
                let name: String = row.try_get("name").map_err(database_error)?;
                let total: i64 = row.try_get("total").map_err(database_error)?;
                let oldest: Option<DateTime<Utc>> =
                    row.try_get("oldest_error_at").map_err(database_error)?;
                let newest: Option<DateTime<Utc>> =
                    row.try_get("newest_error_at").map_err(database_error)?;

                let total = u64::try_from(total).unwrap_or(0);
                stats.total += total;
                stats.by_event_name.insert(name, total);
                stats.oldest_error_at = min_option(stats.oldest_error_at, oldest);
                stats.newest_error_at = stats.newest_error_at.max(newest);
            }
            Ok(stats)
        })
    }
}

fn min_option(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &EventLogFilter) {
    builder.push(" WHERE TRUE");
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(name) = &filter.event_name {
        builder.push(" AND name = ").push_bind(name.clone());
    }
    if let Some(from) = filter.from_date {
        builder.push(" AND occurred_at >= ").push_bind(from);
    }
    if let Some(to) = filter.to_date {
        builder.push(" AND occurred_at <= ").push_bind(to);
    }
    if let Some(correlation_id) = &filter.correlation_id {
        builder
            .push(" AND correlation_id = ")
            .push_bind(correlation_id.clone());
    }
    if let Some(user_id) = filter.user_id {
        builder.push(" AND user_id = ").push_bind(user_id);
    }
    if let Some(min) = filter.min_retry_count {
        builder
            .push(" AND retry_count >= ")
            .push_bind(i64::from(min));
    }
}

const fn order_clause(order: LogOrder) -> &'static str {
    match order {
        LogOrder::RecentErrorFirst => " ORDER BY last_error_at DESC NULLS LAST, id DESC",
        LogOrder::Chronological => " ORDER BY occurred_at ASC, id ASC",
        LogOrder::NewestFirst => " ORDER BY created_at DESC, id DESC",
    }
}

#[allow(clippy::needless_pass_by_value)] // Used as a map_err adapter
fn database_error(e: sqlx::Error) -> EventLogError {
    EventLogError::Database(e.to_string())
}

fn json_object(value: Value, column: &str) -> Result<Map<String, Value>, EventLogError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(EventLogError::Serialization(format!(
            "Column {column} is not a JSON object: {other}"
        ))),
    }
}

/// Convert a database row to an [`EventLogRecord`].
fn row_to_record(row: &PgRow) -> Result<EventLogRecord, EventLogError> {
    let status: String = row.try_get("status").map_err(database_error)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(database_error)?;
    let payload: Value = row.try_get("payload").map_err(database_error)?;
    let metadata: Value = row.try_get("metadata").map_err(database_error)?;

    Ok(EventLogRecord {
        id: EventLogId::new(row.try_get("id").map_err(database_error)?),
        name: row.try_get("name").map_err(database_error)?,
        payload: json_object(payload, "payload")?,
        occurred_at: row.try_get("occurred_at").map_err(database_error)?,
        user_id: row.try_get("user_id").map_err(database_error)?,
        correlation_id: row.try_get("correlation_id").map_err(database_error)?,
        metadata: json_object(metadata, "metadata")?,
        created_at: row.try_get("created_at").map_err(database_error)?,
        status: EventStatus::parse(&status)?,
        retry_count: u32::try_from(retry_count).map_err(|_| {
            EventLogError::Serialization(format!("Negative retry_count: {retry_count}"))
        })?,
        last_error: row.try_get("last_error").map_err(database_error)?,
        last_error_at: row.try_get("last_error_at").map_err(database_error)?,
    })
}
