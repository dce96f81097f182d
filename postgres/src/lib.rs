//! `PostgreSQL` event log for Herald.
//!
//! This crate provides the production [`EventLog`](herald_core::EventLog)
//! implementation. It uses sqlx and supports:
//!
//! - Compare-and-set status transitions in a single `UPDATE ... RETURNING`
//! - Atomic metadata merges (`metadata || $2`)
//! - Filtered operator queries and dead-letter statistics
//! - Embedded migrations for the `event_log` table
//!
//! # Example
//!
//! ```no_run
//! use herald_postgres::PostgresEventLog;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let log = PostgresEventLog::connect("postgres://localhost/herald").await?;
//! log.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// `event_log` table access
pub mod event_log;

pub use event_log::PostgresEventLog;
