//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the bus components:
//! - Publishing and inline dispatch
//! - Dispatch worker outcomes
//! - Operator actions (dead-letter acknowledgement, replay)
//!
//! # Example
//!
//! ```rust,no_run
//! use herald_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Metric names.
pub mod names {
    /// Events handed to `publish`.
    pub const EVENTS_PUBLISHED: &str = "herald_bus_events_published_total";
    /// Events dispatched after the event log append failed.
    pub const UNRECORDED_DISPATCH: &str = "herald_bus_unrecorded_dispatch_total";
    /// Queued publishes that fell back to inline dispatch.
    pub const ENQUEUE_FALLBACK: &str = "herald_bus_enqueue_fallback_total";
    /// Individual handler failures (errors and panics).
    pub const HANDLER_FAILURES: &str = "herald_bus_handler_failures_total";
    /// Time spent running all handlers for one event.
    pub const DISPATCH_DURATION: &str = "herald_bus_dispatch_duration_seconds";
    /// Worker tasks whose handlers all succeeded.
    pub const WORKER_PROCESSED: &str = "herald_worker_processed_total";
    /// Worker retries scheduled.
    pub const WORKER_RETRIES_SCHEDULED: &str = "herald_worker_retries_scheduled_total";
    /// Events promoted to the dead-letter queue.
    pub const WORKER_DEAD_LETTERED: &str = "herald_worker_dead_lettered_total";
    /// Worker tasks given up without a terminal status.
    pub const WORKER_ABANDONED: &str = "herald_worker_abandoned_total";
    /// Events republished by replay.
    pub const REPLAY_EVENTS: &str = "herald_replay_events_total";
    /// Dead-lettered events acknowledged by an operator.
    pub const DLQ_ACKNOWLEDGED: &str = "herald_dlq_acknowledged_total";
}

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics recorder handle.
///
/// Installs the global recorder and renders the Prometheus text format for
/// whatever HTTP surface the host application exposes.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the host application serves `/metrics` on, used in logs
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a
    /// warning and returns `Ok` without a render handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics recorder installed - serve at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        names::EVENTS_PUBLISHED,
        "Total number of events handed to publish"
    );
    describe_counter!(
        names::UNRECORDED_DISPATCH,
        "Events dispatched without a durable event log record"
    );
    describe_counter!(
        names::ENQUEUE_FALLBACK,
        "Queued publishes that fell back to inline dispatch"
    );
    describe_counter!(
        names::HANDLER_FAILURES,
        "Individual handler errors and panics"
    );
    describe_histogram!(
        names::DISPATCH_DURATION,
        "Time taken to run every handler for one event"
    );

    describe_counter!(
        names::WORKER_PROCESSED,
        "Dispatch tasks completed successfully"
    );
    describe_counter!(
        names::WORKER_RETRIES_SCHEDULED,
        "Dispatch retries scheduled with backoff"
    );
    describe_counter!(
        names::WORKER_DEAD_LETTERED,
        "Events promoted to the dead-letter queue"
    );
    describe_counter!(
        names::WORKER_ABANDONED,
        "Dispatch tasks abandoned without a terminal status"
    );

    describe_counter!(names::REPLAY_EVENTS, "Events republished by replay");
    describe_counter!(
        names::DLQ_ACKNOWLEDGED,
        "Dead-lettered events acknowledged by an operator"
    );
}

/// Event bus metrics recorder.
pub struct BusMetrics;

impl BusMetrics {
    /// Record a publish call.
    pub fn record_publish() {
        counter!(names::EVENTS_PUBLISHED).increment(1);
    }

    /// Record a dispatch that has no event log record.
    pub fn record_unrecorded_dispatch() {
        counter!(names::UNRECORDED_DISPATCH).increment(1);
    }

    /// Record an inline fallback after an enqueue failure.
    pub fn record_enqueue_fallback() {
        counter!(names::ENQUEUE_FALLBACK).increment(1);
    }

    /// Record a failed handler.
    pub fn record_handler_failure(event_name: &str, handler: &str) {
        counter!(
            names::HANDLER_FAILURES,
            "event_name" => event_name.to_string(),
            "handler" => handler.to_string()
        )
        .increment(1);
    }

    /// Record how long fan-out took.
    pub fn record_dispatch(duration: Duration) {
        histogram!(names::DISPATCH_DURATION).record(duration.as_secs_f64());
    }
}

/// Dispatch worker metrics recorder.
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record a successful task.
    pub fn record_processed() {
        counter!(names::WORKER_PROCESSED).increment(1);
    }

    /// Record a scheduled retry.
    pub fn record_retry_scheduled() {
        counter!(names::WORKER_RETRIES_SCHEDULED).increment(1);
    }

    /// Record a dead-letter promotion.
    pub fn record_dead_lettered(event_name: &str) {
        counter!(names::WORKER_DEAD_LETTERED, "event_name" => event_name.to_string()).increment(1);
    }

    /// Record an abandoned task.
    pub fn record_abandoned() {
        counter!(names::WORKER_ABANDONED).increment(1);
    }
}

/// Operator service metrics recorder.
pub struct OperatorMetrics;

impl OperatorMetrics {
    /// Record a replayed event.
    pub fn record_replay() {
        counter!(names::REPLAY_EVENTS).increment(1);
    }

    /// Record an acknowledgement.
    pub fn record_acknowledged() {
        counter!(names::DLQ_ACKNOWLEDGED).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        BusMetrics::record_publish();
        BusMetrics::record_dispatch(Duration::from_millis(5));
        WorkerMetrics::record_dead_lettered("MatchCompleted");

        // Another test in this binary may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains(names::EVENTS_PUBLISHED));
            assert!(rendered.contains(names::WORKER_DEAD_LETTERED));
        }
    }
}
