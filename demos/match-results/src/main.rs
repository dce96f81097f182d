//! Match Results Demo
//!
//! Publishes tournament results through a queued Herald bus, takes the
//! notification gateway offline so some events exhaust their retries, then
//! inspects the dead-letter queue and replays it once the gateway is back.
//!
//! # Running the Example
//!
//! ```bash
//! RUST_LOG=info,herald_runtime=debug cargo run -p match-results-demo
//! ```
//!
//! Set `DATABASE_URL` to record events in `PostgreSQL` instead of memory. The
//! in-memory fallback comes from the default `memory` feature; without it
//! `DATABASE_URL` is required. Any
//! `HERALD_*` variable is honoured except the retry delays, which the demo
//! shortens so it finishes in seconds.

use herald_core::{EventLog, EventLogFilter, EventStatus};
use herald_postgres::PostgresEventLog;
use herald_runtime::dead_letter::DEFAULT_LIST_LIMIT;
use herald_runtime::metrics::MetricsServer;
use herald_runtime::replay::DEFAULT_REPLAY_LIMIT;
use herald_runtime::{
    BusConfig, DeadLetterService, DispatchMode, DispatchWorker, EventBus, InMemoryLedger,
    InProcessQueue, ReplayOptions, ReplayService, RetryPolicy,
};
use match_results_demo::{MATCH_COMPLETED, Notifier, Standings, match_completed, wire_handlers};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn open_event_log() -> anyhow::Result<Arc<dyn EventLog>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            tracing::info!("Recording events in PostgreSQL");
            let log = PostgresEventLog::connect(&url).await?;
            log.migrate().await?;
            Ok(Arc::new(log))
        }
        Err(_) => memory_event_log(),
    }
}

#[cfg(feature = "memory")]
#[allow(clippy::unnecessary_wraps)] // Same signature as the fallback without the feature
fn memory_event_log() -> anyhow::Result<Arc<dyn EventLog>> {
    tracing::info!("DATABASE_URL not set, recording events in memory");
    Ok(Arc::new(herald_testing::InMemoryEventLog::new()))
}

#[cfg(not(feature = "memory"))]
fn memory_event_log() -> anyhow::Result<Arc<dyn EventLog>> {
    Err(anyhow::anyhow!(
        "DATABASE_URL must be set when the `memory` feature is disabled"
    ))
}

/// Long enough for every retry of one event to run.
fn retry_window(policy: &RetryPolicy) -> Duration {
    (0..policy.max_retries)
        .map(|attempt| policy.delay_for_attempt(attempt))
        .sum::<Duration>()
        + Duration::from_millis(500)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,herald_runtime=info,match_results_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Match Results Demo");

    let mut metrics = MetricsServer::new(([127, 0, 0, 1], 9000).into());
    metrics.start()?;

    let env_config = BusConfig::from_env()?;
    let retry = RetryPolicy::builder()
        .max_retries(env_config.max_retries)
        .initial_delay(Duration::from_millis(200))
        .max_delay(Duration::from_secs(2))
        .build();
    let config = env_config
        .with_dispatch_mode(DispatchMode::Queued)
        .with_retry_policy(retry.clone());

    let log = open_event_log().await?;
    let (queue, receiver) = InProcessQueue::bounded(config.queue_capacity);
    let queue = Arc::new(queue);
    let bus = Arc::new(EventBus::new(Arc::clone(&log), config).with_queue(queue.clone()));

    let standings = Standings::new();
    let notifier = Notifier::new();
    wire_handlers(&bus, &standings, &notifier, Arc::new(InMemoryLedger::new()));
    tracing::info!(handlers = bus.handler_count(MATCH_COMPLETED), "Handlers wired");

    let worker = Arc::new(DispatchWorker::new(Arc::clone(&bus), queue));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(Arc::clone(&worker).run(receiver, shutdown_rx));

    // 1. Healthy path
    bus.publish(match_completed(1, "ana", "bo")).await;

    // 2. Gateway outage: these exhaust their retries
    notifier.set_offline(true);
    bus.publish(match_completed(2, "bo", "cy")).await;
    bus.publish(match_completed(3, "cy", "ana")).await;
    tokio::time::sleep(retry_window(&retry)).await;

    // 3. Operator inspects the dead-letter queue
    let dead_letters = DeadLetterService::new(Arc::clone(&log));
    let listed = dead_letters
        .list(&EventLogFilter::default(), DEFAULT_LIST_LIMIT)
        .await?;
    for record in &listed {
        tracing::warn!(
            event_log_id = %record.id,
            correlation_id = record.correlation_id.as_deref(),
            retry_count = record.retry_count,
            error = record.last_error.as_deref(),
            "Dead-lettered"
        );
    }
    let stats = dead_letters.stats().await?;
    tracing::info!(total = stats.total, by_event_name = ?stats.by_event_name, "Dead-letter stats");

    if let Some(first) = listed.first() {
        dead_letters
            .acknowledge(first.id, Some("notification gateway outage"))
            .await?;
    }

    // 4. Gateway restored: preview, then replay
    notifier.set_offline(false);
    let replay = ReplayService::new(Arc::clone(&bus));
    let filter = EventLogFilter::default()
        .with_status(EventStatus::DeadLetter)
        .with_event_name(MATCH_COMPLETED);
    let preview = replay.dry_run(&filter, DEFAULT_REPLAY_LIMIT).await?;
    tracing::info!(candidates = preview.len(), "Replay preview");

    let summary = replay
        .replay_many(&filter, &ReplayOptions::default(), DEFAULT_REPLAY_LIMIT)
        .await?;
    tracing::info!(
        replayed = summary.replayed,
        failed = summary.failures.len(),
        "Replay finished"
    );
    tokio::time::sleep(Duration::from_millis(500)).await;

    tracing::info!(standings = ?standings.snapshot(), notified = notifier.sent(), "Final standings");

    shutdown.send(true).ok();
    running.await?;

    if let Some(rendered) = metrics.render() {
        println!("{rendered}");
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use match_results_demo::match_completed;

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn memory_fallback_records_events() {
        let log = memory_event_log().unwrap();

        let record = log.append(&match_completed(1, "ana", "bo")).await.unwrap();

        assert_eq!(log.get(record.id).await.unwrap().status, EventStatus::Pending);
    }

    #[test]
    fn retry_window_covers_every_delay() {
        let policy = RetryPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(200))
            .max_delay(Duration::from_secs(2))
            .build();

        assert_eq!(retry_window(&policy), Duration::from_millis(200 + 400 + 500));
    }
}
