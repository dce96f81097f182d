//! Tournament results service built on the Herald event bus.
//!
//! A finished match is published as `MatchCompleted`. Two handlers consume it:
//!
//! - `update_standings` adds a win to the league table. It is wrapped in
//!   [`Deduplicated`] because retries and replays redeliver the event.
//! - `notify_players` calls a notification gateway that can go offline.

use anyhow::anyhow;
use herald_core::handler::handler_fn;
use herald_core::{Event, Value, json};
use herald_runtime::{Deduplicated, EventBus, ProcessedLedger};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Event name for a finished match.
pub const MATCH_COMPLETED: &str = "MatchCompleted";

/// Build a `MatchCompleted` event correlated by match.
#[must_use]
pub fn match_completed(match_id: i64, winner: &str, loser: &str) -> Event {
    Event::new(
        MATCH_COMPLETED,
        json!({ "match_id": match_id, "winner": winner, "loser": loser }),
    )
    .with_correlation_id(format!("match-{match_id}"))
}

fn winner(event: &Event) -> anyhow::Result<String> {
    event
        .payload()
        .get("winner")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{} without a winner", event.name()))
}

/// League table: wins per player.
#[derive(Debug, Clone, Default)]
pub struct Standings {
    wins: Arc<Mutex<BTreeMap<String, u32>>>,
}

impl Standings {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record_win(&self, player: &str) {
        *self
            .wins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(player.to_string())
            .or_insert(0) += 1;
    }

    /// Wins recorded for `player`.
    #[must_use]
    pub fn wins(&self, player: &str) -> u32 {
        self.snapshot().get(player).copied().unwrap_or(0)
    }

    /// Copy of the whole table.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, u32> {
        self.wins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Notification gateway that an operator can take offline.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    offline: Arc<AtomicBool>,
    sent: Arc<AtomicUsize>,
}

impl Notifier {
    /// Online gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gateway offline or bring it back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Notifications delivered so far.
    #[must_use]
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    async fn notify(&self, player: &str) -> anyhow::Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("notification gateway unavailable, {player} not notified"));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        tracing::info!(player, "Player notified");
        Ok(())
    }
}

/// Register every handler, in dispatch order. Call once at startup.
pub fn wire_handlers(
    bus: &EventBus,
    standings: &Standings,
    notifier: &Notifier,
    ledger: Arc<dyn ProcessedLedger>,
) {
    let table = standings.clone();
    let update_standings = handler_fn("update_standings", move |event| {
        let result = winner(event).map(|player| table.record_win(&player));
        async move { result }
    });
    bus.subscribe(
        MATCH_COMPLETED,
        Arc::new(Deduplicated::new(update_standings, ledger)),
    );

    let gateway = notifier.clone();
    bus.subscribe_fn(MATCH_COMPLETED, "notify_players", move |event| {
        let gateway = gateway.clone();
        let player = winner(event);
        async move { gateway.notify(&player?).await }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use herald_core::EventLog;
    use herald_runtime::{BusConfig, InMemoryLedger, ReplayOptions, ReplayService};
    use herald_testing::InMemoryEventLog;

    fn setup() -> (Arc<EventBus>, Standings, Notifier) {
        let bus = Arc::new(EventBus::new(
            Arc::new(InMemoryEventLog::new()) as Arc<dyn EventLog>,
            BusConfig::default(),
        ));
        let standings = Standings::new();
        let notifier = Notifier::new();
        wire_handlers(&bus, &standings, &notifier, Arc::new(InMemoryLedger::new()));
        (bus, standings, notifier)
    }

    #[tokio::test]
    async fn win_is_recorded_and_winner_notified() {
        let (bus, standings, notifier) = setup();

        bus.publish(match_completed(1, "ana", "bo")).await;

        assert_eq!(standings.wins("ana"), 1);
        assert_eq!(standings.wins("bo"), 0);
        assert_eq!(notifier.sent(), 1);
    }

    #[tokio::test]
    async fn replay_does_not_double_count() {
        let (bus, standings, notifier) = setup();
        let id = bus
            .publish(match_completed(1, "ana", "bo"))
            .await
            .event_log_id
            .unwrap();

        ReplayService::new(Arc::clone(&bus))
            .replay_one(id, &ReplayOptions::default())
            .await
            .unwrap();

        assert_eq!(standings.wins("ana"), 1);
        assert_eq!(notifier.sent(), 2);
    }

    #[test]
    fn missing_winner_is_an_error() {
        let event = Event::new(MATCH_COMPLETED, json!({ "match_id": 1 }));
        assert!(winner(&event).is_err());
    }
}
