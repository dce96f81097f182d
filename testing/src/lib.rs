//! # Herald Testing
//!
//! Testing utilities and in-memory doubles for the Herald event bus.
//!
//! This crate provides:
//! - [`InMemoryEventLog`]: `BTreeMap`-backed event log with transition history
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - Handler doubles that record calls or fail on demand
//! - Queue doubles that capture tasks or refuse them
//!
//! ## Example
//!
//! ```
//! use herald_testing::{InMemoryEventLog, RecordingHandler, test_clock};
//! use std::sync::Arc;
//!
//! let log = InMemoryEventLog::with_clock(Arc::new(test_clock()));
//! let handler = RecordingHandler::new("projection");
//! assert!(log.is_empty());
//! assert!(handler.events().is_empty());
//! ```

pub mod event_log;
pub mod handlers;
pub mod queues;

use chrono::{DateTime, Utc};
use herald_core::environment::Clock;

/// Deterministic clocks.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use herald_testing::mocks::FixedClock;
    /// use herald_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and pass
    /// another into the code under test.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at the given time.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a `tracing` subscriber that writes to the test output.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use event_log::InMemoryEventLog;
pub use handlers::{CallLog, FailingHandler, RecordingHandler};
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use queues::{FailingQueue, RecordingQueue};
