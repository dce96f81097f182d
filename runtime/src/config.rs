//! Bus configuration.
//!
//! [`BusConfig`] is built in code with `with_*` methods, or read from the
//! environment with [`BusConfig::from_env`]:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `HERALD_DISPATCH_MODE` | `inline`/`sync` or `queued`/`async` | `inline` |
//! | `HERALD_MAX_RETRIES` | failed attempts before dead-lettering | `3` |
//! | `HERALD_RETRY_BASE_DELAY_SECS` | delay before the first retry | `30` |
//! | `HERALD_RETRY_MAX_DELAY_SECS` | cap on the backoff delay | `3600` |
//! | `HERALD_WORKER_CONCURRENCY` | tasks a worker runs at once | `8` |
//! | `HERALD_QUEUE_CAPACITY` | in-process queue bound | `1024` |

use herald_core::event_log::MAX_ERROR_LENGTH;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

const DISPATCH_MODE: &str = "HERALD_DISPATCH_MODE";
const MAX_RETRIES: &str = "HERALD_MAX_RETRIES";
const RETRY_BASE_DELAY_SECS: &str = "HERALD_RETRY_BASE_DELAY_SECS";
const RETRY_MAX_DELAY_SECS: &str = "HERALD_RETRY_MAX_DELAY_SECS";
const WORKER_CONCURRENCY: &str = "HERALD_WORKER_CONCURRENCY";
const QUEUE_CAPACITY: &str = "HERALD_QUEUE_CAPACITY";

/// Errors raised while reading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set to something that could not be parsed.
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Where `publish` runs handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// In the publisher's task, before `publish` returns.
    #[default]
    Inline,
    /// On a dispatch worker, via the configured queue.
    Queued,
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" | "sync" => Ok(Self::Inline),
            "queued" | "async" => Ok(Self::Queued),
            other => Err(format!("expected inline, sync, queued or async, got '{other}'")),
        }
    }
}

/// Configuration shared by the bus and its dispatch workers.
///
/// `max_retries` and `retry.max_retries` are kept equal by the builder methods;
/// the worker reads `max_retries`.
///
/// # Example
///
/// ```
/// use herald_runtime::config::{BusConfig, DispatchMode};
///
/// let config = BusConfig::default()
///     .with_dispatch_mode(DispatchMode::Queued)
///     .with_max_retries(5);
///
/// assert_eq!(config.max_retries, 5);
/// assert_eq!(config.retry.max_retries, 5);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    /// Inline or queued dispatch.
    pub dispatch_mode: DispatchMode,
    /// Failed attempts before an event is dead-lettered.
    pub max_retries: u32,
    /// Backoff between attempts.
    pub retry: RetryPolicy,
    /// Bound on stored error text, in characters.
    pub max_error_length: usize,
    /// Tasks a worker processes concurrently.
    pub worker_concurrency: usize,
    /// Capacity of the in-process dispatch queue.
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            dispatch_mode: DispatchMode::Inline,
            max_retries: retry.max_retries,
            retry,
            max_error_length: MAX_ERROR_LENGTH,
            worker_concurrency: 8,
            queue_capacity: 1024,
        }
    }
}

impl BusConfig {
    /// Set the dispatch mode.
    #[must_use]
    pub const fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Set the dead-letter threshold.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self.retry.max_retries = max_retries;
        self
    }

    /// Set the retry policy. Its `max_retries` becomes the dead-letter threshold.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.max_retries = policy.max_retries;
        self.retry = policy;
        self
    }

    /// Set the bound on stored error text.
    #[must_use]
    pub const fn with_max_error_length(mut self, max: usize) -> Self {
        self.max_error_length = max;
        self
    }

    /// Set worker concurrency (at least 1 is used).
    #[must_use]
    pub const fn with_worker_concurrency(mut self, concurrency: usize) -> Self {
        self.worker_concurrency = concurrency;
        self
    }

    /// Set the in-process queue capacity (at least 1 is used).
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Read configuration from `HERALD_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a set variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a present value cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let dispatch_mode = parse(&lookup, DISPATCH_MODE)?.unwrap_or(defaults.dispatch_mode);
        let max_retries = parse(&lookup, MAX_RETRIES)?.unwrap_or(defaults.max_retries);
        let initial_delay = parse::<u64, _>(&lookup, RETRY_BASE_DELAY_SECS)?
            .map_or(defaults.retry.initial_delay, Duration::from_secs);
        let max_delay = parse::<u64, _>(&lookup, RETRY_MAX_DELAY_SECS)?
            .map_or(defaults.retry.max_delay, Duration::from_secs);
        let worker_concurrency =
            parse(&lookup, WORKER_CONCURRENCY)?.unwrap_or(defaults.worker_concurrency);
        let queue_capacity = parse(&lookup, QUEUE_CAPACITY)?.unwrap_or(defaults.queue_capacity);

        let retry = RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_delay(initial_delay)
            .max_delay(max_delay)
            .multiplier(defaults.retry.multiplier)
            .build();

        Ok(defaults
            .with_dispatch_mode(dispatch_mode)
            .with_retry_policy(retry)
            .with_worker_concurrency(worker_concurrency)
            .with_queue_capacity(queue_capacity))
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidValue {
                    key,
                    reason: e.to_string(),
                    value,
                })
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = BusConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, BusConfig::default());
        assert_eq!(config.dispatch_mode, DispatchMode::Inline);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_error_length, 5000);
    }

    #[test]
    fn reads_every_variable() {
        let config = BusConfig::from_lookup(lookup(&[
            ("HERALD_DISPATCH_MODE", "async"),
            ("HERALD_MAX_RETRIES", "5"),
            ("HERALD_RETRY_BASE_DELAY_SECS", "2"),
            ("HERALD_RETRY_MAX_DELAY_SECS", "60"),
            ("HERALD_WORKER_CONCURRENCY", "4"),
            ("HERALD_QUEUE_CAPACITY", " 16 "),
        ]))
        .unwrap();

        assert_eq!(config.dispatch_mode, DispatchMode::Queued);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_delay, Duration::from_secs(2));
        assert_eq!(config.retry.max_delay, Duration::from_secs(60));
        assert_eq!(config.worker_concurrency, 4);
        assert_eq!(config.queue_capacity, 16);
    }

    #[test]
    fn dispatch_mode_aliases() {
        assert_eq!("SYNC".parse::<DispatchMode>().unwrap(), DispatchMode::Inline);
        assert_eq!("queued".parse::<DispatchMode>().unwrap(), DispatchMode::Queued);
        assert!("celery".parse::<DispatchMode>().is_err());
    }

    #[test]
    fn unparseable_value_names_the_variable() {
        let err = BusConfig::from_lookup(lookup(&[("HERALD_MAX_RETRIES", "three")])).unwrap_err();
        let ConfigError::InvalidValue { key, value, .. } = err;
        assert_eq!(key, "HERALD_MAX_RETRIES");
        assert_eq!(value, "three");
    }
}
