//! Event value type and its wire representation.
//!
//! An [`Event`] is an immutable business fact: a name used as the routing key,
//! a JSON payload, the time the fact occurred, and audit/correlation metadata.
//! Events are never persisted directly; the event log copies their fields into
//! an [`EventLogRecord`](crate::event_log::EventLogRecord).
//!
//! # Wire Format
//!
//! When an event crosses a process boundary (bus → dispatch worker) it travels as
//! a [`SerializedEvent`]:
//!
//! ```json
//! {
//!   "name": "MatchCompleted",
//!   "payload": { "match_id": 42 },
//!   "occurred_at": "2025-01-01T00:00:00Z",
//!   "user_id": 7,
//!   "correlation_id": "tournament-9",
//!   "metadata": { "event_log_id": 1 }
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use herald_core::event::Event;
//! use serde_json::json;
//!
//! let event = Event::new("MatchCompleted", json!({ "match_id": 42 }))
//!     .with_user_id(7)
//!     .with_correlation_id("tournament-9");
//!
//! assert_eq!(event.name(), "MatchCompleted");
//! assert_eq!(event.correlation_id(), Some("tournament-9"));
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::event_log::EventLogId;

/// Reserved metadata keys written by the bus and the operator services.
pub mod metadata_keys {
    /// ID of the event log row this event was persisted as.
    pub const EVENT_LOG_ID: &str = "event_log_id";
    /// Set to `true` on events produced by replay.
    pub const IS_REPLAY: &str = "is_replay";
    /// RFC 3339 time the replay was issued.
    pub const REPLAYED_AT: &str = "replayed_at";
    /// ID of the source row a replayed event was rebuilt from.
    pub const REPLAYED_FROM_EVENT_LOG_ID: &str = "replayed_from_event_log_id";
    /// Operator that issued the replay.
    pub const REPLAYED_BY_USER_ID: &str = "replayed_by_user_id";
    /// Set to `true` once an operator acknowledged a dead-lettered row.
    pub const ACKNOWLEDGED: &str = "acknowledged";
    /// RFC 3339 time of the acknowledgement.
    pub const ACKNOWLEDGED_AT: &str = "acknowledged_at";
    /// Free-form operator notes attached on acknowledgement.
    pub const ACKNOWLEDGEMENT_NOTES: &str = "acknowledgement_notes";
    /// RFC 3339 time a dead-lettered row was reset for replay.
    pub const SCHEDULED_FOR_REPLAY_AT: &str = "scheduled_for_replay_at";
}

/// Errors raised while converting events to and from the wire format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// `occurred_at` was not a valid RFC 3339 timestamp.
    #[error("Invalid occurred_at timestamp '{value}': {reason}")]
    InvalidTimestamp {
        /// The offending value.
        value: String,
        /// Parser error.
        reason: String,
    },

    /// The payload or metadata was not a JSON object.
    #[error("Expected a JSON object for {field}")]
    NotAnObject {
        /// Which field was malformed.
        field: &'static str,
    },

    /// The JSON document itself could not be encoded or decoded.
    #[error("Event serialization failed: {0}")]
    Serialization(String),
}

/// An immutable business fact published through the bus.
///
/// `name`, `payload` and `occurred_at` are fixed once the event is built. The
/// `with_*` methods consume the event, so they can only be chained while it is
/// being constructed. Metadata may be extended on a *copy* via
/// [`Event::with_metadata_entry`], which is how replay and the bus annotate
/// events without touching the original.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    name: String,
    payload: Map<String, Value>,
    occurred_at: DateTime<Utc>,
    user_id: Option<i64>,
    correlation_id: Option<String>,
    metadata: Map<String, Value>,
}

impl Event {
    /// Create an event that occurred now.
    ///
    /// A payload that is not a JSON object is stored under a `"value"` key so
    /// the payload is always a mapping.
    #[must_use]
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload: into_object(payload),
            occurred_at: Utc::now(),
            user_id: None,
            correlation_id: None,
            metadata: Map::new(),
        }
    }

    /// Set when the underlying fact happened.
    #[must_use]
    pub const fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Set the acting user.
    #[must_use]
    pub const fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Set an optional acting user.
    #[must_use]
    pub const fn with_maybe_user_id(mut self, user_id: Option<i64>) -> Self {
        self.user_id = user_id;
        self
    }

    /// Set the correlation ID.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set an optional correlation ID.
    #[must_use]
    pub fn with_maybe_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Replace the metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Return a copy with one extra metadata entry.
    #[must_use]
    pub fn with_metadata_entry(&self, key: &str, value: Value) -> Self {
        let mut copy = self.clone();
        copy.metadata.insert(key.to_string(), value);
        copy
    }

    /// Event type name, used as the handler registry key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Business payload.
    #[must_use]
    pub const fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// When the business fact happened (not when it was logged).
    #[must_use]
    pub const fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Acting user, if any.
    #[must_use]
    pub const fn user_id(&self) -> Option<i64> {
        self.user_id
    }

    /// Correlation ID, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Contextual metadata.
    #[must_use]
    pub const fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// The event log row this event was persisted as, if the bus recorded it.
    #[must_use]
    pub fn event_log_id(&self) -> Option<EventLogId> {
        self.metadata
            .get(metadata_keys::EVENT_LOG_ID)
            .and_then(Value::as_i64)
            .map(EventLogId::new)
    }

    /// Whether this event was produced by a replay.
    #[must_use]
    pub fn is_replay(&self) -> bool {
        self.metadata
            .get(metadata_keys::IS_REPLAY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Convert to the wire format handed to dispatch workers.
    #[must_use]
    pub fn to_serialized(&self) -> SerializedEvent {
        SerializedEvent {
            name: self.name.clone(),
            payload: Value::Object(self.payload.clone()),
            occurred_at: self.occurred_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            user_id: self.user_id,
            correlation_id: self.correlation_id.clone(),
            metadata: Value::Object(self.metadata.clone()),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event {{ name: {}, occurred_at: {}, correlation_id: {} }}",
            self.name,
            self.occurred_at,
            self.correlation_id.as_deref().unwrap_or("-")
        )
    }
}

/// Wire representation of an [`Event`] for the asynchronous worker boundary.
///
/// Producer and worker may be different processes, so this is the one place
/// the schema is fixed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// Event type name.
    pub name: String,

    /// Arbitrary JSON payload (always an object when produced by [`Event`]).
    pub payload: Value,

    /// RFC 3339 / ISO-8601 timestamp.
    pub occurred_at: String,

    /// Acting user, if any.
    #[serde(default)]
    pub user_id: Option<i64>,

    /// Correlation ID, if any.
    #[serde(default)]
    pub correlation_id: Option<String>,

    /// Metadata, carrying `event_log_id` when the event was recorded.
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

impl SerializedEvent {
    /// The event log row referenced by this payload, if any.
    #[must_use]
    pub fn event_log_id(&self) -> Option<EventLogId> {
        self.metadata
            .get(metadata_keys::EVENT_LOG_ID)
            .and_then(Value::as_i64)
            .map(EventLogId::new)
    }

    /// Encode as a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<String, EventError> {
        serde_json::to_string(self).map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// Decode from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the document does not match the
    /// wire schema.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        serde_json::from_str(json).map_err(|e| EventError::Serialization(e.to_string()))
    }
}

impl TryFrom<SerializedEvent> for Event {
    type Error = EventError;

    fn try_from(wire: SerializedEvent) -> Result<Self, Self::Error> {
        let occurred_at = DateTime::parse_from_rfc3339(&wire.occurred_at)
            .map_err(|e| EventError::InvalidTimestamp {
                value: wire.occurred_at.clone(),
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);

        let payload = match wire.payload {
            Value::Object(map) => map,
            _ => return Err(EventError::NotAnObject { field: "payload" }),
        };

        let metadata = match wire.metadata {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(EventError::NotAnObject { field: "metadata" }),
        };

        Ok(Self {
            name: wire.name,
            payload,
            occurred_at,
            user_id: wire.user_id,
            correlation_id: wire.correlation_id,
            metadata,
        })
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builder_sets_optional_fields() {
        let event = Event::new("OrderPlaced", json!({ "order_id": 1 }))
            .with_user_id(9)
            .with_correlation_id("corr-1");

        assert_eq!(event.name(), "OrderPlaced");
        assert_eq!(event.payload().get("order_id"), Some(&json!(1)));
        assert_eq!(event.user_id(), Some(9));
        assert_eq!(event.correlation_id(), Some("corr-1"));
        assert!(event.metadata().is_empty());
    }

    #[test]
    fn non_object_payload_is_wrapped() {
        let event = Event::new("Ping", json!(5));
        assert_eq!(event.payload().get("value"), Some(&json!(5)));
    }

    #[test]
    fn metadata_entry_returns_copy_and_leaves_original() {
        let original = Event::new("OrderPlaced", json!({}));
        let annotated = original.with_metadata_entry(metadata_keys::IS_REPLAY, json!(true));

        assert!(!original.is_replay());
        assert!(annotated.is_replay());
        assert_eq!(original.name(), annotated.name());
        assert_eq!(original.occurred_at(), annotated.occurred_at());
    }

    #[test]
    fn wire_conversion_preserves_fields() {
        let occurred_at = DateTime::parse_from_rfc3339("2025-01-01T12:30:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = Event::new("MatchCompleted", json!({ "match_id": 42 }))
            .with_occurred_at(occurred_at)
            .with_user_id(3)
            .with_correlation_id("t-1")
            .with_metadata_entry(metadata_keys::EVENT_LOG_ID, json!(17));

        let wire = event.to_serialized();
        assert_eq!(wire.event_log_id(), Some(EventLogId::new(17)));

        let json = wire.to_json().unwrap();
        let decoded = Event::try_from(SerializedEvent::from_json(&json).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn wire_keeps_nanosecond_timestamps() {
        let occurred_at = DateTime::parse_from_rfc3339("2025-01-01T12:30:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = Event::new("X", json!({})).with_occurred_at(occurred_at);

        let decoded = Event::try_from(event.to_serialized()).unwrap();

        assert_eq!(decoded.occurred_at(), occurred_at);
    }

    #[test]
    fn wire_accepts_missing_optional_fields() {
        let wire = SerializedEvent::from_json(
            r#"{"name":"X","payload":{},"occurred_at":"2025-01-01T00:00:00+02:00"}"#,
        )
        .unwrap();
        let event = Event::try_from(wire).unwrap();

        assert_eq!(event.user_id(), None);
        assert_eq!(event.event_log_id(), None);
        assert_eq!(event.occurred_at().to_rfc3339(), "2024-12-31T22:00:00+00:00");
    }

    #[test]
    fn invalid_timestamp_is_rejected() {
        let wire = SerializedEvent {
            name: "X".to_string(),
            payload: json!({}),
            occurred_at: "yesterday".to_string(),
            user_id: None,
            correlation_id: None,
            metadata: json!({}),
        };

        let err = Event::try_from(wire).unwrap_err();
        assert!(matches!(err, EventError::InvalidTimestamp { .. }));
    }

    #[test]
    fn non_object_payload_on_wire_is_rejected() {
        let wire = SerializedEvent {
            name: "X".to_string(),
            payload: json!([1, 2]),
            occurred_at: "2025-01-01T00:00:00Z".to_string(),
            user_id: None,
            correlation_id: None,
            metadata: json!({}),
        };

        assert_eq!(
            Event::try_from(wire).unwrap_err(),
            EventError::NotAnObject { field: "payload" }
        );
    }
}
