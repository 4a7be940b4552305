//! Core types for the eventline delivery system
//!
//! All persisted types use camelCase JSON serialization for wire
//! compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single record from the event log
///
/// Events are immutable once observed. `number` is the dense global
/// ordinal assigned by the store (starting at 1); `position` is the
/// ordinal within the event's own stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Dense, monotonically increasing global ordinal
    pub number: u64,

    /// Ordinal within the event's stream
    pub position: u64,

    /// Identity of the stream this event belongs to
    pub stream_id: String,

    /// Topic used for subscriber whitelisting
    pub topic: String,

    /// Event type identifier (e.g., "order.placed")
    ///
    /// Defaults to empty string for untyped events.
    #[serde(default)]
    pub event_type: String,

    /// Event payload: arbitrary JSON data, opaque at this layer
    pub payload: serde_json::Value,

    /// When the store committed this event
    pub recorded_at: DateTime<Utc>,
}

/// Durable cursor for a subscription group
///
/// `position` is the highest event number collectively acknowledged
/// by the handle's tracked subscribers. It only ever moves forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handle {
    /// Handle identity (unique per store)
    pub id: String,

    /// Highest durably acknowledged event number
    pub position: u64,

    /// When the handle row was first written
    pub created_at: DateTime<Utc>,

    /// When the position last advanced
    pub updated_at: DateTime<Utc>,
}

/// Where a new subscription starts reading from
///
/// Only consulted while the handle has no durable position yet; once
/// the handle has advanced, the persisted position wins and the
/// requested start is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum StartFrom {
    /// Start at the highest committed event number (new events only)
    Current,
    /// Start at the beginning of the log
    #[default]
    Genesis,
    /// Start strictly after a specific event number
    At { number: u64 },
}

/// Options for creating a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOptions {
    /// Where to start reading when the handle has no position yet
    #[serde(default)]
    pub start: StartFrom,

    /// Topic whitelist; empty means all topics are visible
    #[serde(default)]
    pub topics: Vec<String>,

    /// Restrict visibility to a single stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,

    /// Whether this subscriber's acks advance the durable handle position
    #[serde(default = "default_track")]
    pub track: bool,
}

fn default_track() -> bool {
    true
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            start: StartFrom::default(),
            topics: Vec::new(),
            stream: None,
            track: true,
        }
    }
}

impl SubscribeOptions {
    /// Options with a specific start position
    pub fn starting(start: StartFrom) -> Self {
        Self {
            start,
            ..Default::default()
        }
    }

    /// Add a topic to the whitelist
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Restrict to a single stream
    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream = Some(stream_id.into());
        self
    }

    /// Exclude this subscriber's acks from durable position tracking
    pub fn untracked(mut self) -> Self {
        self.track = false;
        self
    }
}

/// Read-only snapshot of a broker-owned subscription record
///
/// `ack` is the highest event number the consumer has acknowledged;
/// `syn` the highest sent. `syn > ack` means a delivery is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Consumer identity (unique per broker)
    pub id: String,

    /// Owning handle id
    pub handle: String,

    /// Highest acknowledged event number
    pub ack: u64,

    /// Highest sent event number
    pub syn: u64,

    /// Whether acks advance the durable handle position
    pub track: bool,

    /// Stream restriction, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,

    /// Topic whitelist; empty means all
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Which part of the event flow a broker is currently serving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BrokerMode {
    /// A worker is draining historical events from storage
    CatchUp,
    /// No worker; buffered events are being dispatched
    Draining,
    /// No worker, empty buffer; listening for new-event notifications
    LiveTail,
}

/// Broker introspection snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    /// Handle this broker serves
    pub handle: String,

    /// Working durable position
    pub position: u64,

    /// Number of registered subscriptions
    pub subscribers: usize,

    /// Stream scope union across subscriptions (empty means unscoped)
    #[serde(default)]
    pub streams: Vec<String>,

    /// Topic scope union across subscriptions (empty means unscoped)
    #[serde(default)]
    pub topics: Vec<String>,

    /// Events currently held in the overflow buffer
    pub buffered: usize,

    /// Current dispatch mode
    pub mode: BrokerMode,

    /// False while a delivery awaits acknowledgement
    pub ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            number: 7,
            position: 3,
            stream_id: "orders".to_string(),
            topic: "order.placed".to_string(),
            event_type: "order.placed".to_string(),
            payload: serde_json::json!({"total": 42}),
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_event_serialization_roundtrip() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"number\":7"));
        assert!(json.contains("\"streamId\":\"orders\""));
        assert!(json.contains("\"eventType\":\"order.placed\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_event_type_defaults_empty() {
        let json = r#"{
            "number": 1,
            "position": 1,
            "streamId": "s",
            "topic": "t",
            "payload": {},
            "recordedAt": "2026-01-01T00:00:00Z"
        }"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.event_type, "");
    }

    #[test]
    fn test_subscribe_options_defaults() {
        let opts = SubscribeOptions::default();
        assert_eq!(opts.start, StartFrom::Genesis);
        assert!(opts.topics.is_empty());
        assert!(opts.stream.is_none());
        assert!(opts.track);
    }

    #[test]
    fn test_subscribe_options_builders() {
        let opts = SubscribeOptions::starting(StartFrom::Current)
            .with_topic("order.placed")
            .with_topic("order.shipped")
            .with_stream("orders")
            .untracked();

        assert_eq!(opts.start, StartFrom::Current);
        assert_eq!(opts.topics, vec!["order.placed", "order.shipped"]);
        assert_eq!(opts.stream.as_deref(), Some("orders"));
        assert!(!opts.track);
    }

    #[test]
    fn test_subscribe_options_track_default_on_deserialize() {
        // Wire payloads that omit "track" must default to tracked
        let opts: SubscribeOptions =
            serde_json::from_str(r#"{"topics": ["a"]}"#).unwrap();
        assert!(opts.track);
        assert_eq!(opts.start, StartFrom::Genesis);
    }

    #[test]
    fn test_start_from_variants_roundtrip() {
        for start in [
            StartFrom::Current,
            StartFrom::Genesis,
            StartFrom::At { number: 42 },
        ] {
            let json = serde_json::to_string(&start).unwrap();
            let parsed: StartFrom = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, start);
        }
    }

    #[test]
    fn test_start_from_at_serialization() {
        let json = serde_json::to_string(&StartFrom::At { number: 100 }).unwrap();
        assert!(json.contains("\"number\":100"));
        assert!(json.contains("\"type\":\"at\""));
    }

    #[test]
    fn test_subscription_snapshot_serialization() {
        let sub = Subscription {
            id: "analyst".to_string(),
            handle: "reports".to_string(),
            ack: 5,
            syn: 6,
            track: true,
            stream: None,
            topics: vec!["order.placed".to_string()],
        };

        let json = serde_json::to_string(&sub).unwrap();
        assert!(json.contains("\"ack\":5"));
        assert!(json.contains("\"syn\":6"));
        assert!(!json.contains("stream\":null"));

        let parsed: Subscription = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, sub);
    }

    #[test]
    fn test_broker_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&BrokerMode::CatchUp).unwrap(),
            "\"catchUp\""
        );
        assert_eq!(
            serde_json::to_string(&BrokerMode::LiveTail).unwrap(),
            "\"liveTail\""
        );
    }
}
