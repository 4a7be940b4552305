//! Event store trait: the storage seam for event delivery
//!
//! Backends implement `EventStore` to expose the append-only event
//! log, the durable handle cursors, and new-event notifications. The
//! in-crate `MemoryStore` serves tests and single-process use; durable
//! backends (Postgres, etc.) implement the same trait out of crate.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{Event, Handle};

pub mod memory;

pub use memory::MemoryStore;

/// Stream of events read back from storage, ascending by number
pub type EventStream = BoxStream<'static, Result<Event>>;

/// Scope for a storage read
///
/// Composed by chaining the reducers: start boundary, stream scope,
/// topic scope. Results are always ordered by ascending number; empty
/// scope lists mean "do not restrict".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    /// Only events with `number > from` are read
    #[serde(default)]
    pub from: u64,

    /// Restrict to these stream ids (empty: all streams)
    #[serde(default)]
    pub streams: Vec<String>,

    /// Restrict to these topics (empty: all topics)
    #[serde(default)]
    pub topics: Vec<String>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read strictly after the given event number
    pub fn after(mut self, number: u64) -> Self {
        self.from = number;
        self
    }

    /// Restrict to the given stream ids; an empty list clears the scope
    pub fn in_streams(mut self, streams: Vec<String>) -> Self {
        self.streams = streams;
        self
    }

    /// Restrict to the given topics; an empty list clears the scope
    pub fn in_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    /// Whether an event falls inside this scope
    pub fn matches(&self, event: &Event) -> bool {
        event.number > self.from
            && (self.streams.is_empty() || self.streams.contains(&event.stream_id))
            && (self.topics.is_empty() || self.topics.contains(&event.topic))
    }
}

/// Core trait for event log backends
///
/// Implementations provide the committed log (dense global numbering
/// from 1), durable handle cursors, streaming reads, and a broadcast
/// of newly committed events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Highest committed event number (0 for an empty log)
    async fn index(&self) -> Result<u64>;

    /// Load a handle cursor, if one has been persisted
    async fn get_handle(&self, id: &str) -> Result<Option<Handle>>;

    /// Create or update a handle cursor
    ///
    /// Monotonicity of `position` is the caller's responsibility; the
    /// store writes what it is given.
    async fn upsert_handle(&self, id: &str, position: u64) -> Result<Handle>;

    /// Stream committed events matching the filter, ascending by number
    ///
    /// The read is bounded by the log as of the call (a snapshot):
    /// events committed afterwards are not observed. Backends fetch in
    /// small batches to cap memory on long reads.
    async fn query_events(&self, filter: EventFilter) -> Result<EventStream>;

    /// Register for new-event notifications
    ///
    /// Every event committed after this call is broadcast to the
    /// returned receiver. Receivers that fall behind observe a lag
    /// error and are expected to re-query the log.
    fn notifications(&self) -> broadcast::Receiver<Event>;
}
