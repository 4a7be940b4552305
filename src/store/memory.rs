//! In-memory event store for testing and single-process use
//!
//! Append-only log behind an async lock. Appends assign the dense
//! global number and the per-stream position; reads page through a
//! snapshot of the log bounded at query time, so a long read never
//! observes events committed after it started.

use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use crate::error::{EventError, Result};
use crate::store::{EventFilter, EventStore, EventStream};
use crate::types::{Event, Handle};

/// Rows fetched per lock acquisition during a streaming read
const READ_PAGE: usize = 10;

/// Buffered new-event notifications per receiver
const NOTIFY_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Log {
    /// Committed events; `events[n - 1]` holds number `n`
    events: Vec<Event>,

    /// Next per-stream position, keyed by stream id
    stream_positions: HashMap<String, u64>,
}

#[derive(Debug)]
struct Inner {
    log: RwLock<Log>,
    handles: RwLock<HashMap<String, Handle>>,
    notify: broadcast::Sender<Event>,
}

/// In-memory `EventStore` backend
///
/// Cheap to clone; all clones share the same log.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                log: RwLock::new(Log::default()),
                handles: RwLock::new(HashMap::new()),
                notify,
            }),
        }
    }

    /// Append an event to the log
    ///
    /// Assigns the next global number and the next position within
    /// `stream_id`, then broadcasts the committed event to
    /// notification receivers.
    pub async fn append(
        &self,
        stream_id: impl Into<String>,
        topic: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Event {
        let stream_id = stream_id.into();

        let event = {
            let mut log = self.inner.log.write().await;
            let number = log.events.len() as u64 + 1;
            let position = log
                .stream_positions
                .entry(stream_id.clone())
                .and_modify(|p| *p += 1)
                .or_insert(1);

            let event = Event {
                number,
                position: *position,
                stream_id,
                topic: topic.into(),
                event_type: event_type.into(),
                payload,
                recorded_at: Utc::now(),
            };
            log.events.push(event.clone());
            event
        };

        tracing::debug!(
            number = event.number,
            stream = %event.stream_id,
            topic = %event.topic,
            "Event appended"
        );

        // No receivers is fine; catch-up reads cover the gap
        let _ = self.inner.notify.send(event.clone());
        event
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryStore {
    async fn index(&self) -> Result<u64> {
        let log = self.inner.log.read().await;
        Ok(log.events.len() as u64)
    }

    async fn get_handle(&self, id: &str) -> Result<Option<Handle>> {
        let handles = self.inner.handles.read().await;
        Ok(handles.get(id).cloned())
    }

    async fn upsert_handle(&self, id: &str, position: u64) -> Result<Handle> {
        let mut handles = self.inner.handles.write().await;
        let now = Utc::now();

        let handle = handles
            .entry(id.to_string())
            .and_modify(|h| {
                h.position = position;
                h.updated_at = now;
            })
            .or_insert_with(|| Handle {
                id: id.to_string(),
                position,
                created_at: now,
                updated_at: now,
            });

        tracing::debug!(handle = %id, position, "Handle upserted");
        Ok(handle.clone())
    }

    async fn query_events(&self, filter: EventFilter) -> Result<EventStream> {
        let inner = self.inner.clone();

        // Snapshot boundary: nothing past this is observed
        let bound = {
            let log = inner.log.read().await;
            log.events.len() as u64
        };

        let stream = stream! {
            let mut next = filter.from.min(bound);
            while next < bound {
                let page: Vec<Event> = {
                    let log = inner.log.read().await;
                    let hi = (next + READ_PAGE as u64).min(bound);
                    let slice = &log.events[next as usize..hi as usize];
                    next = hi;
                    slice
                        .iter()
                        .filter(|e| filter.matches(e))
                        .cloned()
                        .collect()
                };
                for event in page {
                    yield Ok::<Event, EventError>(event);
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn notifications(&self) -> broadcast::Receiver<Event> {
        self.inner.notify.subscribe()
    }
}
