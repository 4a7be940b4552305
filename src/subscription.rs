//! In-memory subscriber table owned by a broker
//!
//! Holds one record per consumer in insertion order and answers the
//! aggregate questions the dispatcher needs: scope unions, the lowest
//! `syn` (worker restart point), the highest ack (buffer pruning and
//! durability), and whether any delivery is outstanding.

use tokio::sync::mpsc;

use crate::types::{Event, Subscription};

/// A live subscription record
///
/// `sink` is the consumer's delivery channel; a failed send marks the
/// consumer as gone.
#[derive(Debug)]
pub(crate) struct Record {
    pub id: String,
    pub handle: String,
    pub ack: u64,
    pub syn: u64,
    pub track: bool,
    pub stream: Option<String>,
    pub topics: Vec<String>,
    pub sink: mpsc::Sender<Event>,
}

impl Record {
    pub fn snapshot(&self) -> Subscription {
        Subscription {
            id: self.id.clone(),
            handle: self.handle.clone(),
            ack: self.ack,
            syn: self.syn,
            track: self.track,
            stream: self.stream.clone(),
            topics: self.topics.clone(),
        }
    }

    /// True while a delivery to this consumer awaits acknowledgement
    pub fn in_flight(&self) -> bool {
        self.syn > self.ack
    }
}

/// Insertion-ordered set of subscription records, keyed by consumer id
#[derive(Debug, Default)]
pub(crate) struct SubscriptionSet {
    records: Vec<Record>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Record> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    /// Insert a record unless the consumer id is already present
    ///
    /// Returns false (leaving the existing record untouched) on a
    /// duplicate id (subscribe is idempotent per consumer).
    pub fn insert(&mut self, record: Record) -> bool {
        if self.get(&record.id).is_some() {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<Record> {
        let idx = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(idx))
    }

    /// Deduplicated union of the stream restrictions across records
    ///
    /// Records without a stream restriction contribute nothing; an
    /// empty union means the worker query must not scope by stream.
    pub fn stream_union(&self) -> Vec<String> {
        let mut streams: Vec<String> = Vec::new();
        for record in &self.records {
            if let Some(stream) = &record.stream {
                if !streams.contains(stream) {
                    streams.push(stream.clone());
                }
            }
        }
        streams
    }

    /// Deduplicated union of the topic whitelists across records
    ///
    /// A record with an empty whitelist sees all topics, so the union
    /// collapses to "all" (empty) as soon as one such record exists.
    pub fn topic_union(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for record in &self.records {
            if record.topics.is_empty() {
                return Vec::new();
            }
            for topic in &record.topics {
                if !topics.contains(topic) {
                    topics.push(topic.clone());
                }
            }
        }
        topics
    }

    /// Lowest `syn` across records, where a fresh worker starts
    pub fn min_syn(&self) -> Option<u64> {
        self.records.iter().map(|r| r.syn).min()
    }

    /// Highest `syn` across records
    pub fn max_syn(&self) -> Option<u64> {
        self.records.iter().map(|r| r.syn).max()
    }

    /// Highest acknowledged number across records
    pub fn max_ack(&self) -> Option<u64> {
        self.records.iter().map(|r| r.ack).max()
    }

    /// The record with the highest ack (ties resolved by insertion order)
    pub fn max_ack_record(&self) -> Option<&Record> {
        self.records.iter().max_by_key(|r| r.ack)
    }

    /// True when no delivery is outstanding anywhere in the set
    ///
    /// Checked via the record with the maximum `syn`: under the
    /// single-in-flight invariant it is the only candidate.
    pub fn quiescent(&self) -> bool {
        match self.records.iter().max_by_key(|r| r.syn) {
            Some(record) => !record.in_flight(),
            None => true,
        }
    }

    /// Index of the first record whose filter admits the event
    pub fn position_admitting(&self, event: &Event) -> Option<usize> {
        self.records
            .iter()
            .position(|r| crate::filter::admits(r, event))
    }

    pub fn get_index_mut(&mut self, idx: usize) -> Option<&mut Record> {
        self.records.get_mut(idx)
    }
}
