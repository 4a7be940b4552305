//! Per-subscription event admission
//!
//! A subscriber may receive an event only when nothing is in flight
//! to it, the event lies past its acknowledged position, and the
//! event matches its stream/topic scope. The broker-level stream and
//! topic unions over-approximate; this predicate is the authority.

use crate::subscription::Record;
use crate::types::Event;

/// Decide whether `event` may be delivered to `record` right now
pub(crate) fn admits(record: &Record, event: &Event) -> bool {
    // Flow control: one outstanding delivery per subscriber
    if record.in_flight() {
        return false;
    }

    // Position gate: never re-deliver at or below the acked number
    if event.number <= record.ack {
        return false;
    }

    if let Some(stream) = &record.stream {
        if *stream != event.stream_id {
            return false;
        }
    }

    if !record.topics.is_empty() && !record.topics.contains(&event.topic) {
        return false;
    }

    true
}
