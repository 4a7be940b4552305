//! # eventline
//!
//! Ordered, at-least-once event delivery from an append-only event
//! log with durable per-handle cursors.
//!
//! ## Overview
//!
//! `eventline` delivers events from a monotonically numbered log to
//! subscribed consumers. Each handle is served by its own broker: a
//! single-task state machine that merges a historical catch-up read
//! with live new-event notifications, filters per subscriber (stream
//! identity, topic whitelist), and paces delivery with strict
//! one-in-flight acknowledgement. Acks from tracked subscribers
//! advance a durable handle position, so a restart resumes where the
//! group left off instead of replaying the log.
//!
//! ## Quick Start
//!
//! ```rust
//! use eventline::{EventBus, MemoryStore, StartFrom, SubscribeOptions};
//!
//! # async fn example() -> eventline::Result<()> {
//! let store = MemoryStore::new();
//! let bus = EventBus::new(store.clone());
//!
//! store
//!     .append("orders", "order.placed", "order.placed",
//!         serde_json::json!({"total": 42}))
//!     .await;
//!
//! // Attach a consumer that reads the log from the beginning
//! let mut consumer = bus
//!     .attach_as("reporting", "analyst",
//!         SubscribeOptions::starting(StartFrom::Genesis))
//!     .await?;
//!
//! if let Some(event) = consumer.next().await {
//!     println!("got event #{}", event.number);
//!     consumer.ack(event.number).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **EventStore** trait: storage seam for the committed log, the
//!   durable handle cursors, and new-event notifications
//! - **Broker**: per-handle dispatcher running the catch-up worker,
//!   the overflow buffer, live tail, and ack-gated delivery
//! - **EventBus**: lazy per-handle broker registry and consumer API
//! - **MemoryStore**: in-memory backend for tests and
//!   single-process use
//!
//! ## Delivery guarantees
//!
//! Per subscriber, delivered event numbers are strictly increasing
//! and admitted by its filter. Delivery is at-least-once: after a
//! crash, tracked consumers resume from the durable handle position
//! and may see already-processed events again. Exactly-once delivery
//! and cross-handle ordering are out of scope.

pub mod broker;
pub mod bus;
pub mod error;
mod filter;
pub mod store;
mod subscription;
pub mod types;
mod worker;

// Re-export core types
pub use broker::Broker;
pub use bus::{Consumer, EventBus};
pub use error::{EventError, Result};
pub use store::{EventFilter, EventStore, EventStream, MemoryStore};
pub use types::{
    BrokerMode, BrokerStatus, Event, Handle, StartFrom, SubscribeOptions, Subscription,
};
