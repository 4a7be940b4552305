//! End-to-end delivery scenarios on the in-memory store
//!
//! Exercises the full subscribe → catch-up → live-tail lifecycle:
//! ack-gated ordering, topic and stream filtering, multi-subscriber
//! interleaving, durable handle resume, and the catch-up/live seam.

use std::time::Duration;

use eventline::{
    BrokerMode, Consumer, EventBus, EventError, EventStore, MemoryStore, StartFrom,
    SubscribeOptions,
};
use tokio::time::timeout;

fn test_bus() -> (MemoryStore, EventBus) {
    let store = MemoryStore::new();
    (store.clone(), EventBus::new(store))
}

/// Append one event per topic, all on the same stream
async fn seed_topics(store: &MemoryStore, topics: &[&str]) {
    for topic in topics {
        store
            .append("stream-1", *topic, "", serde_json::json!({}))
            .await;
    }
}

async fn recv(consumer: &mut Consumer) -> eventline::Event {
    timeout(Duration::from_secs(2), consumer.next())
        .await
        .expect("delivery timed out")
        .expect("delivery channel closed")
}

/// Receive and ack `count` events, returning their numbers
async fn drain(consumer: &mut Consumer, count: usize) -> Vec<u64> {
    let mut numbers = Vec::new();
    for _ in 0..count {
        let event = recv(consumer).await;
        consumer.ack(event.number).await.unwrap();
        numbers.push(event.number);
    }
    numbers
}

/// Poll until the durable handle position reaches `expected`
async fn wait_for_position(store: &MemoryStore, handle: &str, expected: u64) {
    for _ in 0..100 {
        if let Some(h) = store.get_handle(handle).await.unwrap() {
            if h.position == expected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("handle '{}' never reached position {}", handle, expected);
}

// ─── Catch-up ────────────────────────────────────────────────────

#[tokio::test]
async fn test_genesis_catch_up_delivers_in_order() {
    let (store, bus) = test_bus();
    seed_topics(&store, &["A", "A", "A", "A", "A"]).await;

    let mut consumer = bus
        .attach_as(
            "reports",
            "c1",
            SubscribeOptions::starting(StartFrom::Genesis).with_topic("A"),
        )
        .await
        .unwrap();

    assert_eq!(drain(&mut consumer, 5).await, vec![1, 2, 3, 4, 5]);
    wait_for_position(&store, "reports", 5).await;
}

#[tokio::test]
async fn test_topic_filter_skips_other_topics() {
    let (store, bus) = test_bus();
    seed_topics(&store, &["A", "B", "A", "C", "A"]).await;

    let mut consumer = bus
        .attach_as(
            "reports",
            "c1",
            SubscribeOptions::starting(StartFrom::Genesis).with_topic("A"),
        )
        .await
        .unwrap();

    assert_eq!(drain(&mut consumer, 3).await, vec![1, 3, 5]);
    wait_for_position(&store, "reports", 5).await;
}

#[tokio::test]
async fn test_stream_scope_skips_other_streams() {
    let (store, bus) = test_bus();
    store.append("x", "A", "", serde_json::json!({})).await;
    store.append("y", "A", "", serde_json::json!({})).await;
    store.append("x", "A", "", serde_json::json!({})).await;

    let mut consumer = bus
        .attach_as(
            "reports",
            "c1",
            SubscribeOptions::starting(StartFrom::Genesis).with_stream("x"),
        )
        .await
        .unwrap();

    assert_eq!(drain(&mut consumer, 2).await, vec![1, 3]);
}

#[tokio::test]
async fn test_start_at_number_resumes_after_it() {
    let (store, bus) = test_bus();
    seed_topics(&store, &["A", "A", "A", "A", "A"]).await;

    let mut consumer = bus
        .attach_as(
            "reports",
            "c1",
            SubscribeOptions::starting(StartFrom::At { number: 3 }),
        )
        .await
        .unwrap();

    assert_eq!(drain(&mut consumer, 2).await, vec![4, 5]);
}

// ─── Multiple subscribers ────────────────────────────────────────

#[tokio::test]
async fn test_two_subscribers_with_independent_filters() {
    let (store, bus) = test_bus();
    seed_topics(&store, &["A", "B", "A"]).await;

    let c1 = bus
        .attach_as(
            "reports",
            "c1",
            SubscribeOptions::starting(StartFrom::Genesis).with_topic("A"),
        )
        .await
        .unwrap();
    let c2 = bus
        .attach_as(
            "reports",
            "c2",
            SubscribeOptions::starting(StartFrom::Genesis)
                .with_topic("B")
                .untracked(),
        )
        .await
        .unwrap();

    // Deliveries are serialized broker-wide; each consumer must keep
    // acking for the other to make progress
    let t1 = tokio::spawn(async move {
        let mut c1 = c1;
        drain(&mut c1, 2).await
    });
    let t2 = tokio::spawn(async move {
        let mut c2 = c2;
        drain(&mut c2, 1).await
    });

    assert_eq!(t1.await.unwrap(), vec![1, 3]);
    assert_eq!(t2.await.unwrap(), vec![2]);

    // Only the tracked subscriber moves the durable position
    wait_for_position(&store, "reports", 3).await;
}

#[tokio::test]
async fn test_untracked_subscribers_never_create_the_handle() {
    let (store, bus) = test_bus();
    seed_topics(&store, &["A", "A"]).await;

    let mut consumer = bus
        .attach_as(
            "reports",
            "c1",
            SubscribeOptions::starting(StartFrom::Genesis).untracked(),
        )
        .await
        .unwrap();

    assert_eq!(drain(&mut consumer, 2).await, vec![1, 2]);

    // Drained to the end, yet no durable state was written
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.get_handle("reports").await.unwrap().is_none());
}

#[tokio::test]
async fn test_handles_are_independent() {
    let (store, bus) = test_bus();
    seed_topics(&store, &["A", "A", "A"]).await;

    let mut c1 = bus
        .attach_as("fast", "c", SubscribeOptions::default())
        .await
        .unwrap();
    let mut c2 = bus
        .attach_as("slow", "c", SubscribeOptions::default())
        .await
        .unwrap();

    assert_eq!(drain(&mut c1, 3).await, vec![1, 2, 3]);
    assert_eq!(drain(&mut c2, 1).await, vec![1]);

    wait_for_position(&store, "fast", 3).await;
    wait_for_position(&store, "slow", 1).await;
}

// ─── Live tail ───────────────────────────────────────────────────

#[tokio::test]
async fn test_live_tail_delivers_new_events_exactly_once() {
    let (store, bus) = test_bus();
    seed_topics(&store, &["A"; 10]).await;

    let mut consumer = bus
        .attach_as(
            "reports",
            "c1",
            SubscribeOptions::starting(StartFrom::Current),
        )
        .await
        .unwrap();

    // Nothing from history
    assert!(
        timeout(Duration::from_millis(100), consumer.next())
            .await
            .is_err()
    );

    store
        .append("stream-1", "A", "", serde_json::json!({"live": true}))
        .await;

    let event = recv(&mut consumer).await;
    assert_eq!(event.number, 11);
    consumer.ack(11).await.unwrap();

    // Exactly once
    assert!(
        timeout(Duration::from_millis(100), consumer.next())
            .await
            .is_err()
    );
    wait_for_position(&store, "reports", 11).await;
}

#[tokio::test]
async fn test_catch_up_seam_loses_nothing() {
    let (store, bus) = test_bus();
    seed_topics(&store, &["A", "A", "A"]).await;

    let mut consumer = bus
        .attach_as("reports", "c1", SubscribeOptions::default())
        .await
        .unwrap();

    // Append while the consumer is still catching up
    store.append("stream-1", "A", "", serde_json::json!({})).await;
    store.append("stream-1", "A", "", serde_json::json!({})).await;

    assert_eq!(drain(&mut consumer, 5).await, vec![1, 2, 3, 4, 5]);
    wait_for_position(&store, "reports", 5).await;
}

#[tokio::test]
async fn test_lagged_live_notifications_recover_via_storage() {
    let (store, bus) = test_bus();

    let mut consumer = bus
        .attach_as(
            "reports",
            "c1",
            SubscribeOptions::starting(StartFrom::Current),
        )
        .await
        .unwrap();

    // Let the broker settle into live tail so the listener is armed
    for _ in 0..100 {
        let status = bus.status("reports").await.unwrap();
        if status.mode == BrokerMode::LiveTail {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Burst far past what the notification channel buffers. On the
    // single-threaded test runtime the listener task does not run
    // between appends, so it wakes to a lagged receiver and the
    // broker must recover the dropped events from storage
    for i in 0..400u64 {
        store
            .append("stream-1", "A", "", serde_json::json!({"i": i}))
            .await;
    }

    let expected: Vec<u64> = (1..=400).collect();
    assert_eq!(drain(&mut consumer, 400).await, expected);
    wait_for_position(&store, "reports", 400).await;
}

#[tokio::test]
async fn test_unsubscribe_recomputes_query_scope() {
    let (store, bus) = test_bus();

    let mut c1 = bus
        .attach_as(
            "reports",
            "c1",
            SubscribeOptions::starting(StartFrom::Genesis)
                .with_topic("A")
                .with_stream("x"),
        )
        .await
        .unwrap();
    let c2 = bus
        .attach_as(
            "reports",
            "c2",
            SubscribeOptions::starting(StartFrom::Genesis)
                .with_topic("B")
                .with_stream("y")
                .untracked(),
        )
        .await
        .unwrap();

    let status = bus.status("reports").await.unwrap();
    assert_eq!(status.streams, vec!["x", "y"]);
    assert_eq!(status.topics, vec!["A", "B"]);

    // Removing a subscriber narrows the scope served by future
    // storage reads to the union of what remains
    bus.unsubscribe("reports", "c2").await.unwrap();
    drop(c2);

    let status = bus.status("reports").await.unwrap();
    assert_eq!(status.subscribers, 1);
    assert_eq!(status.streams, vec!["x"]);
    assert_eq!(status.topics, vec!["A"]);

    // Only the remaining subscriber's scope is delivered
    store.append("y", "B", "", serde_json::json!({})).await;
    store.append("x", "A", "", serde_json::json!({})).await;

    let event = recv(&mut c1).await;
    assert_eq!(event.number, 2);
    assert_eq!(event.topic, "A");
    c1.ack(2).await.unwrap();
}

#[tokio::test]
async fn test_broker_settles_into_live_tail() {
    let (store, bus) = test_bus();
    seed_topics(&store, &["A"]).await;

    let mut consumer = bus
        .attach_as("reports", "c1", SubscribeOptions::default())
        .await
        .unwrap();
    drain(&mut consumer, 1).await;

    for _ in 0..100 {
        let status = bus.status("reports").await.unwrap();
        if status.mode == BrokerMode::LiveTail && status.ready {
            assert_eq!(status.buffered, 0);
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("broker never settled into live tail");
}

// ─── Durable resume ──────────────────────────────────────────────

#[tokio::test]
async fn test_persisted_position_overrides_genesis() {
    let (store, bus) = test_bus();
    seed_topics(&store, &["A"; 10]).await;
    store.upsert_handle("reports", 7).await.unwrap();

    let mut consumer = bus
        .attach_as(
            "reports",
            "c1",
            SubscribeOptions::starting(StartFrom::Genesis),
        )
        .await
        .unwrap();

    // Requested genesis, but the durable cursor pins the start
    assert_eq!(consumer.subscription().ack, 7);
    assert_eq!(drain(&mut consumer, 3).await, vec![8, 9, 10]);
    wait_for_position(&store, "reports", 10).await;
}

#[tokio::test]
async fn test_restart_resumes_where_the_group_left_off() {
    let store = MemoryStore::new();
    seed_topics(&store, &["A"; 5]).await;

    {
        let bus = EventBus::new(store.clone());
        let mut consumer = bus
            .attach_as("reports", "c1", SubscribeOptions::default())
            .await
            .unwrap();
        assert_eq!(drain(&mut consumer, 3).await, vec![1, 2, 3]);
        wait_for_position(&store, "reports", 3).await;
        // Bus and consumer dropped: brokers shut down
    }

    let bus = EventBus::new(store.clone());
    let mut consumer = bus
        .attach_as("reports", "c1", SubscribeOptions::default())
        .await
        .unwrap();

    assert_eq!(drain(&mut consumer, 2).await, vec![4, 5]);
    wait_for_position(&store, "reports", 5).await;
}

// ─── Lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (store, bus) = test_bus();
    seed_topics(&store, &["A"]).await;

    let mut consumer = bus
        .attach_as("reports", "c1", SubscribeOptions::default())
        .await
        .unwrap();
    drain(&mut consumer, 1).await;

    bus.unsubscribe("reports", "c1").await.unwrap();
    assert!(bus.subscription("reports", "c1").await.unwrap().is_none());

    // Appends after unsubscribe go nowhere; the delivery channel is
    // closed along with the record
    store.append("stream-1", "A", "", serde_json::json!({})).await;
    let next = timeout(Duration::from_secs(1), consumer.next()).await;
    assert_eq!(next.unwrap(), None);
}

#[tokio::test]
async fn test_late_subscriber_joins_live_handle() {
    let (store, bus) = test_bus();
    seed_topics(&store, &["A", "B"]).await;

    let c1 = bus
        .attach_as(
            "reports",
            "c1",
            SubscribeOptions::starting(StartFrom::Genesis).with_topic("A"),
        )
        .await
        .unwrap();

    let t1 = tokio::spawn(async move {
        let mut c1 = c1;
        drain(&mut c1, 1).await
    });
    assert_eq!(t1.await.unwrap(), vec![1]);

    // Second subscriber rewinds the working position; its own filter
    // replays nothing already acked by the first
    let c2 = bus
        .attach_as(
            "reports",
            "c2",
            SubscribeOptions::starting(StartFrom::Genesis)
                .with_topic("B")
                .untracked(),
        )
        .await
        .unwrap();

    let t2 = tokio::spawn(async move {
        let mut c2 = c2;
        drain(&mut c2, 1).await
    });
    assert_eq!(t2.await.unwrap(), vec![2]);
}

#[tokio::test]
async fn test_ack_against_unknown_handle_fails() {
    let (_store, bus) = test_bus();
    assert!(matches!(
        bus.ack("nowhere", "c1", 1).await.unwrap_err(),
        EventError::NotFound(_)
    ));
}
