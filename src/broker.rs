//! Per-handle subscription broker
//!
//! One broker serves one handle. It owns the subscriber table, a
//! working copy of the durable handle position, a small overflow
//! buffer, and at most one catch-up worker. All state transitions run
//! on a single task fed by two queues: external commands (subscribe,
//! unsubscribe, ack, introspection) and internal signals (worker
//! pushes and completions, live-tail events). Dispatch is strictly
//! one event in flight across the whole broker: a delivery is sent,
//! its ack processed, and only then does the next event move.
//!
//! Mode progression: a fresh subscription (re)starts a catch-up
//! worker that drains history under the broker's pacing; when it
//! finishes, the broker re-registers for new-event notifications,
//! reconciles the gap between the worker's snapshot and the present,
//! and from then on feeds live events through the same buffer and
//! dispatch path.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{EventError, Result};
use crate::store::{EventFilter, EventStore};
use crate::subscription::{Record, SubscriptionSet};
use crate::types::{
    BrokerMode, BrokerStatus, Event, StartFrom, SubscribeOptions, Subscription,
};
use crate::worker::{self, WorkerGate, WorkerOutcome};

/// Bounded wait for subscribe/unsubscribe/introspection calls
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Command mailbox depth
const MAILBOX_CAPACITY: usize = 64;

/// Internal signal queue depth
///
/// Holds at most a handful of entries at once (one paced worker push,
/// a completion, a buffer re-entry, live events as they trickle in).
const SIGNAL_CAPACITY: usize = 64;

/// External request to a broker
pub(crate) enum Command {
    Subscribe {
        consumer: String,
        opts: SubscribeOptions,
        sink: mpsc::Sender<Event>,
        reply: oneshot::Sender<Result<Subscription>>,
    },
    Unsubscribe {
        consumer: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Ack {
        consumer: String,
        number: u64,
        reply: oneshot::Sender<Result<u64>>,
    },
    GetSubscription {
        consumer: String,
        reply: oneshot::Sender<Option<Subscription>>,
    },
    Status {
        reply: oneshot::Sender<BrokerStatus>,
    },
}

/// Internal event on the broker's signal queue
///
/// `Push` is the uniform dispatch entry: worker-fed and
/// buffer-originated events both pass through it.
pub(crate) enum Signal {
    Push(Event),
    WorkerDone { gen: u64, outcome: WorkerOutcome },
    Live { gen: u64, event: Event },
    LiveLagged { gen: u64, skipped: u64 },
}

/// Client handle to a running broker task
///
/// Cheap to clone; all clones talk to the same broker.
#[derive(Debug, Clone)]
pub struct Broker {
    handle: String,
    commands: mpsc::Sender<Command>,
}

impl Broker {
    /// Load the handle's durable position and start the broker task
    pub async fn open(store: Arc<dyn EventStore>, handle_id: impl Into<String>) -> Result<Self> {
        let handle = handle_id.into();
        let position = store
            .get_handle(&handle)
            .await?
            .map(|h| h.position)
            .unwrap_or(0);

        let (commands, command_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (signals, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);

        let core = BrokerCore {
            handle: handle.clone(),
            store,
            position,
            subs: SubscriptionSet::new(),
            streams: Vec::new(),
            topics: Vec::new(),
            buffer: VecDeque::new(),
            worker: None,
            worker_gen: 0,
            live: None,
            live_gen: 0,
            ready: true,
            signals,
        };
        tokio::spawn(run(core, command_rx, signal_rx));

        tracing::info!(handle = %handle, position, "Broker started");
        Ok(Self { handle, commands })
    }

    /// The handle this broker serves
    pub fn handle_id(&self) -> &str {
        &self.handle
    }

    /// Register a consumer, or return its existing subscription
    ///
    /// Idempotent per consumer id: a second call returns the existing
    /// record unchanged and discards the new sink. On creation the
    /// broker resolves the start position, rescopes its storage
    /// queries, and restarts the catch-up worker.
    pub async fn subscribe(
        &self,
        consumer_id: impl Into<String>,
        opts: SubscribeOptions,
        sink: mpsc::Sender<Event>,
    ) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            consumer: consumer_id.into(),
            opts,
            sink,
            reply,
        })
        .await?;
        self.bounded(rx, "subscribe").await?
    }

    /// Remove a consumer's subscription; unknown ids are a no-op
    pub async fn unsubscribe(&self, consumer_id: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unsubscribe {
            consumer: consumer_id.into(),
            reply,
        })
        .await?;
        self.bounded(rx, "unsubscribe").await?
    }

    /// Acknowledge a delivered event
    ///
    /// Returns the acked number. An ack that does not match the
    /// consumer's outstanding delivery is ignored. A storage failure
    /// while persisting the handle position is returned here; the
    /// in-memory cursor has already advanced.
    pub async fn ack(&self, consumer_id: impl Into<String>, number: u64) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Ack {
            consumer: consumer_id.into(),
            number,
            reply,
        })
        .await?;
        // No deadline: the durable write may be slow but must report
        rx.await
            .map_err(|_| self.closed())?
    }

    /// Snapshot a consumer's subscription, if registered
    pub async fn subscription(
        &self,
        consumer_id: impl Into<String>,
    ) -> Result<Option<Subscription>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetSubscription {
            consumer: consumer_id.into(),
            reply,
        })
        .await?;
        self.bounded(rx, "subscription").await
    }

    /// Snapshot the broker's dispatch state
    pub async fn status(&self) -> Result<BrokerStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        self.bounded(rx, "status").await
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| self.closed())
    }

    async fn bounded<T>(&self, rx: oneshot::Receiver<T>, op: &str) -> Result<T> {
        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(self.closed()),
            Err(_) => Err(EventError::Timeout(format!(
                "{} on handle '{}'",
                op, self.handle
            ))),
        }
    }

    fn closed(&self) -> EventError {
        EventError::Closed(format!("broker for handle '{}' is gone", self.handle))
    }
}

/// Live-tail listener task forwarding store notifications
struct LiveListener {
    task: JoinHandle<()>,
}

impl Drop for LiveListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct BrokerCore {
    handle: String,
    store: Arc<dyn EventStore>,

    /// Working copy of the durable handle position
    position: u64,

    subs: SubscriptionSet,

    /// Deduplicated unions scoping storage queries; the
    /// per-subscription filter remains the delivery authority
    streams: Vec<String>,
    topics: Vec<String>,

    /// Overflow buffer, ascending and unique by number
    buffer: VecDeque<Event>,

    worker: Option<WorkerGate>,
    worker_gen: u64,

    live: Option<LiveListener>,
    live_gen: u64,

    /// False while a delivery awaits acknowledgement
    ready: bool,

    signals: mpsc::Sender<Signal>,
}

async fn run(
    mut core: BrokerCore,
    mut commands: mpsc::Receiver<Command>,
    mut signals: mpsc::Receiver<Signal>,
) {
    loop {
        tokio::select! {
            maybe = commands.recv() => match maybe {
                Some(command) => core.handle_command(command).await,
                // All client handles dropped
                None => break,
            },
            Some(signal) = signals.recv() => core.handle_signal(signal).await,
        }
    }
    core.shutdown();
    tracing::debug!(handle = %core.handle, "Broker stopped");
}

impl BrokerCore {
    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                consumer,
                opts,
                sink,
                reply,
            } => {
                let result = self.subscribe(consumer, opts, sink).await;
                let _ = reply.send(result);
            }
            Command::Unsubscribe { consumer, reply } => {
                let result = self.unsubscribe(&consumer).await;
                let _ = reply.send(result);
            }
            Command::Ack {
                consumer,
                number,
                reply,
            } => {
                let result = self.ack(&consumer, number).await;
                let _ = reply.send(result);
            }
            Command::GetSubscription { consumer, reply } => {
                let _ = reply.send(self.subs.get(&consumer).map(Record::snapshot));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Push(event) => self.dispatch(event).await,
            Signal::WorkerDone { gen, outcome } => self.worker_done(gen, outcome).await,
            Signal::Live { gen, event } => {
                if gen == self.live_gen && self.live.is_some() {
                    self.ingest(event).await;
                }
            }
            Signal::LiveLagged { gen, skipped } => {
                if gen == self.live_gen && self.live.is_some() {
                    tracing::warn!(
                        handle = %self.handle,
                        skipped,
                        "Live notifications lagged; re-reading from storage"
                    );
                    self.resync().await;
                }
            }
        }
    }

    async fn subscribe(
        &mut self,
        consumer: String,
        opts: SubscribeOptions,
        sink: mpsc::Sender<Event>,
    ) -> Result<Subscription> {
        if let Some(existing) = self.subs.get(&consumer) {
            tracing::debug!(
                handle = %self.handle,
                consumer = %consumer,
                "Consumer already subscribed; returning existing record"
            );
            return Ok(existing.snapshot());
        }

        // A handle that has durably advanced pins the start position:
        // rewinding below committed progress is not possible
        let start = if self.position > 0 {
            self.position
        } else {
            match opts.start {
                StartFrom::Current => self.store.index().await?,
                StartFrom::Genesis => 0,
                StartFrom::At { number } => number,
            }
        };

        let record = Record {
            id: consumer.clone(),
            handle: self.handle.clone(),
            ack: start,
            syn: start,
            track: opts.track,
            stream: opts.stream,
            topics: opts.topics,
            sink,
        };
        let snapshot = record.snapshot();
        self.subs.insert(record);
        self.recompute_scope();
        self.restart_worker();

        tracing::info!(
            handle = %self.handle,
            consumer = %consumer,
            start,
            track = snapshot.track,
            "Subscription created"
        );
        Ok(snapshot)
    }

    async fn unsubscribe(&mut self, consumer: &str) -> Result<()> {
        if self.remove_subscription(consumer).await {
            tracing::info!(
                handle = %self.handle,
                consumer = %consumer,
                "Subscription removed"
            );
        }
        Ok(())
    }

    /// Drop a subscription and repair dispatch state
    ///
    /// Returns false if the consumer was not registered.
    async fn remove_subscription(&mut self, consumer: &str) -> bool {
        let Some(removed) = self.subs.remove(consumer) else {
            return false;
        };
        self.recompute_scope();

        if self.subs.is_empty() {
            // Idle: nobody left to deliver to
            self.stop_worker();
            self.buffer.clear();
            self.live = None;
            self.ready = true;
        } else if removed.in_flight() {
            // Its ack will never arrive; unblock dispatch
            self.ready = true;
            self.sched_next().await;
        }
        true
    }

    async fn ack(&mut self, consumer: &str, number: u64) -> Result<u64> {
        {
            let Some(record) = self.subs.get_mut(consumer) else {
                tracing::debug!(
                    handle = %self.handle,
                    consumer = %consumer,
                    number,
                    "Ack from unknown consumer ignored"
                );
                return Ok(number);
            };
            if record.syn != number {
                tracing::debug!(
                    handle = %self.handle,
                    consumer = %consumer,
                    number,
                    outstanding = record.syn,
                    "Ack does not match outstanding delivery; ignored"
                );
                return Ok(number);
            }
            record.ack = number;
        }

        tracing::debug!(
            handle = %self.handle,
            consumer = %consumer,
            number,
            "Delivery acknowledged"
        );

        // Everything at or below the collective high-water mark is done
        if let Some(max_ack) = self.subs.max_ack() {
            while self.buffer.front().is_some_and(|e| e.number <= max_ack) {
                self.buffer.pop_front();
            }
        }

        self.ready = true;
        self.sched_next().await;
        self.persist_position(consumer).await?;
        Ok(number)
    }

    /// Advance the durable handle position behind the fastest tracked
    /// subscriber
    ///
    /// Only the subscriber currently holding the highest ack may move
    /// the position, only if it is tracked, only past the persisted
    /// value, and only from its own ack. Untracked acks prune the
    /// buffer but never touch durable state.
    async fn persist_position(&mut self, acker: &str) -> Result<()> {
        let target = match self.subs.max_ack_record() {
            Some(best) if best.track && best.id == acker && best.ack > self.position => best.ack,
            _ => return Ok(()),
        };

        match self.store.upsert_handle(&self.handle, target).await {
            Ok(_) => {
                self.position = target;
                tracing::debug!(
                    handle = %self.handle,
                    position = target,
                    "Handle position advanced"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    handle = %self.handle,
                    position = target,
                    error = %e,
                    "Failed to persist handle position"
                );
                Err(e)
            }
        }
    }

    /// Uniform dispatch path for worker pushes and buffer re-entries
    async fn dispatch(&mut self, event: Event) {
        if !self.ready {
            // A delivery is outstanding; keep the event, in order
            self.stash(event);
            return;
        }

        loop {
            let Some(idx) = self.subs.position_admitting(&event) else {
                // Nobody can take it now; per-subscription acks gate
                // any later redelivery through catch-up or the buffer
                self.ready = true;
                self.sched_next().await;
                return;
            };
            let Some(record) = self.subs.get_index_mut(idx) else {
                return;
            };
            let consumer = record.id.clone();

            match record.sink.try_send(event.clone()) {
                Ok(()) => {
                    record.syn = event.number;
                    self.ready = false;
                    tracing::debug!(
                        handle = %self.handle,
                        consumer = %consumer,
                        number = event.number,
                        "Event delivered"
                    );
                    return;
                }
                Err(_) => {
                    // Closed or backed-up sink: the consumer is gone
                    tracing::warn!(
                        handle = %self.handle,
                        consumer = %consumer,
                        number = event.number,
                        "Delivery channel unavailable; dropping subscription"
                    );
                    self.remove_subscription(&consumer).await;
                }
            }
        }
    }

    /// Decide what moves next after any state change
    async fn sched_next(&mut self) {
        if self.buffer.is_empty() {
            if self.ready {
                if let Some(gate) = &self.worker {
                    gate.resume();
                }
            }
            return;
        }

        // Buffered events wait for the outstanding ack
        if !self.ready || !self.subs.quiescent() {
            return;
        }

        if let Some(event) = self.buffer.pop_front() {
            if let Err(err) = self.signals.try_send(Signal::Push(event)) {
                // Queue full; put it back for the next turn
                match err {
                    mpsc::error::TrySendError::Full(Signal::Push(event))
                    | mpsc::error::TrySendError::Closed(Signal::Push(event)) => {
                        self.buffer.push_front(event);
                    }
                    _ => {}
                }
            }
        }
    }

    async fn worker_done(&mut self, gen: u64, outcome: WorkerOutcome) {
        if gen != self.worker_gen {
            tracing::debug!(
                handle = %self.handle,
                gen,
                current = self.worker_gen,
                "Stale worker completion ignored"
            );
            return;
        }

        match outcome {
            WorkerOutcome::Stopped(number) => {
                tracing::debug!(
                    handle = %self.handle,
                    last = number,
                    "Worker stop acknowledged"
                );
            }
            WorkerOutcome::Finished => {
                self.worker = None;
                tracing::debug!(
                    handle = %self.handle,
                    "Catch-up complete; switching to live tail"
                );
                // Listen first, then read the gap: anything committed
                // in between shows up twice and is deduplicated by
                // number, never missed
                self.arm_live();
                self.resync().await;
            }
        }
    }

    /// (Re-)register for new-event notifications from the store
    ///
    /// The listener is a forwarder task: it owns the broadcast
    /// receiver and relays into the signal queue, tagged with a
    /// generation so a disarmed listener's stragglers are ignored.
    fn arm_live(&mut self) {
        self.live_gen += 1;
        let gen = self.live_gen;
        let mut notifications = BroadcastStream::new(self.store.notifications());
        let signals = self.signals.clone();
        let task = tokio::spawn(async move {
            // Ends when the store drops its sender
            while let Some(item) = notifications.next().await {
                let signal = match item {
                    Ok(event) => Signal::Live { gen, event },
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        Signal::LiveLagged { gen, skipped }
                    }
                };
                if signals.send(signal).await.is_err() {
                    return;
                }
            }
        });
        self.live = Some(LiveListener { task });
    }

    /// Append a live event unless it is already covered
    async fn ingest(&mut self, event: Event) {
        if self.worker.is_some() {
            // Catch-up re-reads from storage; nothing to do here
            return;
        }
        if event.number <= self.working_floor() {
            return;
        }
        self.buffer.push_back(event);
        self.sched_next().await;
    }

    /// Re-read the log past the working floor and seed the buffer
    ///
    /// Runs after worker completion (the snapshot race window) and
    /// after a lagged live receiver. Recoverable: failures are logged
    /// and the next notification or resync tries again.
    async fn resync(&mut self) {
        let filter = EventFilter::new()
            .after(self.working_floor())
            .in_streams(self.streams.clone())
            .in_topics(self.topics.clone());

        let mut stream = match self.store.query_events(filter).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(handle = %self.handle, error = %e, "Reconciliation read failed");
                return;
            }
        };

        let mut seeded = 0u64;
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    let tail = self.buffer.back().map(|e| e.number);
                    if tail.map_or(true, |t| event.number > t) {
                        self.buffer.push_back(event);
                        seeded += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(handle = %self.handle, error = %e, "Reconciliation read aborted");
                    break;
                }
            }
        }

        if seeded > 0 {
            tracing::debug!(handle = %self.handle, seeded, "Buffer seeded from reconciliation read");
        }
        self.sched_next().await;
    }

    /// Highest event number already covered by dispatch state
    fn working_floor(&self) -> u64 {
        match self.buffer.back() {
            Some(tail) => tail.number,
            None => self.subs.max_syn().unwrap_or(0).max(self.position),
        }
    }

    /// Insert into the buffer preserving ascending unique numbers
    fn stash(&mut self, event: Event) {
        match self.buffer.iter().position(|e| e.number >= event.number) {
            Some(idx) => {
                if self.buffer[idx].number != event.number {
                    self.buffer.insert(idx, event);
                }
            }
            None => self.buffer.push_back(event),
        }
    }

    fn recompute_scope(&mut self) {
        self.streams = self.subs.stream_union();
        self.topics = self.subs.topic_union();
    }

    /// Replace the catch-up worker, restarting from the lowest syn
    fn restart_worker(&mut self) {
        if let Some(gate) = self.worker.take() {
            gate.stop();
        }
        // Catch-up owns the flow: live events would jump the queue.
        // Buffered events are re-read from storage by the new worker.
        self.live = None;
        self.buffer.clear();

        self.worker_gen += 1;
        let from = self.subs.min_syn().unwrap_or(self.position);
        let filter = EventFilter::new()
            .after(from)
            .in_streams(self.streams.clone())
            .in_topics(self.topics.clone());
        let gate = worker::spawn(
            self.store.clone(),
            filter,
            self.worker_gen,
            self.signals.clone(),
        );
        tracing::debug!(
            handle = %self.handle,
            from,
            gen = gate.gen(),
            "Catch-up worker started"
        );
        self.worker = Some(gate);
    }

    fn stop_worker(&mut self) {
        if let Some(gate) = self.worker.take() {
            gate.stop();
            // Invalidate any completion still in flight
            self.worker_gen += 1;
        }
    }

    fn status(&self) -> BrokerStatus {
        let mode = if self.worker.is_some() {
            BrokerMode::CatchUp
        } else if !self.buffer.is_empty() {
            BrokerMode::Draining
        } else {
            BrokerMode::LiveTail
        };
        BrokerStatus {
            handle: self.handle.clone(),
            position: self.position,
            subscribers: self.subs.len(),
            streams: self.streams.clone(),
            topics: self.topics.clone(),
            buffered: self.buffer.len(),
            mode,
            ready: self.ready,
        }
    }

    fn shutdown(&mut self) {
        self.stop_worker();
        self.live = None;
    }
}
