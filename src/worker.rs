//! Catch-up worker: one-shot historical drain
//!
//! A worker performs a single streaming read over the committed log
//! and feeds the broker one event at a time. After each push it
//! blocks until the broker answers with a directive: `Continue` to
//! advance, `Stop` to abandon the read. The broker therefore controls
//! the pace; the worker never runs ahead of an unacknowledged
//! delivery. Completions carry the worker's generation so a replaced
//! worker cannot be mistaken for the current one.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::broker::Signal;
use crate::store::{EventFilter, EventStore};

/// Depth of the broker→worker directive channel
const DIRECTIVE_CAPACITY: usize = 4;

/// Broker→worker pacing directive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
    /// Advance to the next event
    Continue,
    /// Abandon the read and report back
    Stop,
}

/// How a worker run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerOutcome {
    /// The stream is exhausted; the broker may switch to live tail
    Finished,
    /// Stopped on request; carries the last pushed event number
    Stopped(u64),
}

/// Broker-side handle to a running worker
#[derive(Debug)]
pub(crate) struct WorkerGate {
    gen: u64,
    directives: mpsc::Sender<Directive>,
}

impl WorkerGate {
    pub fn gen(&self) -> u64 {
        self.gen
    }

    /// Let the worker advance past its pending event
    pub fn resume(&self) {
        // A closed or full channel means the worker is already done
        let _ = self.directives.try_send(Directive::Continue);
    }

    /// Ask the worker to abandon its read
    ///
    /// Advisory: the worker notices at its next directive wait.
    pub fn stop(&self) {
        let _ = self.directives.try_send(Directive::Stop);
    }
}

/// Spawn a worker draining `filter` into the broker's signal queue
pub(crate) fn spawn(
    store: Arc<dyn EventStore>,
    filter: EventFilter,
    gen: u64,
    signals: mpsc::Sender<Signal>,
) -> WorkerGate {
    let (directives, directive_rx) = mpsc::channel(DIRECTIVE_CAPACITY);
    tokio::spawn(run(store, filter, gen, directive_rx, signals));
    WorkerGate { gen, directives }
}

async fn run(
    store: Arc<dyn EventStore>,
    filter: EventFilter,
    gen: u64,
    mut directives: mpsc::Receiver<Directive>,
    signals: mpsc::Sender<Signal>,
) {
    let mut stream = match store.query_events(filter).await {
        Ok(stream) => stream,
        Err(e) => {
            // Storage failure counts as exhaustion; the broker's
            // reconciliation read covers whatever was missed
            tracing::warn!(gen, error = %e, "Catch-up read failed to start");
            let _ = signals
                .send(Signal::WorkerDone {
                    gen,
                    outcome: WorkerOutcome::Finished,
                })
                .await;
            return;
        }
    };

    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(gen, error = %e, "Catch-up read aborted");
                break;
            }
        };

        let number = event.number;
        if signals.send(Signal::Push(event)).await.is_err() {
            // Broker is gone; nothing left to drain for
            return;
        }

        match directives.recv().await {
            Some(Directive::Continue) => {}
            Some(Directive::Stop) => {
                let _ = signals
                    .send(Signal::WorkerDone {
                        gen,
                        outcome: WorkerOutcome::Stopped(number),
                    })
                    .await;
                return;
            }
            None => return,
        }
    }

    let _ = signals
        .send(Signal::WorkerDone {
            gen,
            outcome: WorkerOutcome::Finished,
        })
        .await;
}
