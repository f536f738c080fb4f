//! Dispatch loop
//!
//! One task per broadcaster owns the consumer set, the history buffer, and
//! all outbound delivery. Every mutation arrives over a channel: values on
//! the ingress queue, registry operations on the control channel. The loop
//! serves exactly one source per iteration, which is what serialises
//! membership changes against fan-out and keeps replay gap-free.

use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};

use super::broadcaster::BroadcasterStats;
use super::config::ValueCallback;
use super::error::{BroadcastError, Result};
use super::history::HistoryBuffer;
use super::registry::{invoke_hook, ConsumerEntry, ConsumerSet, Offer};

/// Broadcaster lifecycle, published on a watch channel.
///
/// `Idle` exists only for lazily-started broadcasters and ends with the
/// first registration; producers are gated on leaving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BroadcastState {
    /// Lazy start: no consumer has ever registered, producers are held back
    Idle,
    /// Values flow
    Dispatching,
    /// Terminated; every operation fails with `Closed`
    Closed,
}

/// Registry operations, serialised through the dispatch loop
pub(crate) enum Control<T> {
    Register {
        entry: ConsumerEntry<T>,
        ack: oneshot::Sender<Result<()>>,
    },
    Unregister {
        channel: mpsc::Sender<T>,
        ack: oneshot::Sender<Result<()>>,
    },
    Stats {
        ack: oneshot::Sender<BroadcasterStats>,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

pub(crate) struct Dispatcher<T> {
    ingress: mpsc::Receiver<T>,
    control: mpsc::Receiver<Control<T>>,
    consumers: ConsumerSet<T>,
    history: HistoryBuffer<T>,
    post_broadcast: Option<ValueCallback<T>>,
    state: watch::Sender<BroadcastState>,
    dispatched: u64,
}

/// Spawn the dispatch loop for a new broadcaster
pub(crate) fn spawn<T: Clone + Send + 'static>(
    ingress: mpsc::Receiver<T>,
    control: mpsc::Receiver<Control<T>>,
    history: HistoryBuffer<T>,
    post_broadcast: Option<ValueCallback<T>>,
    state: watch::Sender<BroadcastState>,
) {
    let dispatcher = Dispatcher {
        ingress,
        control,
        consumers: ConsumerSet::new(),
        history,
        post_broadcast,
        state,
        dispatched: 0,
    };
    tokio::spawn(dispatcher.run());
}

impl<T: Clone + Send + 'static> Dispatcher<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                request = self.control.recv() => match request {
                    Some(Control::Close { ack }) => {
                        self.shutdown(Some(ack));
                        return;
                    }
                    Some(request) => self.handle_control(request),
                    // Every handle clone is gone; nothing can reach us again.
                    None => {
                        self.shutdown(None);
                        return;
                    }
                },
                value = self.ingress.recv() => match value {
                    Some(value) => self.dispatch(value),
                    None => {
                        self.shutdown(None);
                        return;
                    }
                },
            }
        }
    }

    fn handle_control(&mut self, request: Control<T>) {
        match request {
            Control::Register { entry, ack } => {
                let result = self.register(entry);
                let _ = ack.send(result);
            }
            Control::Unregister { channel, ack } => {
                let result = self.consumers.remove(&channel);
                if result.is_ok() {
                    tracing::debug!(consumers = self.consumers.len(), "consumer unregistered");
                }
                let _ = ack.send(result);
            }
            Control::Stats { ack } => {
                let _ = ack.send(BroadcasterStats {
                    consumers: self.consumers.len(),
                    history_values: self.history.len(),
                    values_dispatched: self.dispatched,
                });
            }
            // Close never reaches here; `run` intercepts it to exit the loop.
            Control::Close { ack } => {
                let _ = ack.send(());
            }
        }
    }

    /// Install a consumer: duplicate check, history replay, then insertion.
    ///
    /// Replay happens before the entry joins the live set and before the
    /// registration is acknowledged, so nothing submitted after `register`
    /// returns can overtake the history snapshot. Replay applies the same
    /// refusal policy as live delivery; a consumer can be lost mid-replay.
    fn register(&mut self, mut entry: ConsumerEntry<T>) -> Result<()> {
        if self.consumers.contains(entry.channel()) {
            return Err(BroadcastError::AlreadyRegistered);
        }

        let snapshot = self.history.replay(Instant::now());
        let replayed = snapshot.len();
        let mut survived = true;
        for value in &snapshot {
            match entry.offer(value) {
                Offer::Delivered | Offer::Dropped => {}
                Offer::Disconnect | Offer::Gone => {
                    survived = false;
                    break;
                }
            }
        }

        if survived {
            self.consumers.push(entry);
            tracing::debug!(
                consumers = self.consumers.len(),
                replayed,
                "consumer registered"
            );
        } else {
            tracing::warn!(replayed, "consumer lost during history replay");
        }

        // First registration starts a lazy broadcaster: producers blocked on
        // the gate resume only after this registration is fully applied.
        if *self.state.borrow() == BroadcastState::Idle {
            let _ = self.state.send(BroadcastState::Dispatching);
        }
        Ok(())
    }

    fn dispatch(&mut self, value: T) {
        self.history.record(&value, Instant::now());
        self.consumers.broadcast(&value);
        self.dispatched += 1;
        if let Some(hook) = &self.post_broadcast {
            invoke_hook(hook, &value, "post_broadcast");
        }
    }

    /// Terminate: close every consumer channel, release the history, answer
    /// queued control requests with `Closed`. The ingress queue is dropped
    /// undrained.
    fn shutdown(&mut self, ack: Option<oneshot::Sender<()>>) {
        let _ = self.state.send(BroadcastState::Closed);

        let consumers = self.consumers.len();
        self.consumers = ConsumerSet::new();
        self.history = HistoryBuffer::disabled();
        if let Some(ack) = ack {
            let _ = ack.send(());
        }

        self.control.close();
        while let Ok(request) = self.control.try_recv() {
            match request {
                Control::Register { ack, .. } | Control::Unregister { ack, .. } => {
                    let _ = ack.send(Err(BroadcastError::Closed));
                }
                // Dropping the ack reports closure to the caller.
                Control::Stats { .. } => {}
                Control::Close { ack } => {
                    let _ = ack.send(());
                }
            }
        }

        tracing::info!(
            consumers,
            dispatched = self.dispatched,
            "broadcaster closed"
        );
    }
}
