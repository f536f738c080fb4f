//! Consumer registry
//!
//! The set of registered consumers, owned exclusively by the dispatcher.
//! Each entry pairs a consumer's delivery channel with its configuration;
//! the channel handle itself is the consumer's identity.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::config::{ConsumerConfig, ValueCallback};
use super::error::{BroadcastError, Result};

/// Outcome of offering one value to one consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Offer {
    /// The consumer's channel accepted the value
    Delivered,
    /// The channel was full; the value is lost for this consumer only
    Dropped,
    /// The channel was full and the consumer asked to be removed on refusal
    Disconnect,
    /// The consumer dropped its receiver; the entry is dead
    Gone,
}

/// A registered consumer: its delivery channel, configuration, and whether
/// it is currently inside a backpressure episode (used to log transitions
/// rather than every refused value).
pub(crate) struct ConsumerEntry<T> {
    channel: mpsc::Sender<T>,
    config: ConsumerConfig<T>,
    in_backpressure: bool,
}

impl<T: Clone> ConsumerEntry<T> {
    pub(crate) fn new(channel: mpsc::Sender<T>, config: ConsumerConfig<T>) -> Self {
        Self {
            channel,
            config,
            in_backpressure: false,
        }
    }

    /// Whether this entry wraps the given channel handle
    pub(crate) fn is(&self, channel: &mpsc::Sender<T>) -> bool {
        self.channel.same_channel(channel)
    }

    /// The delivery channel, for identity checks before installation
    pub(crate) fn channel(&self) -> &mpsc::Sender<T> {
        &self.channel
    }

    /// Offer a value without blocking, applying this consumer's refusal policy
    pub(crate) fn offer(&mut self, value: &T) -> Offer {
        match self.channel.try_send(value.clone()) {
            Ok(()) => {
                if self.in_backpressure {
                    self.in_backpressure = false;
                    tracing::debug!("consumer caught up, backpressure cleared");
                }
                Offer::Delivered
            }
            Err(TrySendError::Full(refused)) => {
                if !self.in_backpressure {
                    self.in_backpressure = true;
                    tracing::warn!(
                        disconnect = self.config.disconnect_on_backpressure,
                        "consumer cannot keep up, applying backpressure policy"
                    );
                }
                if let Some(hook) = &self.config.on_backpressure {
                    invoke_hook(hook, &refused, "on_backpressure");
                }
                if self.config.disconnect_on_backpressure {
                    Offer::Disconnect
                } else {
                    Offer::Dropped
                }
            }
            Err(TrySendError::Closed(_)) => Offer::Gone,
        }
    }
}

/// The authoritative consumer set.
///
/// Iteration order during fan-out is unspecified; within a single dispatch
/// each consumer is offered the value exactly once. Dropping the set drops
/// every entry's `Sender`, which is what closes the consumer channels.
pub(crate) struct ConsumerSet<T> {
    entries: Vec<ConsumerEntry<T>>,
}

impl<T: Clone> ConsumerSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, channel: &mpsc::Sender<T>) -> bool {
        self.entries.iter().any(|e| e.is(channel))
    }

    /// Install a consumer. Duplicate checks are the caller's job (it must
    /// run them before history replay, not after).
    pub(crate) fn push(&mut self, entry: ConsumerEntry<T>) {
        self.entries.push(entry);
    }

    /// Remove a consumer by channel identity, dropping its sender
    pub(crate) fn remove(&mut self, channel: &mpsc::Sender<T>) -> Result<()> {
        match self.entries.iter().position(|e| e.is(channel)) {
            Some(i) => {
                self.entries.swap_remove(i);
                Ok(())
            }
            None => Err(BroadcastError::NotRegistered),
        }
    }

    /// Offer a value to every consumer, removing those that refuse with a
    /// disconnect policy or whose receiver is gone
    pub(crate) fn broadcast(&mut self, value: &T) {
        let mut i = 0;
        while i < self.entries.len() {
            match self.entries[i].offer(value) {
                Offer::Delivered | Offer::Dropped => i += 1,
                Offer::Disconnect => {
                    // swap_remove moves a not-yet-offered tail entry into
                    // slot i, so the loop revisits i without advancing.
                    self.entries.swap_remove(i);
                    tracing::warn!(
                        consumers = self.entries.len(),
                        "consumer disconnected on backpressure"
                    );
                }
                Offer::Gone => {
                    self.entries.swap_remove(i);
                    tracing::debug!(
                        consumers = self.entries.len(),
                        "consumer receiver dropped, removing"
                    );
                }
            }
        }
    }
}

/// Run a user hook, containing any panic so it cannot take down the
/// dispatcher loop
pub(crate) fn invoke_hook<T>(hook: &ValueCallback<T>, value: &T, hook_name: &'static str) {
    if catch_unwind(AssertUnwindSafe(|| hook(value))).is_err() {
        tracing::error!(hook = hook_name, "hook panicked, continuing dispatch");
    }
}
