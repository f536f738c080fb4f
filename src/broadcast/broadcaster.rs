//! Broadcaster handle
//!
//! The cloneable producer-side handle over the dispatch loop. All methods
//! are safe to call from any number of concurrent tasks: values travel over
//! the bounded ingress queue, registry operations over the control channel,
//! and the lifecycle over a watch channel that gates lazy producers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{oneshot, watch};

use super::config::{BroadcasterConfig, ConsumerConfig};
use super::dispatcher::{self, BroadcastState, Control};
use super::error::{BroadcastError, Result};
use super::history::HistoryBuffer;
use super::registry::ConsumerEntry;

/// Capacity of the control channel. Registry operations are rare and each
/// sender awaits its acknowledgement, so a small backlog suffices.
const CONTROL_BACKLOG: usize = 16;

/// Point-in-time snapshot of a broadcaster, served by the dispatcher
/// between dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcasterStats {
    /// Currently registered consumers
    pub consumers: usize,
    /// Values currently retained for late-joiner replay
    pub history_values: usize,
    /// Total values fanned out since construction
    pub values_dispatched: u64,
}

/// Multi-consumer fan-out dispatcher handle
///
/// Created by one of the three factories, which differ only in the history
/// replayed to late joiners: [`non_blocking`](Broadcaster::non_blocking)
/// (none), [`non_blocking_replay`](Broadcaster::non_blocking_replay) (last
/// N values), [`non_blocking_ttl`](Broadcaster::non_blocking_ttl) (values
/// younger than a duration).
///
/// Consumers are plain `tokio::sync::mpsc` channels.
/// [`register`](Broadcaster::register) takes ownership of the `Sender`;
/// hold a clone if you intend to [`unregister`](Broadcaster::unregister)
/// later, and drop that clone afterwards so the consumer's `recv()`
/// terminates.
pub struct Broadcaster<T> {
    ingress: mpsc::Sender<T>,
    control: mpsc::Sender<Control<T>>,
    state: watch::Receiver<BroadcastState>,
    closed: Arc<AtomicBool>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            ingress: self.ingress.clone(),
            control: self.control.clone(),
            state: self.state.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// Create a broadcaster without history; late joiners see only values
    /// submitted after their registration completes.
    pub fn non_blocking(buffer_size: usize, config: BroadcasterConfig<T>) -> Result<Self> {
        Self::build(buffer_size, HistoryBuffer::disabled(), config)
    }

    /// Create a broadcaster that replays the last `replay_count` values to
    /// each newly registered consumer. A count of zero behaves like
    /// [`non_blocking`](Broadcaster::non_blocking).
    pub fn non_blocking_replay(
        buffer_size: usize,
        replay_count: usize,
        config: BroadcasterConfig<T>,
    ) -> Result<Self> {
        Self::build(buffer_size, HistoryBuffer::count(replay_count), config)
    }

    /// Create a broadcaster that replays every value submitted within the
    /// last `ttl` of wall-clock time. Expired values are never replayed.
    pub fn non_blocking_ttl(
        buffer_size: usize,
        ttl: Duration,
        config: BroadcasterConfig<T>,
    ) -> Result<Self> {
        if ttl.is_zero() {
            return Err(BroadcastError::InvalidConfig("ttl must be non-zero"));
        }
        Self::build(buffer_size, HistoryBuffer::ttl(ttl), config)
    }

    fn build(
        buffer_size: usize,
        history: HistoryBuffer<T>,
        config: BroadcasterConfig<T>,
    ) -> Result<Self> {
        // Bounded mpsc has no rendezvous mode; the lazy gate below, not the
        // queue, is what holds producers back when there is no audience.
        let (ingress_tx, ingress_rx) = mpsc::channel(buffer_size.max(1));
        let (control_tx, control_rx) = mpsc::channel(CONTROL_BACKLOG);

        let initial = if config.eager_broadcast {
            BroadcastState::Dispatching
        } else {
            BroadcastState::Idle
        };
        let (state_tx, state_rx) = watch::channel(initial);

        dispatcher::spawn(
            ingress_rx,
            control_rx,
            history,
            config.post_broadcast,
            state_tx,
        );

        Ok(Self {
            ingress: ingress_tx,
            control: control_tx,
            state: state_rx,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Submit a value, waiting for the dispatcher to accept it.
    ///
    /// On a lazily-started broadcaster with no consumer yet, this parks
    /// until the first registration completes or the broadcaster closes.
    /// That pause is how producers feel backpressure from an absent
    /// audience.
    pub async fn submit_blocking(&self, value: T) -> Result<()> {
        {
            let mut state = self.state.clone();
            let current = state
                .wait_for(|s| *s != BroadcastState::Idle)
                .await
                .map_err(|_| BroadcastError::Closed)?;
            if *current == BroadcastState::Closed {
                return Err(BroadcastError::Closed);
            }
        }
        self.ingress
            .send(value)
            .await
            .map_err(|_| BroadcastError::Closed)
    }

    /// Submit a value only if the ingress queue can take it right now.
    ///
    /// Returns [`BroadcastError::Dropped`] when the queue is full or when a
    /// lazily-started broadcaster has no consumer yet; the value reaches no
    /// consumer in either case.
    pub fn submit_non_blocking(&self, value: T) -> Result<()> {
        match *self.state.borrow() {
            BroadcastState::Idle => Err(BroadcastError::Dropped),
            BroadcastState::Closed => Err(BroadcastError::Closed),
            BroadcastState::Dispatching => match self.ingress.try_send(value) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(BroadcastError::Dropped),
                Err(TrySendError::Closed(_)) => Err(BroadcastError::Closed),
            },
        }
    }

    /// Register a consumer channel with the default configuration
    pub async fn register(&self, channel: mpsc::Sender<T>) -> Result<()> {
        self.register_with(channel, ConsumerConfig::default()).await
    }

    /// Register a consumer channel.
    ///
    /// Takes ownership of the `Sender`; the broadcaster drops it on removal,
    /// which is what ends the consumer's `recv()` stream. When this returns,
    /// history (if any) has been replayed into the channel and every value
    /// submitted afterwards will be offered to it. Registering a channel
    /// that is already registered fails with
    /// [`BroadcastError::AlreadyRegistered`].
    pub async fn register_with(
        &self,
        channel: mpsc::Sender<T>,
        config: ConsumerConfig<T>,
    ) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.control
            .send(Control::Register {
                entry: ConsumerEntry::new(channel, config),
                ack: ack_tx,
            })
            .await
            .map_err(|_| BroadcastError::Closed)?;
        ack_rx.await.map_err(|_| BroadcastError::Closed)?
    }

    /// Remove a consumer, identified by its channel handle.
    ///
    /// When this returns the consumer is out of the registry and will
    /// observe no further values. Unknown channels fail with
    /// [`BroadcastError::NotRegistered`].
    pub async fn unregister(&self, channel: &mpsc::Sender<T>) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.control
            .send(Control::Unregister {
                channel: channel.clone(),
                ack: ack_tx,
            })
            .await
            .map_err(|_| BroadcastError::Closed)?;
        ack_rx.await.map_err(|_| BroadcastError::Closed)?
    }

    /// Fetch a stats snapshot, serialised with dispatch like any other
    /// registry operation
    pub async fn stats(&self) -> Result<BroadcasterStats> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.control
            .send(Control::Stats { ack: ack_tx })
            .await
            .map_err(|_| BroadcastError::Closed)?;
        ack_rx.await.map_err(|_| BroadcastError::Closed)
    }

    /// Shut the broadcaster down: every consumer channel is closed, pending
    /// registry operations fail with [`BroadcastError::Closed`], queued but
    /// undispatched values are discarded. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .control
            .send(Control::Close { ack: ack_tx })
            .await
            .is_err()
        {
            // Dispatcher already gone (e.g. every other handle dropped).
            return Ok(());
        }
        let _ = ack_rx.await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_dispatched<T: Clone + Send + 'static>(b: &Broadcaster<T>, n: u64) {
        // Submissions are accepted by the queue, not the dispatcher; fence
        // on the dispatch counter before asserting on history or registry.
        loop {
            if b.stats().await.expect("broadcaster alive").values_dispatched >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_backpressure_only_on_slow_consumer() {
        let to_send = 20u32;
        let b = Broadcaster::non_blocking(to_send as usize, BroadcasterConfig::default()).unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<&'static str>();

        // Fast consumer: drained continuously.
        let (fast_tx, mut fast_rx) = mpsc::channel(1);
        tokio::spawn(async move { while fast_rx.recv().await.is_some() {} });

        // Slow consumer: reads five values, then stops reading but keeps
        // its receiver alive so the channel stays full.
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for _ in 0..5 {
                slow_rx.recv().await;
            }
            std::future::pending::<()>().await;
        });

        let fast_events = events_tx.clone();
        b.register_with(
            fast_tx,
            ConsumerConfig::new().on_backpressure(move |_: &u32| {
                let _ = fast_events.send("fast");
            }),
        )
        .await
        .unwrap();

        let slow_events = events_tx.clone();
        b.register_with(
            slow_tx,
            ConsumerConfig::new().on_backpressure(move |_: &u32| {
                let _ = slow_events.send("slow");
            }),
        )
        .await
        .unwrap();

        for i in 0..to_send {
            b.submit_blocking(i).await.unwrap();
            // Give the fast consumer time to actually stay fast.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        b.close().await.unwrap();

        // Close dropped the hooks' senders; draining terminates once the
        // local clone goes too.
        drop(events_tx);
        let mut count = 0;
        while let Some(name) = events_rx.recv().await {
            assert_eq!(name, "slow", "only the slow consumer may see backpressure");
            count += 1;
        }
        // The slow consumer read five values and a sixth parked in its
        // channel; the remaining fourteen were refused.
        assert_eq!(count, 14);
    }

    #[tokio::test]
    async fn test_lazy_broadcast_blocks_producer() {
        let b = Broadcaster::non_blocking(0, BroadcasterConfig::new().lazy()).unwrap();

        let producer = b.clone();
        let handle = tokio::spawn(async move { producer.submit_blocking("someValue").await });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(
            !handle.is_finished(),
            "submit must park until a consumer registers"
        );

        // Close is the other way out of the gate.
        b.close().await.unwrap();
        assert_eq!(handle.await.unwrap(), Err(BroadcastError::Closed));
    }

    #[tokio::test]
    async fn test_lazy_broadcast_refuses_non_blocking_submit() {
        let b = Broadcaster::non_blocking(0, BroadcasterConfig::new().lazy()).unwrap();

        let err = b.submit_non_blocking("someValue").unwrap_err();
        assert!(err.to_string().contains("value dropped"));
    }

    #[tokio::test]
    async fn test_eager_broadcast_accepts_without_consumers() {
        let b = Broadcaster::non_blocking(0, BroadcasterConfig::default()).unwrap();

        let result =
            tokio::time::timeout(Duration::from_millis(500), b.submit_blocking("someValue")).await;
        assert_eq!(result.expect("must not block in eager mode"), Ok(()));
    }

    #[tokio::test]
    async fn test_lazy_submit_resumes_on_first_registration() {
        let b = Broadcaster::non_blocking(0, BroadcasterConfig::new().lazy()).unwrap();

        let producer = b.clone();
        let handle = tokio::spawn(async move { producer.submit_blocking(42).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        // Registration completes first, so the consumer sees the value the
        // producer was parked on.
        let (tx, mut rx) = mpsc::channel(4);
        b.register(tx).await.unwrap();

        assert_eq!(handle.await.unwrap(), Ok(()));
        assert_eq!(rx.recv().await, Some(42));
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_delivers_recent_values() {
        let b = Broadcaster::non_blocking_replay(8, 3, BroadcasterConfig::default()).unwrap();

        for v in 1..=5 {
            b.submit_blocking(v).await.unwrap();
        }
        wait_for_dispatched(&b, 5).await;

        let (tx, mut rx) = mpsc::channel(8);
        b.register(tx).await.unwrap();

        for expected in [3, 4, 5] {
            assert_eq!(rx.recv().await, Some(expected));
        }

        b.submit_blocking(6).await.unwrap();
        assert_eq!(rx.recv().await, Some(6));
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ttl_expires_old_values() {
        let b =
            Broadcaster::non_blocking_ttl(8, Duration::from_millis(300), BroadcasterConfig::default())
                .unwrap();

        b.submit_blocking('a').await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        b.submit_blocking('b').await.unwrap();
        wait_for_dispatched(&b, 2).await;

        // 'a' ages past the ttl, 'b' does not.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let (tx, mut rx) = mpsc::channel(8);
        b.register(tx).await.unwrap();

        assert_eq!(rx.recv().await, Some('b'));
        b.submit_blocking('c').await.unwrap();
        assert_eq!(rx.recv().await, Some('c'));
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_replay_respects_consumer_backpressure_policy() {
        let b = Broadcaster::non_blocking_replay(8, 3, BroadcasterConfig::default()).unwrap();
        for v in 1..=3 {
            b.submit_blocking(v).await.unwrap();
        }
        wait_for_dispatched(&b, 3).await;

        // One-slot channel with a disconnect policy: the second replayed
        // value refuses and removes the consumer mid-replay. Registration
        // itself still succeeds.
        let (tx, mut rx) = mpsc::channel(1);
        b.register_with(tx, ConsumerConfig::new().disconnect_on_backpressure())
            .await
            .unwrap();

        assert_eq!(b.stats().await.unwrap().consumers, 0);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let b = Broadcaster::non_blocking(4, BroadcasterConfig::default()).unwrap();
        let (tx, _rx) = mpsc::channel::<u32>(4);

        b.register(tx.clone()).await.unwrap();
        assert_eq!(
            b.register(tx.clone()).await,
            Err(BroadcastError::AlreadyRegistered)
        );
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_unknown_channel() {
        let b = Broadcaster::non_blocking(4, BroadcasterConfig::default()).unwrap();
        let (tx, _rx) = mpsc::channel::<u32>(4);

        assert_eq!(b.unregister(&tx).await, Err(BroadcastError::NotRegistered));
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_is_final() {
        let b = Broadcaster::non_blocking(4, BroadcasterConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        b.register(tx.clone()).await.unwrap();
        b.submit_blocking(1).await.unwrap();
        assert_eq!(rx.recv().await, Some(1));

        b.unregister(&tx).await.unwrap();
        b.submit_blocking(2).await.unwrap();
        wait_for_dispatched(&b, 2).await;

        // The registry's sender is gone; dropping ours closes the channel.
        drop(tx);
        assert_eq!(rx.recv().await, None);
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_on_backpressure_removes_consumer() {
        let b = Broadcaster::non_blocking(4, BroadcasterConfig::default()).unwrap();
        let (hits_tx, mut hits_rx) = mpsc::unbounded_channel();

        let (tx, mut rx) = mpsc::channel(1);
        b.register_with(
            tx,
            ConsumerConfig::new()
                .on_backpressure(move |v: &u32| {
                    let _ = hits_tx.send(*v);
                })
                .disconnect_on_backpressure(),
        )
        .await
        .unwrap();

        b.submit_blocking(1).await.unwrap(); // fills the one-slot channel
        b.submit_blocking(2).await.unwrap(); // refused; consumer removed
        assert_eq!(hits_rx.recv().await, Some(2));

        wait_for_dispatched(&b, 2).await;
        assert_eq!(b.stats().await.unwrap().consumers, 0);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_post_broadcast_invoked_per_value() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let config = BroadcasterConfig::new().post_broadcast(move |v: &u32| {
            let _ = seen_tx.send(*v);
        });
        let b = Broadcaster::non_blocking(4, config).unwrap();

        // No consumers at all: the hook still fires once per value.
        for v in [1, 2, 3] {
            b.submit_blocking(v).await.unwrap();
        }
        assert_eq!(seen_rx.recv().await, Some(1));
        assert_eq!(seen_rx.recv().await, Some(2));
        assert_eq!(seen_rx.recv().await, Some(3));

        b.close().await.unwrap();
        assert_eq!(seen_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_backpressure_hook_panic_does_not_kill_dispatcher() {
        let b = Broadcaster::non_blocking(4, BroadcasterConfig::default()).unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        b.register_with(
            tx,
            ConsumerConfig::new().on_backpressure(|_: &u32| panic!("hook bug")),
        )
        .await
        .unwrap();

        b.submit_blocking(1).await.unwrap();
        b.submit_blocking(2).await.unwrap(); // triggers the panicking hook
        wait_for_dispatched(&b, 2).await;

        // The loop survived: a healthy consumer still gets service.
        let (tx2, mut rx2) = mpsc::channel(4);
        b.register(tx2).await.unwrap();
        b.submit_blocking(3).await.unwrap();
        assert_eq!(rx2.recv().await, Some(3));
        assert_eq!(rx.recv().await, Some(1));
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_closes_consumers() {
        let b = Broadcaster::non_blocking(4, BroadcasterConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::channel::<u32>(4);
        b.register(tx).await.unwrap();

        b.close().await.unwrap();
        assert_eq!(rx.recv().await, None);
        assert_eq!(b.close().await, Ok(()));

        assert_eq!(b.submit_blocking(1).await, Err(BroadcastError::Closed));
        assert_eq!(b.submit_non_blocking(2), Err(BroadcastError::Closed));

        let (tx2, _rx2) = mpsc::channel::<u32>(4);
        assert_eq!(b.register(tx2).await, Err(BroadcastError::Closed));
        assert_eq!(b.stats().await, Err(BroadcastError::Closed));
    }

    #[tokio::test]
    async fn test_close_on_clone_closes_all_handles() {
        let b = Broadcaster::non_blocking(4, BroadcasterConfig::default()).unwrap();
        let other = b.clone();

        other.close().await.unwrap();
        assert_eq!(b.submit_blocking(1).await, Err(BroadcastError::Closed));
        assert_eq!(b.close().await, Ok(()));
    }

    #[tokio::test]
    async fn test_ttl_zero_is_invalid_config() {
        let result =
            Broadcaster::<u32>::non_blocking_ttl(4, Duration::ZERO, BroadcasterConfig::default());
        assert!(matches!(result, Err(BroadcastError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let b = Broadcaster::non_blocking_replay(4, 2, BroadcasterConfig::default()).unwrap();
        let (tx, _rx) = mpsc::channel::<u32>(8);
        b.register(tx).await.unwrap();

        for v in [1, 2, 3] {
            b.submit_blocking(v).await.unwrap();
        }
        wait_for_dispatched(&b, 3).await;

        let stats = b.stats().await.unwrap();
        assert_eq!(stats.consumers, 1);
        assert_eq!(stats.history_values, 2);
        assert_eq!(stats.values_dispatched, 3);
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fanout_preserves_submission_order() {
        let b = Broadcaster::non_blocking(8, BroadcasterConfig::default()).unwrap();

        let (tx_a, mut rx_a) = mpsc::channel(32);
        let (tx_b, mut rx_b) = mpsc::channel(32);
        b.register(tx_a).await.unwrap();
        b.register(tx_b).await.unwrap();

        for v in 0..16u32 {
            b.submit_blocking(v).await.unwrap();
        }

        for v in 0..16u32 {
            assert_eq!(rx_a.recv().await, Some(v));
            assert_eq!(rx_b.recv().await, Some(v));
        }
        b.close().await.unwrap();
    }
}
