//! Fan-out broadcaster example with a fast and a slow consumer
//!
//! Run with: cargo run --example fanout
//!
//! A producer submits twenty events at a steady pace. The fast consumer
//! drains continuously and sees every event; the slow consumer stops
//! reading after five and triggers its backpressure hook for the rest.
//! A late joiner registers halfway through and catches up from the
//! replay buffer before receiving live events.
//!
//! Set RUST_LOG=fanmux=debug to watch the dispatcher's view of it.

use std::time::{Duration, SystemTime};

use fanmux::{Broadcaster, BroadcasterConfig, ConsumerConfig, Event};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fanmux=debug".parse()?),
        )
        .init();

    // Replay the last five events to anyone who joins late; count every
    // event once it has been offered to the whole audience.
    let config = BroadcasterConfig::new()
        .post_broadcast(|event: &Event| {
            tracing::debug!(seq = ?event.metadata.stream_seq(), "event broadcast complete");
        });
    let broadcaster = Broadcaster::non_blocking_replay(16, 5, config)?;

    // Fast consumer: drains as quickly as values arrive.
    let (fast_tx, mut fast_rx) = mpsc::channel::<Event>(4);
    tokio::spawn(async move {
        while let Some(event) = fast_rx.recv().await {
            println!(
                "[fast]  seq={:?} value={:?}",
                event.metadata.stream_seq(),
                event.value
            );
        }
        println!("[fast]  channel closed");
    });
    broadcaster.register(fast_tx).await?;

    // Slow consumer: reads five events, then stalls. Its hook reports every
    // event it misses.
    let (slow_tx, mut slow_rx) = mpsc::channel::<Event>(1);
    tokio::spawn(async move {
        for _ in 0..5 {
            if let Some(event) = slow_rx.recv().await {
                println!(
                    "[slow]  seq={:?} value={:?}",
                    event.metadata.stream_seq(),
                    event.value
                );
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        std::future::pending::<()>().await;
    });
    broadcaster
        .register_with(
            slow_tx,
            ConsumerConfig::new().on_backpressure(|event: &Event| {
                println!(
                    "[slow]  missed seq={:?} (channel full)",
                    event.metadata.stream_seq()
                );
            }),
        )
        .await?;

    // Producer: twenty events, 20ms apart, with a late joiner at the
    // halfway mark.
    for seq in 0..20u64 {
        let mut event = Event::from_value(format!("reading-{seq}"));
        event.metadata.set_stream_seq(seq);
        event.metadata.set_stream_time(SystemTime::now());
        broadcaster.submit_blocking(event).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;

        if seq == 9 {
            let (late_tx, mut late_rx) = mpsc::channel::<Event>(8);
            tokio::spawn(async move {
                while let Some(event) = late_rx.recv().await {
                    println!(
                        "[late]  seq={:?} value={:?}",
                        event.metadata.stream_seq(),
                        event.value
                    );
                }
                println!("[late]  channel closed");
            });
            broadcaster.register(late_tx).await?;
            println!("[main]  late consumer joined, caught up from replay");
        }
    }

    let stats = broadcaster.stats().await?;
    println!(
        "[main]  dispatched={} consumers={} replay_buffer={}",
        stats.values_dispatched, stats.consumers, stats.history_values
    );

    broadcaster.close().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
