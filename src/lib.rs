//! fanmux: in-process fan-out broadcasting for Tokio
//!
//! A [`Broadcaster`] accepts values from any number of producer tasks and
//! delivers each value to every registered consumer channel, without ever
//! blocking on a slow consumer. Three variants differ only in how much
//! history a late joiner receives:
//!
//! - [`Broadcaster::non_blocking`]: no history, late joiners see only
//!   future values
//! - [`Broadcaster::non_blocking_replay`]: the last N values are replayed
//!   on registration
//! - [`Broadcaster::non_blocking_ttl`]: values submitted within the last
//!   D of wall-clock time are replayed on registration
//!
//! # Architecture
//!
//! ```text
//!  [Producer]──submit──┐                        ┌──► mpsc::Sender ──► [Consumer]
//!  [Producer]──submit──┤    ┌──────────────┐    ├──► mpsc::Sender ──► [Consumer]
//!                      ├───►│  dispatcher  │────┤
//!  register/unregister─┤    │  (one task)  │    └──► mpsc::Sender ──► [Consumer]
//!  close/stats─────────┘    │  consumers   │
//!                           │  history     │
//!                           └──────────────┘
//! ```
//!
//! A single dispatcher task owns the consumer set and the history buffer.
//! Producers and registrations talk to it over channels, so the hot path
//! needs no locks; registration, unregistration, and fan-out are serialised
//! by construction.
//!
//! Delivery to each consumer is a non-blocking `try_send`. When a consumer's
//! channel is full the value is dropped for that consumer only, its
//! `on_backpressure` hook fires, and, if the consumer opted in with
//! [`ConsumerConfig::disconnect_on_backpressure`], the consumer is removed.
//!
//! # Example
//!
//! ```no_run
//! use fanmux::{Broadcaster, BroadcasterConfig};
//!
//! # async fn run() -> fanmux::Result<()> {
//! let b = Broadcaster::non_blocking_replay(16, 3, BroadcasterConfig::default())?;
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel::<u32>(8);
//! b.register(tx).await?;
//!
//! b.submit_blocking(1).await?;
//! assert_eq!(rx.recv().await, Some(1));
//!
//! b.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod event;

pub use broadcast::{
    Broadcaster, BroadcasterConfig, BroadcasterStats, BroadcastError, ConsumerConfig, Result,
    ValueCallback,
};
pub use event::{Event, EventMetadata};
