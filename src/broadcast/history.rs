//! History buffer for late-joiner replay
//!
//! When a consumer registers against a replay or TTL broadcaster, it first
//! receives a snapshot of the retained values in submission order, then
//! live values. The buffer is owned by the dispatcher and mutated only
//! between dispatches, so it needs no synchronisation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Bounded or time-indexed cache of recently broadcast values
pub(crate) enum HistoryBuffer<T> {
    /// Retains nothing; late joiners see only live values
    Disabled,
    /// Retains the last `cap` values, oldest first
    Count { cap: usize, values: VecDeque<T> },
    /// Retains values whose expiry instant is still in the future
    Ttl {
        ttl: Duration,
        values: VecDeque<(Instant, T)>,
    },
}

impl<T: Clone> HistoryBuffer<T> {
    pub(crate) fn disabled() -> Self {
        HistoryBuffer::Disabled
    }

    pub(crate) fn count(cap: usize) -> Self {
        HistoryBuffer::Count {
            cap,
            values: VecDeque::with_capacity(cap),
        }
    }

    pub(crate) fn ttl(ttl: Duration) -> Self {
        HistoryBuffer::Ttl {
            ttl,
            values: VecDeque::new(),
        }
    }

    /// Record a broadcast value, evicting whatever no longer belongs.
    ///
    /// For the count variant the front is popped until the buffer fits its
    /// capacity again; a capacity of zero records nothing. For the TTL
    /// variant, leading entries whose expiry has passed are purged.
    pub(crate) fn record(&mut self, value: &T, now: Instant) {
        match self {
            HistoryBuffer::Disabled => {}
            HistoryBuffer::Count { cap, values } => {
                if *cap == 0 {
                    return;
                }
                values.push_back(value.clone());
                while values.len() > *cap {
                    values.pop_front();
                }
            }
            HistoryBuffer::Ttl { ttl, values } => {
                values.push_back((now + *ttl, value.clone()));
                Self::purge_front(values, now);
            }
        }
    }

    /// Snapshot the surviving values for a late joiner, oldest first.
    ///
    /// Expired TTL entries are purged before the snapshot is taken, so a
    /// value is never replayed past its lifetime.
    pub(crate) fn replay(&mut self, now: Instant) -> Vec<T> {
        match self {
            HistoryBuffer::Disabled => Vec::new(),
            HistoryBuffer::Count { values, .. } => values.iter().cloned().collect(),
            HistoryBuffer::Ttl { values, .. } => {
                Self::purge_front(values, now);
                values.iter().map(|(_, v)| v.clone()).collect()
            }
        }
    }

    /// Number of currently retained values
    pub(crate) fn len(&self) -> usize {
        match self {
            HistoryBuffer::Disabled => 0,
            HistoryBuffer::Count { values, .. } => values.len(),
            HistoryBuffer::Ttl { values, .. } => values.len(),
        }
    }

    // Entries are ordered by submission and the ttl is constant, so expiry
    // instants are monotonic and purging stops at the first survivor.
    fn purge_front(values: &mut VecDeque<(Instant, T)>, now: Instant) {
        while let Some((expires_at, _)) = values.front() {
            if *expires_at > now {
                break;
            }
            values.pop_front();
        }
    }
}
