//! Change fan-out from the store to every session.
//!
//! Uses a tokio broadcast channel: one send reaches all receivers, each
//! receiver buffers up to `capacity` changes. A session that falls further
//! behind sees `Lagged` and resynchronizes its subscriptions from the store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use super::store::StoreChange;

/// Feed health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub changes_published: u64,
    /// Publishes that reached no receiver
    pub changes_unobserved: u64,
    pub active_receivers: usize,
}

/// Lock-free on the publish path; read via `stats()`.
struct AtomicFeedStats {
    published: AtomicU64,
    unobserved: AtomicU64,
}

pub struct ChangeFeed {
    sender: broadcast::Sender<Arc<StoreChange>>,
    capacity: usize,
    stats: AtomicFeedStats,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: AtomicFeedStats {
                published: AtomicU64::new(0),
                unobserved: AtomicU64::new(0),
            },
        }
    }

    /// Publish one change. Returns the number of receivers it reached.
    pub fn publish(&self, change: StoreChange) -> usize {
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Arc::new(change)) {
            Ok(count) => count,
            Err(_) => {
                self.stats.unobserved.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StoreChange>> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            changes_published: self.stats.published.load(Ordering::Relaxed),
            changes_unobserved: self.stats.unobserved.load(Ordering::Relaxed),
            active_receivers: self.sender.receiver_count(),
        }
    }
}
