//! Bus counters. Updating them never affects delivery.

use super::intern::TopicId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the bus counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImcStats {
    /// Successful `publish`/`publish_buffer` calls.
    pub published: u64,
    /// Handler invocations started by `pump`.
    pub delivered: u64,
    /// Messages discarded by drop-oldest or drop-newest.
    pub dropped: u64,
    /// Messages refused by a priority floor or filter.
    pub filtered: u64,
    /// Enqueues rejected with `QueueFull` or `WouldBlock`.
    pub rejected: u64,
    pub rpc_calls: u64,
    pub rpc_completed: u64,
    pub rpc_failed: u64,
    pub active_subscriptions: u64,
    pub registered_rpcs: u64,
}

#[derive(Default)]
pub(crate) struct BusCounters {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub filtered: AtomicU64,
    pub rejected: AtomicU64,
    pub rpc_calls: AtomicU64,
    pub rpc_completed: AtomicU64,
    pub rpc_failed: AtomicU64,
    per_topic: Mutex<HashMap<TopicId, u64>>,
}

impl BusCounters {
    pub fn add(counter: &AtomicU64, amount: u64) {
        if amount > 0 {
            counter.fetch_add(amount, Ordering::Relaxed);
        }
    }

    pub fn record_topic(&self, topic: TopicId) {
        *self.per_topic.lock().entry(topic).or_insert(0) += 1;
    }

    pub fn topic_count(&self, topic: TopicId) -> u64 {
        self.per_topic.lock().get(&topic).copied().unwrap_or(0)
    }

    pub fn snapshot(&self, active_subscriptions: u64, registered_rpcs: u64) -> ImcStats {
        ImcStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            rpc_calls: self.rpc_calls.load(Ordering::Relaxed),
            rpc_completed: self.rpc_completed.load(Ordering::Relaxed),
            rpc_failed: self.rpc_failed.load(Ordering::Relaxed),
            active_subscriptions,
            registered_rpcs,
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.published,
            &self.delivered,
            &self.dropped,
            &self.filtered,
            &self.rejected,
            &self.rpc_calls,
            &self.rpc_completed,
            &self.rpc_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.per_topic.lock().clear();
    }
}
