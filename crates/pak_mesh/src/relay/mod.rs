//! Multi-hop relay: duplicate suppression, loop prevention, per-source rate
//! limiting, TTL enforcement and next-hop selection.

pub mod engine;
pub mod rate_limit;
pub mod seen;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub use engine::{DropReason, RelayDecision, RelayEngine};
pub use seen::SeenCache;

/// Counters since the node started.
#[derive(Debug, Default)]
pub struct RelayStats {
    delivered: AtomicU64,
    forwarded: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_loop: AtomicU64,
    dropped_rate_limited: AtomicU64,
    dropped_ttl: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_queue_full: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    pub delivered: u64,
    pub forwarded: u64,
    pub dropped_duplicate: u64,
    pub dropped_loop: u64,
    pub dropped_rate_limited: u64,
    pub dropped_ttl: u64,
    pub dropped_malformed: u64,
    pub dropped_queue_full: u64,
    /// Relay messages currently waiting in the offline queue.
    pub queue_depth: usize,
}

impl RelayStatsSnapshot {
    pub fn dropped(&self) -> u64 {
        self.dropped_duplicate
            + self.dropped_loop
            + self.dropped_rate_limited
            + self.dropped_ttl
            + self.dropped_malformed
            + self.dropped_queue_full
    }
}

impl RelayStats {
    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Duplicate => &self.dropped_duplicate,
            DropReason::LoopDetected => &self.dropped_loop,
            DropReason::RateLimited => &self.dropped_rate_limited,
            DropReason::TtlExpired => &self.dropped_ttl,
            DropReason::Malformed => &self.dropped_malformed,
            DropReason::QueueFull => &self.dropped_queue_full,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, queue_depth: usize) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            dropped_loop: self.dropped_loop.load(Ordering::Relaxed),
            dropped_rate_limited: self.dropped_rate_limited.load(Ordering::Relaxed),
            dropped_ttl: self.dropped_ttl.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            queue_depth,
        }
    }
}
