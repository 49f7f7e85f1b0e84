//! Relay decision procedure.
//!
//! For every inbound envelope, in order:
//!   1. malformed (id mismatch, zero TTL)      → drop
//!   2. already seen inside the window         → drop (duplicate)
//!   3. this node already in `visited_hops`    → drop (loop)
//!   4. original sender over its rate budget   → drop (rate limited)
//!   5. addressed to this node                 → deliver locally
//!   6. no transmissions left (`ttl <= 1`)     → drop (TTL expired)
//!   7. otherwise                              → forward to the chosen next hops
//!
//! Step 2 records the id, so every later step runs at most once per message.
//! A rate-limited id is released again, so a copy resent once the sender is
//! back under budget is not mistaken for a duplicate.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use pak_proto::{ProtoError, RelayEnvelope};

use crate::{
    config::RelaySettings,
    error::MeshError,
    relay::{rate_limit::RateLimiter, seen::SeenCache, RelayStats, RelayStatsSnapshot},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Duplicate,
    LoopDetected,
    RateLimited,
    TtlExpired,
    Malformed,
    QueueFull,
}

impl DropReason {
    /// The error a drop of `envelope` for this reason corresponds to.
    pub fn to_error(self, envelope: &RelayEnvelope) -> MeshError {
        match self {
            DropReason::Duplicate => MeshError::DuplicateMessage(envelope.message_id.clone()),
            DropReason::LoopDetected => MeshError::LoopDetected,
            DropReason::RateLimited => MeshError::RateLimited(envelope.original_sender.clone()),
            DropReason::TtlExpired => MeshError::TtlExpired,
            DropReason::Malformed => MeshError::Proto(ProtoError::MessageIdMismatch),
            DropReason::QueueFull => MeshError::QueueFull(envelope.final_recipient.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDecision {
    DeliverLocally,
    /// Next hops to queue the forwarded copy for. When no neighbour is
    /// suitable this is the final recipient itself (store-and-forward).
    Forward(Vec<String>),
    Drop(DropReason),
}

pub struct RelayEngine {
    local_id: String,
    seen: SeenCache,
    limiter: Mutex<RateLimiter>,
    stats: RelayStats,
}

impl RelayEngine {
    pub fn new(local_id: impl Into<String>, settings: &RelaySettings) -> Self {
        Self {
            local_id: local_id.into(),
            seen: SeenCache::new(Duration::seconds(settings.duplicate_window_secs as i64)),
            limiter: Mutex::new(RateLimiter::new(
                settings.rate_limit_messages,
                Duration::seconds(settings.rate_limit_window_secs as i64),
            )),
            stats: RelayStats::default(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn seen(&self) -> &SeenCache {
        &self.seen
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn snapshot(&self, queue_depth: usize) -> RelayStatsSnapshot {
        self.stats.snapshot(queue_depth)
    }

    /// Mark an envelope we originate as seen so echoes are suppressed.
    pub fn note_originated(&self, envelope: &RelayEnvelope, now: DateTime<Utc>) {
        self.seen.check_and_insert(&envelope.message_id, now);
    }

    pub fn on_message_received(
        &self,
        envelope: &RelayEnvelope,
        previous_hop: Option<&str>,
        neighbours: &[String],
    ) -> RelayDecision {
        self.on_message_received_at(envelope, previous_hop, neighbours, Utc::now())
    }

    pub fn on_message_received_at(
        &self,
        envelope: &RelayEnvelope,
        previous_hop: Option<&str>,
        neighbours: &[String],
        now: DateTime<Utc>,
    ) -> RelayDecision {
        let decision = self.decide(envelope, previous_hop, neighbours, now);
        match &decision {
            RelayDecision::DeliverLocally => self.stats.record_delivered(),
            RelayDecision::Forward(_) => self.stats.record_forwarded(),
            RelayDecision::Drop(reason) => {
                tracing::debug!(
                    message_id = %envelope.message_id,
                    sender = %envelope.original_sender,
                    error = %reason.to_error(envelope),
                    "relay drop"
                );
                self.stats.record_drop(*reason);
            }
        }
        decision
    }

    fn decide(
        &self,
        envelope: &RelayEnvelope,
        previous_hop: Option<&str>,
        neighbours: &[String],
        now: DateTime<Utc>,
    ) -> RelayDecision {
        if envelope.ttl == 0 || envelope.verify_id().is_err() {
            return RelayDecision::Drop(DropReason::Malformed);
        }
        if !self.seen.check_and_insert(&envelope.message_id, now) {
            return RelayDecision::Drop(DropReason::Duplicate);
        }
        if envelope.has_visited(&self.local_id) {
            return RelayDecision::Drop(DropReason::LoopDetected);
        }
        if !self.limiter.lock().check(&envelope.original_sender, now) {
            self.seen.forget(&envelope.message_id);
            return RelayDecision::Drop(DropReason::RateLimited);
        }
        if envelope.final_recipient == self.local_id {
            return RelayDecision::DeliverLocally;
        }
        if envelope.ttl <= 1 {
            return RelayDecision::Drop(DropReason::TtlExpired);
        }
        RelayDecision::Forward(self.next_hops(envelope, previous_hop, neighbours))
    }

    /// Where a copy of `envelope` should go next.
    pub fn next_hops(
        &self,
        envelope: &RelayEnvelope,
        previous_hop: Option<&str>,
        neighbours: &[String],
    ) -> Vec<String> {
        if neighbours.iter().any(|n| *n == envelope.final_recipient) {
            return vec![envelope.final_recipient.clone()];
        }
        let hops: Vec<String> = neighbours
            .iter()
            .filter(|n| !envelope.has_visited(n))
            .filter(|n| Some(n.as_str()) != previous_hop)
            .filter(|n| **n != self.local_id)
            .cloned()
            .collect();
        if hops.is_empty() {
            vec![envelope.final_recipient.clone()]
        } else {
            hops
        }
    }

    /// Periodic housekeeping; returns the number of seen ids evicted.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        self.limiter.lock().sweep(now);
        self.seen.evict_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(local: &str) -> RelayEngine {
        RelayEngine::new(local, &RelaySettings::default())
    }

    fn neighbours(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn delivers_to_final_recipient() {
        let c = engine("c");
        let env = RelayEnvelope::new("a", "c", b"hi", 3, Utc::now()).forwarded_by("b");
        assert_eq!(
            c.on_message_received(&env, Some("b"), &neighbours(&["b"])),
            RelayDecision::DeliverLocally
        );
        assert_eq!(c.snapshot(0).delivered, 1);
    }

    #[test]
    fn duplicate_is_dropped_once_seen() {
        let b = engine("b");
        let env = RelayEnvelope::new("a", "c", b"hi", 3, Utc::now());
        let n = neighbours(&["a", "c"]);
        assert_eq!(b.on_message_received(&env, Some("a"), &n), RelayDecision::Forward(vec!["c".into()]));
        assert_eq!(
            b.on_message_received(&env, Some("a"), &n),
            RelayDecision::Drop(DropReason::Duplicate)
        );
        let stats = b.snapshot(0);
        assert_eq!((stats.forwarded, stats.dropped_duplicate), (1, 1));
    }

    #[test]
    fn loop_is_detected_after_cache_eviction() {
        let b = engine("b");
        let env = RelayEnvelope::new("a", "z", b"x", 3, Utc::now()).forwarded_by("b");
        assert_eq!(
            b.on_message_received(&env, Some("c"), &neighbours(&["c"])),
            RelayDecision::Drop(DropReason::LoopDetected)
        );
    }

    #[test]
    fn last_transmission_is_not_forwarded() {
        let b = engine("b");
        let env = RelayEnvelope::new("a", "z", b"x", 1, Utc::now());
        assert_eq!(
            b.on_message_received(&env, Some("a"), &neighbours(&["a", "c"])),
            RelayDecision::Drop(DropReason::TtlExpired)
        );
    }

    #[test]
    fn last_transmission_still_delivers_locally() {
        let c = engine("c");
        let env = RelayEnvelope::new("a", "c", b"x", 1, Utc::now());
        assert_eq!(c.on_message_received(&env, None, &[]), RelayDecision::DeliverLocally);
    }

    #[test]
    fn tampered_envelope_is_malformed() {
        let b = engine("b");
        let mut env = RelayEnvelope::new("a", "c", b"x", 3, Utc::now());
        env.original_sender = "mallory".into();
        assert_eq!(
            b.on_message_received(&env, None, &[]),
            RelayDecision::Drop(DropReason::Malformed)
        );
    }

    #[test]
    fn rate_limit_applies_per_original_sender() {
        let settings = RelaySettings {
            rate_limit_messages: 2,
            ..RelaySettings::default()
        };
        let b = RelayEngine::new("b", &settings);
        let now = Utc::now();
        let n = neighbours(&["c"]);
        for i in 0..2 {
            let env = RelayEnvelope::new("a", "c", format!("m{i}").as_bytes(), 3, now);
            assert!(matches!(b.on_message_received_at(&env, None, &n, now), RelayDecision::Forward(_)));
        }
        let env = RelayEnvelope::new("a", "c", b"m2", 3, now);
        assert_eq!(
            b.on_message_received_at(&env, None, &n, now),
            RelayDecision::Drop(DropReason::RateLimited)
        );
        let other = RelayEnvelope::new("d", "c", b"m2", 3, now);
        assert!(matches!(b.on_message_received_at(&other, None, &n, now), RelayDecision::Forward(_)));
    }

    #[test]
    fn rate_limited_copy_is_admitted_once_the_window_clears() {
        let settings = RelaySettings {
            rate_limit_messages: 1,
            rate_limit_window_secs: 60,
            ..RelaySettings::default()
        };
        let b = RelayEngine::new("b", &settings);
        let now = Utc::now();
        let n = neighbours(&["c"]);
        let first = RelayEnvelope::new("a", "c", b"m0", 3, now);
        assert!(matches!(b.on_message_received_at(&first, None, &n, now), RelayDecision::Forward(_)));

        let env = RelayEnvelope::new("a", "c", b"m1", 3, now);
        assert_eq!(
            b.on_message_received_at(&env, None, &n, now),
            RelayDecision::Drop(DropReason::RateLimited)
        );
        assert!(!b.seen().contains(&env.message_id, now));

        let later = now + Duration::seconds(61);
        assert_eq!(
            b.on_message_received_at(&env, None, &n, later),
            RelayDecision::Forward(vec!["c".into()])
        );
        assert_eq!(
            b.on_message_received_at(&env, None, &n, later),
            RelayDecision::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn floods_unvisited_neighbours_or_stores_for_recipient() {
        let b = engine("b");
        let env = RelayEnvelope::new("a", "z", b"x", 3, Utc::now());
        assert_eq!(
            b.on_message_received(&env, Some("a"), &neighbours(&["a", "c", "d"])),
            RelayDecision::Forward(vec!["c".into(), "d".into()])
        );

        let env = RelayEnvelope::new("a", "z", b"y", 3, Utc::now());
        assert_eq!(
            b.on_message_received(&env, Some("a"), &neighbours(&["a"])),
            RelayDecision::Forward(vec!["z".into()])
        );
    }
}
