//! Offline queue.
//!
//! One bounded queue per next-hop peer. Every copy of a relay envelope that
//! still has to leave this node lives here until the peer acks it or the
//! retry budget runs out. The peer table lock is only held to find or create
//! a peer's queue; each peer's entries sit behind their own mutex, so work on
//! one peer never waits on another. Store writes happen after the locks are
//! released.

pub mod backoff;
pub mod sync;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};

use pak_crypto::hash;
use pak_proto::QueueDigest;
use pak_store::{Priority, QueueStatus, QueueStore, QueuedMessage};

use crate::{
    config::QueueSettings,
    error::MeshError,
    events::{EventBus, MeshEvent},
};

pub use backoff::Backoff;

#[derive(Default)]
struct PeerQueue {
    favorite: bool,
    /// Set once the entries moved to another key; holders of a stale handle
    /// must look the peer up again.
    retired: bool,
    entries: Vec<QueuedMessage>,
}

impl PeerQueue {
    fn position(&self, message_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.message_id == message_id)
    }

    /// Lowest priority, oldest among equals.
    fn eviction_candidate(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.priority, e.enqueued_at))
            .map(|(i, _)| i)
    }
}

/// What a queue mutation needs persisted once the locks are dropped.
enum StoreOp {
    Save(QueuedMessage),
    Remove { message_id: String, peer_key: String },
}

pub struct OfflineQueue {
    settings: QueueSettings,
    max_relay: usize,
    backoff: Backoff,
    peers: RwLock<HashMap<String, Arc<Mutex<PeerQueue>>>>,
    relay_count: AtomicUsize,
    store: Arc<dyn QueueStore>,
    events: EventBus,
}

impl OfflineQueue {
    pub fn new(
        settings: QueueSettings,
        max_relay: usize,
        store: Arc<dyn QueueStore>,
        events: EventBus,
    ) -> Self {
        Self {
            backoff: Backoff::from_settings(&settings),
            settings,
            max_relay,
            peers: RwLock::new(HashMap::new()),
            relay_count: AtomicUsize::new(0),
            store,
            events,
        }
    }

    fn peer(&self, peer_key: &str) -> Arc<Mutex<PeerQueue>> {
        if let Some(q) = self.peers.read().get(peer_key) {
            return Arc::clone(q);
        }
        Arc::clone(self.peers.write().entry(peer_key.to_owned()).or_default())
    }

    fn existing_peer(&self, peer_key: &str) -> Option<Arc<Mutex<PeerQueue>>> {
        self.peers.read().get(peer_key).cloned()
    }

    fn all_peers(&self) -> Vec<(String, Arc<Mutex<PeerQueue>>)> {
        self.peers
            .read()
            .iter()
            .map(|(k, q)| (k.clone(), Arc::clone(q)))
            .collect()
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), MeshError> {
        for op in ops {
            match op {
                StoreOp::Save(msg) => self.store.save_queued(&msg).await?,
                StoreOp::Remove { message_id, peer_key } => {
                    self.store.remove_queued(&message_id, &peer_key).await?;
                }
            }
        }
        Ok(())
    }

    fn capacity(&self, favorite: bool) -> usize {
        if favorite {
            self.settings.favorite_capacity
        } else {
            self.settings.per_peer_capacity
        }
    }

    /// Claim one of the global relay slots, or report that none are left.
    fn reserve_relay_slot(&self) -> bool {
        self.relay_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_relay).then_some(n + 1)
            })
            .is_ok()
    }

    fn forget(&self, entry: &QueuedMessage) -> StoreOp {
        if entry.relayed {
            self.relay_count.fetch_sub(1, Ordering::Relaxed);
        }
        StoreOp::Remove {
            message_id: entry.message_id.clone(),
            peer_key: entry.peer_key.clone(),
        }
    }

    pub async fn enqueue(
        &self,
        peer_key: &str,
        message_id: &str,
        payload: Vec<u8>,
        priority: Priority,
        relayed: bool,
    ) -> Result<(), MeshError> {
        self.enqueue_at(peer_key, message_id, payload, priority, relayed, Utc::now())
            .await
    }

    /// Queue one copy of `message_id` for `peer_key`.
    ///
    /// Re-queuing an id already waiting for the same peer is a no-op. A full
    /// queue makes room by evicting its lowest-priority, oldest entry when
    /// that entry does not outrank the newcomer; otherwise `QueueFull`.
    pub async fn enqueue_at(
        &self,
        peer_key: &str,
        message_id: &str,
        payload: Vec<u8>,
        priority: Priority,
        relayed: bool,
        now: DateTime<Utc>,
    ) -> Result<(), MeshError> {
        let mut ops = Vec::new();
        let mut evicted = None;
        loop {
            let queue = self.peer(peer_key);
            let mut q = queue.lock();
            if q.retired {
                continue;
            }
            if q.position(message_id).is_some() {
                return Ok(());
            }
            let victim = if q.entries.len() >= self.capacity(q.favorite) {
                let idx = q
                    .eviction_candidate()
                    .ok_or_else(|| MeshError::QueueFull(peer_key.to_owned()))?;
                if q.entries[idx].priority > priority {
                    return Err(MeshError::QueueFull(peer_key.to_owned()));
                }
                Some(idx)
            } else {
                None
            };
            if relayed && !self.reserve_relay_slot() {
                return Err(MeshError::QueueFull(peer_key.to_owned()));
            }
            if let Some(idx) = victim {
                let victim = q.entries.remove(idx);
                ops.push(self.forget(&victim));
                evicted = Some(victim);
            }
            let entry = QueuedMessage {
                message_id: message_id.to_owned(),
                peer_key: peer_key.to_owned(),
                payload,
                priority,
                status: QueueStatus::Pending,
                attempts: 0,
                relayed,
                enqueued_at: now,
                next_attempt_at: now,
                ack_deadline: None,
            };
            ops.push(StoreOp::Save(entry.clone()));
            q.entries.push(entry);
            break;
        }

        if let Some(victim) = evicted {
            tracing::info!(
                peer = %peer_key,
                evicted = %victim.message_id,
                admitted = %message_id,
                "queue full, evicted entry"
            );
            self.events.emit(MeshEvent::MessageEvicted {
                message_id: victim.message_id,
                peer_key: victim.peer_key,
            });
        }
        self.apply(ops).await
    }

    pub fn set_favorite(&self, peer_key: &str, favorite: bool) {
        self.peer(peer_key).lock().favorite = favorite;
    }

    pub fn is_favorite(&self, peer_key: &str) -> bool {
        self.existing_peer(peer_key)
            .map(|q| q.lock().favorite)
            .unwrap_or(false)
    }

    /// Everything waiting for `peer_key` that is not already in flight,
    /// regardless of backoff. Entries are marked `Sending`.
    pub fn on_peer_connected(&self, peer_key: &str) -> Vec<QueuedMessage> {
        let Some(queue) = self.existing_peer(peer_key) else {
            return Vec::new();
        };
        let mut q = queue.lock();
        let mut out = Vec::new();
        for entry in q.entries.iter_mut() {
            if matches!(entry.status, QueueStatus::Pending | QueueStatus::Retrying) {
                entry.status = QueueStatus::Sending;
                out.push(entry.clone());
            }
        }
        out.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));
        out
    }

    /// Entries for connected peers whose retry time has come. Marked `Sending`.
    pub fn due_at(&self, now: DateTime<Utc>, connected: &HashSet<String>) -> Vec<QueuedMessage> {
        let mut out = Vec::new();
        for (key, queue) in self.all_peers() {
            if !connected.contains(&key) {
                continue;
            }
            let mut q = queue.lock();
            for entry in q.entries.iter_mut() {
                if matches!(entry.status, QueueStatus::Pending | QueueStatus::Retrying)
                    && entry.next_attempt_at <= now
                {
                    entry.status = QueueStatus::Sending;
                    out.push(entry.clone());
                }
            }
        }
        out.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));
        out
    }

    /// The transport accepted the packet; wait for the ack.
    pub async fn mark_sent_at(
        &self,
        message_id: &str,
        peer_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), MeshError> {
        let Some(queue) = self.existing_peer(peer_key) else {
            return Ok(());
        };
        let saved = {
            let mut q = queue.lock();
            let Some(idx) = q.position(message_id) else {
                return Ok(());
            };
            let entry = &mut q.entries[idx];
            entry.attempts = entry.attempts.saturating_add(1);
            entry.status = QueueStatus::AwaitingAck;
            entry.ack_deadline = Some(now + Duration::milliseconds(self.settings.ack_timeout_ms as i64));
            entry.clone()
        };
        self.apply(vec![StoreOp::Save(saved)]).await
    }

    /// Put an entry taken for sending back without spending an attempt
    /// (the session needed a fresh handshake before it could be encrypted).
    pub async fn release(&self, message_id: &str, peer_key: &str) -> Result<(), MeshError> {
        let Some(queue) = self.existing_peer(peer_key) else {
            return Ok(());
        };
        let saved = {
            let mut q = queue.lock();
            let Some(idx) = q.position(message_id) else {
                return Ok(());
            };
            let entry = &mut q.entries[idx];
            entry.status = QueueStatus::Pending;
            entry.clone()
        };
        self.apply(vec![StoreOp::Save(saved)]).await
    }

    pub async fn mark_send_failed_at(
        &self,
        message_id: &str,
        peer_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), MeshError> {
        let Some(queue) = self.existing_peer(peer_key) else {
            return Ok(());
        };
        let (ops, failed) = {
            let mut q = queue.lock();
            let Some(idx) = q.position(message_id) else {
                return Ok(());
            };
            q.entries[idx].attempts = q.entries[idx].attempts.saturating_add(1);
            self.schedule_retry(&mut q, idx, now)
        };
        self.report_failures(failed);
        self.apply(ops).await
    }

    /// Move entry `idx` to `Retrying`, or drop it as `Failed` when its
    /// attempts are spent.
    fn schedule_retry(
        &self,
        q: &mut PeerQueue,
        idx: usize,
        now: DateTime<Utc>,
    ) -> (Vec<StoreOp>, Vec<QueuedMessage>) {
        if q.entries[idx].attempts >= self.settings.max_attempts {
            let mut dead = q.entries.remove(idx);
            dead.status = QueueStatus::Failed;
            let op = self.forget(&dead);
            return (vec![op], vec![dead]);
        }
        let entry = &mut q.entries[idx];
        entry.status = QueueStatus::Retrying;
        entry.ack_deadline = None;
        entry.next_attempt_at = now + self.backoff.delay(entry.attempts);
        (vec![StoreOp::Save(entry.clone())], Vec::new())
    }

    fn report_failures(&self, failed: Vec<QueuedMessage>) {
        for dead in failed {
            let err = MeshError::DeliveryFailed {
                message_id: dead.message_id.clone(),
                attempts: dead.attempts,
            };
            tracing::warn!(peer = %dead.peer_key, error = %err, "retries exhausted");
            self.events.emit(MeshEvent::DeliveryFailed {
                message_id: dead.message_id,
                peer_key: dead.peer_key,
                attempts: dead.attempts,
            });
        }
    }

    /// Re-arm retries for entries whose ack deadline passed. Returns how many
    /// entries timed out.
    pub async fn check_ack_timeouts_at(&self, now: DateTime<Utc>) -> Result<usize, MeshError> {
        let mut ops = Vec::new();
        let mut failed = Vec::new();
        let mut timed_out = 0;
        for (_, queue) in self.all_peers() {
            let mut q = queue.lock();
            let mut idx = 0;
            while idx < q.entries.len() {
                let entry = &q.entries[idx];
                let expired = entry.status == QueueStatus::AwaitingAck
                    && entry.ack_deadline.map(|d| d <= now).unwrap_or(true);
                if !expired {
                    idx += 1;
                    continue;
                }
                timed_out += 1;
                let before = q.entries.len();
                let (mut o, mut f) = self.schedule_retry(&mut q, idx, now);
                ops.append(&mut o);
                failed.append(&mut f);
                if q.entries.len() == before {
                    idx += 1;
                }
            }
        }
        self.report_failures(failed);
        self.apply(ops).await?;
        Ok(timed_out)
    }

    /// Hop-by-hop ack: `from_peer` now holds `message_id`.
    pub async fn on_ack_received(&self, message_id: &str, from_peer: &str) -> Result<bool, MeshError> {
        let Some(queue) = self.existing_peer(from_peer) else {
            return Ok(false);
        };
        let op = {
            let mut q = queue.lock();
            let Some(idx) = q.position(message_id) else {
                return Ok(false);
            };
            let mut done = q.entries.remove(idx);
            done.status = QueueStatus::Delivered;
            self.forget(&done)
        };
        self.apply(vec![op]).await?;
        Ok(true)
    }

    /// Move every entry queued for `old_key` onto `new_key`, along with the
    /// favourite flag. The old queue is retired under the peer table lock, so
    /// no enqueue can land on it once the move starts.
    pub async fn rekey_peer(&self, old_key: &str, new_key: &str) -> Result<usize, MeshError> {
        if old_key == new_key {
            return Ok(0);
        }
        let mut count = 0;
        {
            let mut peers = self.peers.write();
            let Some(old) = peers.remove(old_key) else {
                return Ok(0);
            };
            let target = Arc::clone(peers.entry(new_key.to_owned()).or_default());
            let mut old = old.lock();
            let mut q = target.lock();
            old.retired = true;
            q.favorite |= old.favorite;
            for mut entry in std::mem::take(&mut old.entries) {
                if q.position(&entry.message_id).is_some() {
                    if entry.relayed {
                        self.relay_count.fetch_sub(1, Ordering::Relaxed);
                    }
                    continue;
                }
                entry.peer_key = new_key.to_owned();
                q.entries.push(entry);
                count += 1;
            }
        }
        self.store.rekey_queued(old_key, new_key).await?;
        Ok(count)
    }

    pub fn depth(&self, peer_key: &str) -> usize {
        self.existing_peer(peer_key)
            .map(|q| q.lock().entries.len())
            .unwrap_or(0)
    }

    pub fn total_depth(&self) -> usize {
        self.all_peers().iter().map(|(_, q)| q.lock().entries.len()).sum()
    }

    pub fn relay_depth(&self) -> usize {
        self.relay_count.load(Ordering::Relaxed)
    }

    pub fn entry(&self, message_id: &str, peer_key: &str) -> Option<QueuedMessage> {
        let queue = self.existing_peer(peer_key)?;
        let q = queue.lock();
        q.position(message_id).map(|i| q.entries[i].clone())
    }

    pub fn message_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for (_, queue) in self.all_peers() {
            ids.extend(queue.lock().entries.iter().map(|e| e.message_id.clone()));
        }
        ids
    }

    /// Compact summary of what this node is holding, for queue sync.
    pub fn digest(&self) -> QueueDigest {
        let hashes: BTreeSet<u64> = self
            .message_ids()
            .iter()
            .map(|id| hash::digest_entry(id))
            .collect();
        QueueDigest {
            hashes: hashes.into_iter().collect(),
        }
    }

    pub fn digest_set(&self) -> HashSet<u64> {
        self.message_ids()
            .iter()
            .map(|id| hash::digest_entry(id))
            .collect()
    }

    /// One stored envelope per requested digest entry.
    pub fn payloads_for(&self, hashes: &[u64]) -> Vec<Vec<u8>> {
        let wanted: HashSet<u64> = hashes.iter().copied().collect();
        let mut served = HashSet::new();
        let mut out = Vec::new();
        for (_, queue) in self.all_peers() {
            let q = queue.lock();
            for entry in &q.entries {
                let h = hash::digest_entry(&entry.message_id);
                if wanted.contains(&h) && served.insert(h) {
                    out.push(entry.payload.clone());
                }
            }
        }
        out
    }

    /// Rebuild in-memory state from the store after a restart. Entries that
    /// were mid-send go back to pending.
    pub async fn load_from_store(&self) -> Result<usize, MeshError> {
        let stored = self.store.load_queued().await?;
        let count = stored.len();
        for mut entry in stored {
            if entry.status == QueueStatus::Sending {
                entry.status = QueueStatus::Pending;
            }
            if entry.relayed {
                self.relay_count.fetch_add(1, Ordering::Relaxed);
            }
            let queue = self.peer(&entry.peer_key);
            let mut q = queue.lock();
            if q.position(&entry.message_id).is_none() {
                q.entries.push(entry);
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pak_store::MemoryStore;

    fn queue_with(settings: QueueSettings) -> (OfflineQueue, Arc<MemoryStore>, EventBus) {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let q = OfflineQueue::new(settings, 1_000, store.clone(), bus.clone());
        (q, store, bus)
    }

    fn small() -> QueueSettings {
        QueueSettings {
            per_peer_capacity: 3,
            favorite_capacity: 5,
            max_attempts: 2,
            backoff_jitter: 0.0,
            ..QueueSettings::default()
        }
    }

    #[tokio::test]
    async fn full_queue_evicts_oldest_lowest_priority() {
        let (q, _, bus) = queue_with(small());
        let mut events = bus.subscribe();
        let t0 = Utc::now();
        q.enqueue_at("p", "hi", vec![], Priority::High, false, t0).await.unwrap();
        for i in 0..2 {
            let at = t0 + Duration::seconds(i + 1);
            q.enqueue_at("p", &format!("n{i}"), vec![], Priority::Normal, false, at)
                .await
                .unwrap();
        }
        q.enqueue_at("p", "n2", vec![], Priority::Normal, false, t0 + Duration::seconds(5))
            .await
            .unwrap();

        let ids = q.message_ids();
        assert!(ids.contains("hi") && !ids.contains("n0"));
        assert_eq!(q.depth("p"), 3);
        assert_eq!(
            events.recv().await.unwrap(),
            MeshEvent::MessageEvicted { message_id: "n0".into(), peer_key: "p".into() }
        );
    }

    #[tokio::test]
    async fn lower_priority_is_rejected_when_full() {
        let (q, _, _) = queue_with(small());
        for i in 0..3 {
            q.enqueue("p", &format!("h{i}"), vec![], Priority::High, false).await.unwrap();
        }
        let err = q.enqueue("p", "low", vec![], Priority::Low, false).await.unwrap_err();
        assert!(matches!(err, MeshError::QueueFull(_)));
    }

    #[tokio::test]
    async fn favorites_get_the_higher_ceiling() {
        let (q, _, _) = queue_with(small());
        q.set_favorite("fav", true);
        for i in 0..5 {
            q.enqueue("fav", &format!("m{i}"), vec![], Priority::Normal, false).await.unwrap();
        }
        assert_eq!(q.depth("fav"), 5);
    }

    #[tokio::test]
    async fn relay_bound_is_global() {
        let store = Arc::new(MemoryStore::new());
        let q = OfflineQueue::new(QueueSettings::default(), 2, store, EventBus::new());
        q.enqueue("a", "r1", vec![], Priority::Normal, true).await.unwrap();
        q.enqueue("b", "r2", vec![], Priority::Normal, true).await.unwrap();
        assert!(q.enqueue("c", "r3", vec![], Priority::Normal, true).await.is_err());
        q.enqueue("c", "own", vec![], Priority::Normal, false).await.unwrap();
        assert!(q.on_ack_received("r1", "a").await.unwrap());
        q.enqueue("c", "r3", vec![], Priority::Normal, true).await.unwrap();
        assert_eq!(q.relay_depth(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_relays_never_overshoot_the_bound() {
        let store = Arc::new(MemoryStore::new());
        let q = Arc::new(OfflineQueue::new(QueueSettings::default(), 5, store, EventBus::new()));
        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let q = Arc::clone(&q);
                tokio::spawn(async move {
                    q.enqueue(&format!("p{}", i % 8), &format!("r{i}"), vec![], Priority::Normal, true)
                        .await
                        .is_ok()
                })
            })
            .collect();
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
        assert_eq!(q.relay_depth(), 5);
        assert_eq!(q.total_depth(), 5);
    }

    #[tokio::test]
    async fn retries_back_off_then_fail() {
        let (q, store, bus) = queue_with(small());
        let mut events = bus.subscribe();
        let t0 = Utc::now();
        q.enqueue_at("p", "m", b"x".to_vec(), Priority::Normal, false, t0).await.unwrap();

        let connected: HashSet<String> = ["p".to_owned()].into();
        assert_eq!(q.due_at(t0, &connected).len(), 1);
        q.mark_sent_at("m", "p", t0).await.unwrap();
        assert!(q.due_at(t0, &connected).is_empty());

        // No ack within 15 s re-arms the retry with a 2 s backoff.
        let t1 = t0 + Duration::seconds(16);
        assert_eq!(q.check_ack_timeouts_at(t1).await.unwrap(), 1);
        let entry = q.entry("m", "p").unwrap();
        assert_eq!(entry.status, QueueStatus::Retrying);
        assert_eq!(entry.next_attempt_at, t1 + Duration::seconds(2));
        assert!(q.due_at(t1, &connected).is_empty());

        let t2 = t1 + Duration::seconds(2);
        assert_eq!(q.due_at(t2, &connected).len(), 1);
        q.mark_send_failed_at("m", "p", t2).await.unwrap();

        assert_eq!(q.depth("p"), 0);
        assert!(store.load_queued().await.unwrap().is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            MeshEvent::DeliveryFailed { message_id: "m".into(), peer_key: "p".into(), attempts: 2 }
        );
    }

    #[tokio::test]
    async fn peer_connect_flushes_regardless_of_backoff() {
        let (q, _, _) = queue_with(small());
        let t0 = Utc::now();
        q.enqueue_at("p", "a", vec![], Priority::Low, false, t0).await.unwrap();
        q.enqueue_at("p", "b", vec![], Priority::High, false, t0).await.unwrap();
        q.mark_send_failed_at("a", "p", t0).await.unwrap();

        let flushed: Vec<_> = q.on_peer_connected("p").into_iter().map(|e| e.message_id).collect();
        assert_eq!(flushed, vec!["b".to_owned(), "a".to_owned()]);
        assert!(q.on_peer_connected("p").is_empty());
    }

    #[tokio::test]
    async fn ack_removes_only_that_hop() {
        let (q, _, _) = queue_with(small());
        q.enqueue("b", "m", vec![], Priority::Normal, true).await.unwrap();
        q.enqueue("c", "m", vec![], Priority::Normal, true).await.unwrap();
        assert!(q.on_ack_received("m", "b").await.unwrap());
        assert!(!q.on_ack_received("m", "b").await.unwrap());
        assert_eq!(q.depth("c"), 1);
        assert_eq!(q.digest().hashes.len(), 1);
    }

    #[tokio::test]
    async fn rekey_moves_entries_and_reload_restores_them() {
        let (q, store, _) = queue_with(small());
        q.enqueue("eph", "m1", b"1".to_vec(), Priority::Normal, false).await.unwrap();
        q.enqueue("eph", "m2", b"2".to_vec(), Priority::High, false).await.unwrap();
        q.on_peer_connected("eph");
        assert_eq!(q.rekey_peer("eph", "pid").await.unwrap(), 2);
        assert_eq!((q.depth("eph"), q.depth("pid")), (0, 2));

        let reloaded = OfflineQueue::new(small(), 1_000, store, EventBus::new());
        assert_eq!(reloaded.load_from_store().await.unwrap(), 2);
        let entry = reloaded.entry("m1", "pid").unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.payload, b"1");
    }

    #[tokio::test]
    async fn promotion_keeps_the_favourite_ceiling() {
        let (q, _, _) = queue_with(small());
        q.set_favorite("eph", true);
        for i in 0..4 {
            q.enqueue("eph", &format!("m{i}"), vec![], Priority::Normal, false).await.unwrap();
        }
        assert_eq!(q.rekey_peer("eph", "pid").await.unwrap(), 4);
        assert!(q.is_favorite("pid"));
        assert!(!q.is_favorite("eph"));

        q.enqueue("pid", "m4", vec![], Priority::Normal, false).await.unwrap();
        assert_eq!(q.depth("pid"), 5);
        assert!(q.message_ids().contains("m0"));
    }

    #[tokio::test]
    async fn enqueue_after_promotion_reaches_a_live_queue() {
        let (q, _, _) = queue_with(small());
        q.enqueue("eph", "m1", vec![], Priority::Normal, false).await.unwrap();
        let stale = q.peer("eph");
        q.rekey_peer("eph", "pid").await.unwrap();
        assert!(stale.lock().retired);

        q.enqueue("eph", "m2", vec![], Priority::Normal, false).await.unwrap();
        assert_eq!((q.depth("eph"), q.depth("pid")), (1, 1));
        assert!(stale.lock().entries.is_empty());
    }
}
