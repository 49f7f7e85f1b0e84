//! Duplicate-suppression cache.
//!
//! Owned by the relay engine and passed to whoever needs it; there is no
//! process-wide instance. `check_and_insert` is the single point at which a
//! message id becomes "seen", so two concurrent arrivals of the same id
//! cannot both pass.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use pak_crypto::hash;
use pak_store::SeenMessageRecord;

pub struct SeenCache {
    window: Duration,
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SeenCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns true when `message_id` was not seen inside the window, and
    /// records it.
    pub fn check_and_insert(&self, message_id: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(message_id) {
            Some(seen_at) if now - *seen_at < self.window => false,
            _ => {
                entries.insert(message_id.to_owned(), now);
                true
            }
        }
    }

    /// Drop `message_id` so a later copy is admitted again.
    pub fn forget(&self, message_id: &str) -> bool {
        self.entries.lock().remove(message_id).is_some()
    }

    pub fn contains(&self, message_id: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .lock()
            .get(message_id)
            .map(|seen_at| now - *seen_at < self.window)
            .unwrap_or(false)
    }

    /// Seed from persisted records; entries already outside the window are skipped.
    pub fn load(&self, records: impl IntoIterator<Item = SeenMessageRecord>, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let mut loaded = 0;
        for record in records {
            if now - record.seen_at < self.window {
                entries.insert(record.message_id, record.seen_at);
                loaded += 1;
            }
        }
        loaded
    }

    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let window = self.window;
        entries.retain(|_, seen_at| now - *seen_at < window);
        before - entries.len()
    }

    /// Queue-sync digests of everything currently remembered.
    pub fn digests(&self) -> HashSet<u64> {
        self.entries
            .lock()
            .keys()
            .map(|id| hash::digest_entry(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_insert_inside_window_is_duplicate() {
        let cache = SeenCache::new(Duration::seconds(300));
        let now = Utc::now();
        assert!(cache.check_and_insert("m1", now));
        assert!(!cache.check_and_insert("m1", now + Duration::seconds(299)));
        assert!(cache.check_and_insert("m1", now + Duration::seconds(301)));
    }

    #[test]
    fn eviction_and_reload_respect_window() {
        let cache = SeenCache::new(Duration::seconds(60));
        let now = Utc::now();
        cache.check_and_insert("old", now - Duration::seconds(120));
        cache.check_and_insert("new", now);
        assert_eq!(cache.evict_expired(now), 1);
        assert_eq!(cache.len(), 1);

        cache.clear();
        let loaded = cache.load(
            [
                SeenMessageRecord { message_id: "a".into(), seen_at: now - Duration::seconds(30) },
                SeenMessageRecord { message_id: "b".into(), seen_at: now - Duration::seconds(90) },
            ],
            now,
        );
        assert_eq!(loaded, 1);
        assert!(cache.contains("a", now));
        assert!(!cache.contains("b", now));
    }

    #[test]
    fn concurrent_arrivals_admit_exactly_one() {
        use std::sync::Arc;
        let cache = Arc::new(SeenCache::new(Duration::seconds(300)));
        let now = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.check_and_insert("same", now))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}
