//! In-memory implementation of the store traits, for tests and nodes that
//! run without a database.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    error::StoreError,
    identity::{check_binding, IdentityStore},
    models::{PeerIdentity, QueuedMessage, SeenMessageRecord},
    queue::QueueStore,
    seen::SeenStore,
};

#[derive(Default)]
pub struct MemoryStore {
    identities: Mutex<HashMap<String, PeerIdentity>>,
    queued: Mutex<BTreeMap<(String, String), QueuedMessage>>,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_identity(&self, pred: impl Fn(&PeerIdentity) -> bool) -> Option<PeerIdentity> {
        self.identities
            .lock()
            .values()
            .filter(|p| pred(p))
            .max_by_key(|p| p.last_seen)
            .cloned()
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn upsert_identity(&self, identity: &PeerIdentity) -> Result<(), StoreError> {
        let mut identities = self.identities.lock();
        if let Some(pid) = &identity.persistent_id {
            let existing = identities
                .values()
                .find(|p| p.persistent_id.as_deref() == Some(pid.as_str()));
            check_binding(existing, pid, &identity.static_public_key)?;
        }
        match identities.get_mut(&identity.static_public_key) {
            Some(stored) => {
                if identity.persistent_id.is_some() {
                    stored.persistent_id = identity.persistent_id.clone();
                }
                if identity.ephemeral_id.is_some() {
                    stored.ephemeral_id = identity.ephemeral_id.clone();
                }
                if identity.display_name.is_some() {
                    stored.display_name = identity.display_name.clone();
                }
                stored.last_seen = identity.last_seen;
            }
            None => {
                identities.insert(identity.static_public_key.clone(), identity.clone());
            }
        }
        Ok(())
    }

    async fn identity_by_static_key(&self, key: &str) -> Result<Option<PeerIdentity>, StoreError> {
        Ok(self.identities.lock().get(key).cloned())
    }

    async fn identity_by_persistent_id(&self, id: &str) -> Result<Option<PeerIdentity>, StoreError> {
        Ok(self.find_identity(|p| p.persistent_id.as_deref() == Some(id)))
    }

    async fn identity_by_ephemeral_id(&self, id: &str) -> Result<Option<PeerIdentity>, StoreError> {
        Ok(self.find_identity(|p| p.ephemeral_id.as_deref() == Some(id)))
    }

    async fn link_persistent_id(
        &self,
        ephemeral_id: &str,
        persistent_id: &str,
    ) -> Result<bool, StoreError> {
        let Some(record) = self.find_identity(|p| p.ephemeral_id.as_deref() == Some(ephemeral_id))
        else {
            return Ok(false);
        };
        let existing = self.find_identity(|p| p.persistent_id.as_deref() == Some(persistent_id));
        check_binding(existing.as_ref(), persistent_id, &record.static_public_key)?;
        if let Some(stored) = self.identities.lock().get_mut(&record.static_public_key) {
            stored.persistent_id = Some(persistent_id.to_owned());
        }
        Ok(true)
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn save_queued(&self, msg: &QueuedMessage) -> Result<(), StoreError> {
        self.queued
            .lock()
            .insert((msg.message_id.clone(), msg.peer_key.clone()), msg.clone());
        Ok(())
    }

    async fn remove_queued(&self, message_id: &str, peer_key: &str) -> Result<bool, StoreError> {
        Ok(self
            .queued
            .lock()
            .remove(&(message_id.to_owned(), peer_key.to_owned()))
            .is_some())
    }

    async fn load_queued(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        let mut out: Vec<QueuedMessage> = self
            .queued
            .lock()
            .values()
            .filter(|m| !m.status.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|m| m.enqueued_at);
        Ok(out)
    }

    async fn rekey_queued(&self, old_key: &str, new_key: &str) -> Result<u64, StoreError> {
        let mut queued = self.queued.lock();
        let moving: Vec<(String, String)> = queued
            .keys()
            .filter(|(_, peer)| peer == old_key)
            .cloned()
            .collect();
        for key in &moving {
            if let Some(mut msg) = queued.remove(key) {
                msg.peer_key = new_key.to_owned();
                queued.insert((msg.message_id.clone(), new_key.to_owned()), msg);
            }
        }
        Ok(moving.len() as u64)
    }
}

#[async_trait]
impl SeenStore for MemoryStore {
    async fn record_seen(&self, record: &SeenMessageRecord) -> Result<(), StoreError> {
        self.seen
            .lock()
            .entry(record.message_id.clone())
            .or_insert(record.seen_at);
        Ok(())
    }

    async fn seen_since(&self, since: DateTime<Utc>) -> Result<Vec<SeenMessageRecord>, StoreError> {
        let mut out: Vec<SeenMessageRecord> = self
            .seen
            .lock()
            .iter()
            .filter(|(_, at)| **at >= since)
            .map(|(id, at)| SeenMessageRecord {
                message_id: id.clone(),
                seen_at: *at,
            })
            .collect();
        out.sort_by_key(|r| r.seen_at);
        Ok(out)
    }

    async fn evict_seen_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, at| *at >= cutoff);
        Ok((before - seen.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, QueueStatus};

    fn identity(key: &str, pid: Option<&str>, eph: Option<&str>) -> PeerIdentity {
        let now = Utc::now();
        PeerIdentity {
            static_public_key: key.into(),
            persistent_id: pid.map(Into::into),
            ephemeral_id: eph.map(Into::into),
            display_name: None,
            first_seen: now,
            last_seen: now,
        }
    }

    #[tokio::test]
    async fn persistent_id_cannot_move_to_another_key() {
        let store = MemoryStore::new();
        store.upsert_identity(&identity("k1", Some("p1"), None)).await.unwrap();
        let err = store
            .upsert_identity(&identity("k2", Some("p1"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IdentityKeyConflict { .. }));
    }

    #[tokio::test]
    async fn link_promotes_ephemeral_record() {
        let store = MemoryStore::new();
        store.upsert_identity(&identity("k1", None, Some("e1"))).await.unwrap();
        assert!(store.link_persistent_id("e1", "p1").await.unwrap());
        let found = store.identity_by_persistent_id("p1").await.unwrap().unwrap();
        assert_eq!(found.static_public_key, "k1");
        assert!(!store.link_persistent_id("nobody", "p2").await.unwrap());
    }

    #[tokio::test]
    async fn rekey_moves_queue_entries() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .save_queued(&QueuedMessage {
                message_id: "m1".into(),
                peer_key: "eph".into(),
                payload: vec![1],
                priority: Priority::Normal,
                status: QueueStatus::Pending,
                attempts: 0,
                relayed: false,
                enqueued_at: now,
                next_attempt_at: now,
                ack_deadline: None,
            })
            .await
            .unwrap();
        assert_eq!(store.rekey_queued("eph", "pid").await.unwrap(), 1);
        let all = store.load_queued().await.unwrap();
        assert_eq!(all[0].peer_key, "pid");
        assert!(!store.remove_queued("m1", "eph").await.unwrap());
        assert!(store.remove_queued("m1", "pid").await.unwrap());
    }
}
