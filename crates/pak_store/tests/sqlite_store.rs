use chrono::{Duration, Utc};
use pak_store::{
    IdentityStore, PeerIdentity, Priority, QueueStatus, QueueStore, QueuedMessage,
    SeenMessageRecord, SeenStore, Store, StoreError, Vault,
};

async fn open_store(dir: &tempfile::TempDir) -> Store {
    let vault = Vault::new();
    vault.unlock_with_key([42u8; 32]).await;
    Store::open(&dir.path().join("mesh.db"), vault)
        .await
        .expect("open store")
}

fn queued(id: &str, peer: &str, priority: Priority) -> QueuedMessage {
    let now = Utc::now();
    QueuedMessage {
        message_id: id.into(),
        peer_key: peer.into(),
        payload: format!("payload-{id}").into_bytes(),
        priority,
        status: QueueStatus::Pending,
        attempts: 0,
        relayed: true,
        enqueued_at: now,
        next_attempt_at: now,
        ack_deadline: None,
    }
}

#[tokio::test]
async fn queued_payloads_are_encrypted_at_rest() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    store.save_queued(&queued("m1", "peer", Priority::High)).await.unwrap();

    let raw: String = sqlx::query_scalar("SELECT payload_enc FROM queued_messages")
        .fetch_one(&store.pool)
        .await
        .unwrap();
    assert!(!raw.contains("payload-m1"));

    let loaded = store.load_queued().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].payload, b"payload-m1");
    assert_eq!(loaded[0].priority, Priority::High);
    assert!(loaded[0].relayed);
}

#[tokio::test]
async fn locked_vault_blocks_payload_access() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    store.vault.lock().await;
    let err = store
        .save_queued(&queued("m1", "peer", Priority::Normal))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::VaultLocked));
}

#[tokio::test]
async fn terminal_entries_are_not_reloaded_and_rekey_moves_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;

    let mut done = queued("m1", "eph-1", Priority::Normal);
    done.status = QueueStatus::Failed;
    store.save_queued(&done).await.unwrap();
    store.save_queued(&queued("m2", "eph-1", Priority::Normal)).await.unwrap();

    assert_eq!(store.rekey_queued("eph-1", "pid-1").await.unwrap(), 2);
    let pending = store.load_queued().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_id, "m2");
    assert_eq!(pending[0].peer_key, "pid-1");
}

#[tokio::test]
async fn identity_upsert_keeps_known_fields_and_guards_binding() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let now = Utc::now();

    let mut alice = PeerIdentity {
        static_public_key: "key-a".into(),
        persistent_id: None,
        ephemeral_id: Some("eph-a".into()),
        display_name: Some("alice".into()),
        first_seen: now,
        last_seen: now,
    };
    store.upsert_identity(&alice).await.unwrap();
    assert!(store.link_persistent_id("eph-a", "pid-a").await.unwrap());

    alice.display_name = None;
    alice.ephemeral_id = Some("eph-a2".into());
    store.upsert_identity(&alice).await.unwrap();

    let found = store.identity_by_persistent_id("pid-a").await.unwrap().unwrap();
    assert_eq!(found.display_name.as_deref(), Some("alice"));
    assert_eq!(found.ephemeral_id.as_deref(), Some("eph-a2"));

    let mallory = PeerIdentity {
        static_public_key: "key-m".into(),
        persistent_id: Some("pid-a".into()),
        ..alice.clone()
    };
    assert!(matches!(
        store.upsert_identity(&mallory).await,
        Err(StoreError::IdentityKeyConflict { .. })
    ));
}

#[tokio::test]
async fn seen_records_evict_by_time_range() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir).await;
    let now = Utc::now();

    for (id, age) in [("old", 600), ("recent", 10)] {
        store
            .record_seen(&SeenMessageRecord {
                message_id: id.into(),
                seen_at: now - Duration::seconds(age),
            })
            .await
            .unwrap();
    }
    let cutoff = now - Duration::seconds(300);
    assert_eq!(store.evict_seen_before(cutoff).await.unwrap(), 1);
    let left = store.seen_since(cutoff).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].message_id, "recent");
}
