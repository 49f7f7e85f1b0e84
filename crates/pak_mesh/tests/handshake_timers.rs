mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use common::{config, drain, link, spawn_node, spawn_node_with_store, wait_for_within};
use pak_mesh::{HandshakePhase, LoopbackHub, MeshEvent, TransportEvent};
use pak_store::{
    IdentityStore, MemoryStore, PeerIdentity, QueueStore, QueuedMessage, SeenMessageRecord,
    SeenStore, StoreError,
};

/// Memory store whose identity writes take longer than a phase timeout.
struct SlowIdentityStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl IdentityStore for SlowIdentityStore {
    async fn upsert_identity(&self, identity: &PeerIdentity) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert_identity(identity).await
    }

    async fn identity_by_static_key(&self, key: &str) -> Result<Option<PeerIdentity>, StoreError> {
        self.inner.identity_by_static_key(key).await
    }

    async fn identity_by_persistent_id(&self, id: &str) -> Result<Option<PeerIdentity>, StoreError> {
        self.inner.identity_by_persistent_id(id).await
    }

    async fn identity_by_ephemeral_id(&self, id: &str) -> Result<Option<PeerIdentity>, StoreError> {
        self.inner.identity_by_ephemeral_id(id).await
    }

    async fn link_persistent_id(
        &self,
        ephemeral_id: &str,
        persistent_id: &str,
    ) -> Result<bool, StoreError> {
        self.inner.link_persistent_id(ephemeral_id, persistent_id).await
    }
}

#[async_trait]
impl QueueStore for SlowIdentityStore {
    async fn save_queued(&self, msg: &QueuedMessage) -> Result<(), StoreError> {
        self.inner.save_queued(msg).await
    }

    async fn remove_queued(&self, message_id: &str, peer_key: &str) -> Result<bool, StoreError> {
        self.inner.remove_queued(message_id, peer_key).await
    }

    async fn load_queued(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        self.inner.load_queued().await
    }

    async fn rekey_queued(&self, old_key: &str, new_key: &str) -> Result<u64, StoreError> {
        self.inner.rekey_queued(old_key, new_key).await
    }
}

#[async_trait]
impl SeenStore for SlowIdentityStore {
    async fn record_seen(&self, record: &SeenMessageRecord) -> Result<(), StoreError> {
        self.inner.record_seen(record).await
    }

    async fn seen_since(&self, since: DateTime<Utc>) -> Result<Vec<SeenMessageRecord>, StoreError> {
        self.inner.seen_since(since).await
    }

    async fn evict_seen_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.evict_seen_before(cutoff).await
    }
}

fn count(events: &[MeshEvent], pred: impl Fn(&MeshEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

#[tokio::test(start_paused = true)]
async fn slow_completion_is_not_reported_as_a_timeout() {
    let hub = LoopbackHub::new();
    let store = Arc::new(SlowIdentityStore {
        inner: MemoryStore::new(),
        delay: Duration::from_millis(10_500),
    });
    let mut a = spawn_node_with_store(&hub, "a", config("alice"), store).await;
    let mut b = spawn_node(&hub, "b", config("bob")).await;

    hub.connect("a", "b", 185).unwrap();
    wait_for_within(&mut a.events, Duration::from_secs(60), |e| {
        matches!(e, MeshEvent::HandshakeComplete { .. })
    })
    .await;

    // Give any leftover timer every chance to fire.
    tokio::time::sleep(Duration::from_secs(30)).await;

    let a_events = drain(&mut a.events);
    let b_events = drain(&mut b.events);
    let failed = |e: &MeshEvent| matches!(e, MeshEvent::HandshakeFailed { .. });
    let complete = |e: &MeshEvent| matches!(e, MeshEvent::HandshakeComplete { .. });
    assert_eq!(count(&a_events, failed), 0);
    assert_eq!(count(&a_events, complete), 0, "completed more than once");
    assert_eq!(count(&b_events, failed), 0);
    assert_eq!(count(&b_events, complete), 1);
    assert_eq!(a.node.neighbours(), vec![b.id()]);
}

#[tokio::test(start_paused = true)]
async fn stale_phase_timer_is_ignored() {
    let hub = LoopbackHub::new();
    let mut a = spawn_node(&hub, "a", config("alice")).await;
    let mut b = spawn_node(&hub, "b", config("bob")).await;
    let (conn_a, _) = link(&hub, &mut a, &mut b).await;
    drain(&mut a.events);

    for phase in [
        HandshakePhase::IdentityExchange,
        HandshakePhase::CryptoHandshake,
        HandshakePhase::StatusSync,
    ] {
        a.node.handshakes().on_phase_timeout(conn_a, phase, 1).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let events = drain(&mut a.events);
    assert_eq!(count(&events, |e| matches!(e, MeshEvent::HandshakeFailed { .. })), 0);
    assert_eq!(a.node.neighbours(), vec![b.id()]);
    assert_eq!(a.node.handshakes().phase(conn_a).await, None);
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out_and_link_is_torn_down() {
    let hub = LoopbackHub::new();
    let mut a = spawn_node(&hub, "a", config("alice")).await;
    let (_ghost, mut ghost_rx) = hub.register("ghost");

    let (conn_a, conn_ghost) = hub.connect("a", "ghost", 185).unwrap();
    let event = wait_for_within(&mut a.events, Duration::from_secs(60), |e| {
        matches!(e, MeshEvent::HandshakeFailed { .. })
    })
    .await;
    let MeshEvent::HandshakeFailed { conn, timed_out, .. } = event else {
        unreachable!()
    };
    assert_eq!(conn, conn_a);
    assert!(timed_out);

    let torn_down = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = ghost_rx.recv().await {
            if matches!(event, TransportEvent::Disconnected { conn } if conn == conn_ghost) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(torn_down);
    assert_eq!(a.node.handshakes().in_progress(), 0);
}

#[tokio::test(start_paused = true)]
async fn lost_connection_fails_handshake_without_timeout() {
    let hub = LoopbackHub::new();
    let mut a = spawn_node(&hub, "a", config("alice")).await;
    let (_ghost, _ghost_rx) = hub.register("ghost");

    let (conn_a, _) = hub.connect("a", "ghost", 185).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        a.node.handshakes().phase(conn_a).await,
        Some(HandshakePhase::IdentityExchange)
    );

    hub.sever(conn_a);
    let event = wait_for_within(&mut a.events, Duration::from_secs(5), |e| {
        matches!(e, MeshEvent::HandshakeFailed { .. })
    })
    .await;
    assert!(matches!(event, MeshEvent::HandshakeFailed { timed_out: false, .. }));

    // The phase timer died with the context.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let later = drain(&mut a.events);
    assert_eq!(count(&later, |e| matches!(e, MeshEvent::HandshakeFailed { .. })), 0);
}
