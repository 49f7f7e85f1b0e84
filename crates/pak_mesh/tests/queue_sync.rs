mod common;

use std::sync::Arc;

use common::{config, eventually, link, spawn_node, spawn_node_with_store};
use pak_mesh::{config::QueueSettings, EventBus, LoopbackHub, MeshError, OfflineQueue};
use pak_store::{MemoryStore, Priority, QueueStore};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnecting_peers_converge_on_the_union_of_their_queues() {
    let hub = LoopbackHub::new();
    let mut a = spawn_node(&hub, "a", config("alice")).await;
    let mut b = spawn_node(&hub, "b", config("bob")).await;

    // Both hold undeliverable mail for nodes that are not around.
    let a1 = a.node.send_message("zed", b"for zed", Priority::Normal).await.unwrap();
    let a2 = a.node.send_message("yan", b"from a", Priority::Normal).await.unwrap();
    let b1 = b.node.send_message("xia", b"from b", Priority::Normal).await.unwrap();
    assert_eq!(a.node.queue().message_ids().len(), 2);

    link(&hub, &mut a, &mut b).await;

    let expected: std::collections::BTreeSet<String> = [a1, a2, b1].into_iter().collect();
    eventually(|| a.node.queue().message_ids() == expected && b.node.queue().message_ids() == expected)
        .await;

    // Synced copies were held for the final recipients, not bounced back.
    assert_eq!(b.node.queue().depth("zed"), 1);
    assert_eq!(a.node.queue().depth("xia"), 1);
}

#[tokio::test]
async fn full_queue_evicts_oldest_normal_not_high_priority() {
    let store = Arc::new(MemoryStore::new());
    let queue = OfflineQueue::new(QueueSettings::default(), 1_000, store.clone(), EventBus::new());

    queue
        .enqueue("peer", "urgent", b"!".to_vec(), Priority::High, false)
        .await
        .unwrap();
    for i in 0..100 {
        queue
            .enqueue("peer", &format!("m{i:03}"), vec![], Priority::Normal, false)
            .await
            .unwrap();
    }

    assert_eq!(queue.depth("peer"), 100);
    let ids = queue.message_ids();
    assert!(ids.contains("urgent"));
    assert!(!ids.contains("m000"));
    assert!(ids.contains("m099"));
    assert_eq!(store.load_queued().await.unwrap().len(), 100);

    let err = queue
        .enqueue("peer", "meh", vec![], Priority::Low, false)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::QueueFull(_)));
}

#[tokio::test]
async fn favorite_peers_hold_more() {
    let queue = OfflineQueue::new(
        QueueSettings::default(),
        1_000,
        Arc::new(MemoryStore::new()),
        EventBus::new(),
    );
    queue.set_favorite("best-friend", true);
    for i in 0..101 {
        queue
            .enqueue("best-friend", &format!("m{i}"), vec![], Priority::Normal, false)
            .await
            .unwrap();
    }
    assert_eq!(queue.depth("best-friend"), 101);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_survives_a_restart() {
    let hub = LoopbackHub::new();
    let store = Arc::new(MemoryStore::new());
    let a = spawn_node_with_store(&hub, "a", config("alice"), store.clone()).await;
    let id = a.node.send_message("offline-peer", b"keep me", Priority::Normal).await.unwrap();
    drop(a);

    let restarted = spawn_node_with_store(&hub, "a2", config("alice"), store).await;
    assert!(restarted.node.queue().message_ids().contains(&id));
    // The duplicate cache came back too.
    assert!(restarted.node.relay().seen().contains(&id, chrono::Utc::now()));
}
