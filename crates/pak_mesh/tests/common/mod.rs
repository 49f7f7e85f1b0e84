#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use pak_crypto::IdentityKeyPair;
use pak_mesh::{ConnectionId, EventBus, LoopbackHub, MeshConfig, MeshEvent, MeshNode};
use pak_store::{MemoryStore, MeshStore};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestNode {
    pub name: String,
    pub node: Arc<MeshNode>,
    pub events: broadcast::Receiver<MeshEvent>,
}

impl TestNode {
    pub fn id(&self) -> String {
        self.node.local_id().to_owned()
    }
}

pub fn config(name: &str) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.node.display_name = name.to_owned();
    config
}

pub async fn spawn_node(hub: &Arc<LoopbackHub>, name: &str, config: MeshConfig) -> TestNode {
    spawn_node_with_store(hub, name, config, Arc::new(MemoryStore::new())).await
}

pub async fn spawn_node_with_store<S: MeshStore + 'static>(
    hub: &Arc<LoopbackHub>,
    name: &str,
    config: MeshConfig,
    store: Arc<S>,
) -> TestNode {
    let (transport, rx) = hub.register(name);
    let bus = EventBus::new();
    let events = bus.subscribe();
    let node = MeshNode::start(
        config,
        Arc::new(IdentityKeyPair::generate().unwrap()),
        transport,
        store,
        bus,
    )
    .await
    .unwrap();
    node.spawn(rx);
    TestNode {
        name: name.to_owned(),
        node,
        events,
    }
}

/// Next event matching `pred`, skipping others.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<MeshEvent>, pred: F) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    wait_for_within(rx, WAIT, pred).await
}

pub async fn wait_for_within<F>(
    rx: &mut broadcast::Receiver<MeshEvent>,
    within: Duration,
    mut pred: F,
) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for mesh event")
}

/// Connect two nodes and wait until each has promoted the other to its
/// persistent id.
pub async fn link(hub: &LoopbackHub, a: &mut TestNode, b: &mut TestNode) -> (ConnectionId, ConnectionId) {
    let conns = hub.connect(&a.name, &b.name, 185).unwrap();
    let (a_id, b_id) = (a.id(), b.id());
    wait_for(&mut a.events, |e| matches!(e, MeshEvent::PeerPromoted { new_key, .. } if *new_key == b_id)).await;
    wait_for(&mut b.events, |e| matches!(e, MeshEvent::PeerPromoted { new_key, .. } if *new_key == a_id)).await;
    conns
}

/// Everything already sitting in the receiver.
pub fn drain(rx: &mut broadcast::Receiver<MeshEvent>) -> Vec<MeshEvent> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

/// Poll `check` until it holds.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true")
}
