//! In-process transport: a hub that wires named nodes together with ordered,
//! lossless links. Used by integration tests and the simulator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    error::MeshError,
    transport::{ConnectionId, Transport, TransportEvent},
};

struct Endpoint {
    node: String,
    peer_conn: ConnectionId,
}

#[derive(Default)]
struct HubInner {
    inboxes: HashMap<String, mpsc::UnboundedSender<TransportEvent>>,
    /// Connection id → the node that owns it and the id on the other side.
    endpoints: HashMap<ConnectionId, Endpoint>,
}

#[derive(Default)]
pub struct LoopbackHub {
    inner: Mutex<HubInner>,
    next_conn: AtomicU64,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a node; returns its transport handle and event stream.
    pub fn register(
        self: &Arc<Self>,
        node: impl Into<String>,
    ) -> (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let node = node.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().inboxes.insert(node.clone(), tx);
        let transport = Arc::new(LoopbackTransport {
            hub: Arc::clone(self),
            node,
        });
        (transport, rx)
    }

    /// Open a link between two registered nodes.
    pub fn connect(&self, a: &str, b: &str, mtu: usize) -> Result<(ConnectionId, ConnectionId), MeshError> {
        let conn_a = ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed) + 1);
        let conn_b = ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed) + 1);
        let mut inner = self.inner.lock();
        let tx_a = inner
            .inboxes
            .get(a)
            .cloned()
            .ok_or_else(|| MeshError::Transport(format!("unknown node {a}")))?;
        let tx_b = inner
            .inboxes
            .get(b)
            .cloned()
            .ok_or_else(|| MeshError::Transport(format!("unknown node {b}")))?;
        inner.endpoints.insert(conn_a, Endpoint { node: a.to_owned(), peer_conn: conn_b });
        inner.endpoints.insert(conn_b, Endpoint { node: b.to_owned(), peer_conn: conn_a });
        drop(inner);

        let _ = tx_a.send(TransportEvent::Connected { conn: conn_a, mtu });
        let _ = tx_b.send(TransportEvent::Connected { conn: conn_b, mtu });
        Ok((conn_a, conn_b))
    }

    /// Drop the link that `conn` belongs to, notifying both ends.
    pub fn sever(&self, conn: ConnectionId) {
        let mut inner = self.inner.lock();
        let Some(ours) = inner.endpoints.remove(&conn) else {
            return;
        };
        let theirs = inner.endpoints.remove(&ours.peer_conn);
        let mut notify = vec![(ours.node, conn)];
        if let Some(t) = theirs {
            notify.push((t.node, ours.peer_conn));
        }
        for (node, c) in notify {
            if let Some(tx) = inner.inboxes.get(&node) {
                let _ = tx.send(TransportEvent::Disconnected { conn: c });
            }
        }
    }

    /// Sever every link between `a` and `b`.
    pub fn disconnect_nodes(&self, a: &str, b: &str) {
        let conns: Vec<ConnectionId> = {
            let inner = self.inner.lock();
            inner
                .endpoints
                .iter()
                .filter(|(_, ep)| ep.node == a)
                .filter(|(_, ep)| {
                    inner
                        .endpoints
                        .get(&ep.peer_conn)
                        .map(|p| p.node == b)
                        .unwrap_or(false)
                })
                .map(|(c, _)| *c)
                .collect()
        };
        for conn in conns {
            self.sever(conn);
        }
    }

    fn deliver(&self, from: &str, conn: ConnectionId, packet: Vec<u8>) -> Result<(), MeshError> {
        let inner = self.inner.lock();
        let ep = inner
            .endpoints
            .get(&conn)
            .filter(|ep| ep.node == from)
            .ok_or(MeshError::UnknownConnection(conn.0))?;
        let peer = inner
            .endpoints
            .get(&ep.peer_conn)
            .ok_or(MeshError::UnknownConnection(ep.peer_conn.0))?;
        let tx = inner
            .inboxes
            .get(&peer.node)
            .ok_or_else(|| MeshError::Transport(format!("node {} is gone", peer.node)))?;
        tx.send(TransportEvent::Packet {
            conn: ep.peer_conn,
            bytes: packet,
        })
        .map_err(|_| MeshError::Transport(format!("node {} stopped", peer.node)))
    }
}

pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    node: String,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, conn: ConnectionId, packet: Vec<u8>) -> Result<(), MeshError> {
        self.hub.deliver(&self.node, conn, packet)
    }

    async fn disconnect(&self, conn: ConnectionId) -> Result<(), MeshError> {
        self.hub.sever(conn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packets_cross_the_link_in_order() {
        let hub = LoopbackHub::new();
        let (ta, mut ra) = hub.register("a");
        let (_tb, mut rb) = hub.register("b");
        let (ca, cb) = hub.connect("a", "b", 64).unwrap();

        assert_eq!(ra.recv().await, Some(TransportEvent::Connected { conn: ca, mtu: 64 }));
        assert_eq!(rb.recv().await, Some(TransportEvent::Connected { conn: cb, mtu: 64 }));

        ta.send(ca, vec![1]).await.unwrap();
        ta.send(ca, vec![2]).await.unwrap();
        assert_eq!(rb.recv().await, Some(TransportEvent::Packet { conn: cb, bytes: vec![1] }));
        assert_eq!(rb.recv().await, Some(TransportEvent::Packet { conn: cb, bytes: vec![2] }));

        ta.disconnect(ca).await.unwrap();
        assert_eq!(ra.recv().await, Some(TransportEvent::Disconnected { conn: ca }));
        assert_eq!(rb.recv().await, Some(TransportEvent::Disconnected { conn: cb }));
        assert!(ta.send(ca, vec![3]).await.is_err());
    }
}
