//! Event bus and application callbacks.
//!
//! Components publish [`MeshEvent`]s on a broadcast channel. Applications
//! either subscribe directly or register a [`MeshCallbacks`] implementation,
//! which a dispatcher task drives from its own subscription.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::{relay::RelayStatsSnapshot, transport::ConnectionId};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A relay message addressed to this node arrived.
    MessageDelivered {
        message_id: String,
        original_sender: String,
        payload: Vec<u8>,
    },
    /// A single-hop message from a directly connected peer.
    DirectMessage { from: String, body: Vec<u8> },
    HandshakeComplete {
        conn: ConnectionId,
        their_ephemeral_id: String,
        their_persistent_id: Option<String>,
        display_name: String,
    },
    HandshakeFailed {
        conn: ConnectionId,
        timed_out: bool,
        reason: String,
    },
    PeerPromoted { old_key: String, new_key: String },
    RelayStatsChanged(RelayStatsSnapshot),
    DeliveryFailed {
        message_id: String,
        peer_key: String,
        attempts: u32,
    },
    MessageEvicted { message_id: String, peer_key: String },
}

/// Application hooks. Every method defaults to a no-op.
pub trait MeshCallbacks: Send + Sync {
    fn on_message_delivered(&self, _message_id: &str, _original_sender: &str, _payload: &[u8]) {}

    fn on_direct_message(&self, _from: &str, _body: &[u8]) {}

    fn on_handshake_complete(
        &self,
        _their_ephemeral_id: &str,
        _their_persistent_id: Option<&str>,
        _display_name: &str,
    ) {
    }

    fn on_handshake_failed(&self, _conn: ConnectionId, _reason: &str) {}

    fn on_relay_stats(&self, _stats: &RelayStatsSnapshot) {}

    fn on_delivery_failed(&self, _message_id: &str, _peer_key: &str) {}

    fn on_message_evicted(&self, _message_id: &str, _peer_key: &str) {}
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeshEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: MeshEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch(callbacks: &dyn MeshCallbacks, event: &MeshEvent) {
    match event {
        MeshEvent::MessageDelivered {
            message_id,
            original_sender,
            payload,
        } => callbacks.on_message_delivered(message_id, original_sender, payload),
        MeshEvent::DirectMessage { from, body } => callbacks.on_direct_message(from, body),
        MeshEvent::HandshakeComplete {
            their_ephemeral_id,
            their_persistent_id,
            display_name,
            ..
        } => callbacks.on_handshake_complete(
            their_ephemeral_id,
            their_persistent_id.as_deref(),
            display_name,
        ),
        MeshEvent::HandshakeFailed { conn, reason, .. } => {
            callbacks.on_handshake_failed(*conn, reason)
        }
        MeshEvent::RelayStatsChanged(stats) => callbacks.on_relay_stats(stats),
        MeshEvent::DeliveryFailed {
            message_id,
            peer_key,
            ..
        } => callbacks.on_delivery_failed(message_id, peer_key),
        MeshEvent::MessageEvicted { message_id, peer_key } => {
            callbacks.on_message_evicted(message_id, peer_key)
        }
        MeshEvent::PeerPromoted { .. } => {}
    }
}

/// Spawn a task that feeds every bus event to `callbacks` until the bus closes.
pub fn spawn_callback_dispatcher(bus: &EventBus, callbacks: Arc<dyn MeshCallbacks>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => dispatch(callbacks.as_ref(), &event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "callback dispatcher lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
