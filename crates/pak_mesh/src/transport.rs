//! Transport abstraction.
//!
//! The mesh core sees pairwise connections that deliver ordered packets no
//! larger than the connection's MTU. Radio specifics live behind [`Transport`].

use std::fmt;

use async_trait::async_trait;

use crate::error::MeshError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { conn: ConnectionId, mtu: usize },
    Disconnected { conn: ConnectionId },
    Packet { conn: ConnectionId, bytes: Vec<u8> },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, conn: ConnectionId, packet: Vec<u8>) -> Result<(), MeshError>;

    /// Tear down a connection. The transport reports `Disconnected` for it.
    async fn disconnect(&self, conn: ConnectionId) -> Result<(), MeshError>;
}
