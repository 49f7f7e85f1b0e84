//! Per-connection link state: MTU, reassembly buffer, and the peer the
//! connection turned out to belong to.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};

use pak_proto::{fragment, Frame, Reassembler};

use crate::{
    config::LinkSettings,
    error::MeshError,
    transport::{ConnectionId, Transport},
};

pub struct Link {
    pub conn: ConnectionId,
    pub mtu: usize,
    /// Our ephemeral id on this connection.
    pub our_ephemeral_id: String,
    pub peer_ephemeral_id: Option<String>,
    /// Routing key once the handshake completed: the peer's persistent id
    /// when known, its ephemeral id otherwise.
    pub peer_key: Option<String>,
    pub display_name: Option<String>,
    reassembler: Reassembler,
    next_fragment_id: u32,
}

impl Link {
    pub fn is_established(&self) -> bool {
        self.peer_key.is_some()
    }
}

pub struct LinkTable {
    settings: LinkSettings,
    links: RwLock<HashMap<ConnectionId, Arc<Mutex<Link>>>>,
}

impl LinkTable {
    pub fn new(settings: LinkSettings) -> Self {
        Self {
            settings,
            links: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, conn: ConnectionId) -> Result<Arc<Mutex<Link>>, MeshError> {
        self.links
            .read()
            .get(&conn)
            .cloned()
            .ok_or(MeshError::UnknownConnection(conn.0))
    }

    pub fn insert(&self, conn: ConnectionId, mtu: usize, our_ephemeral_id: String) -> Result<(), MeshError> {
        if mtu < self.settings.min_mtu {
            return Err(MeshError::Transport(format!(
                "{conn}: mtu {mtu} below minimum {}",
                self.settings.min_mtu
            )));
        }
        let link = Link {
            conn,
            mtu,
            our_ephemeral_id,
            peer_ephemeral_id: None,
            peer_key: None,
            display_name: None,
            reassembler: Reassembler::new(
                Duration::milliseconds(self.settings.reassembly_timeout_ms as i64),
                self.settings.max_partial_messages,
            ),
            next_fragment_id: 0,
        };
        self.links.write().insert(conn, Arc::new(Mutex::new(link)));
        Ok(())
    }

    /// Returns the routing key the link had, if any.
    pub fn remove(&self, conn: ConnectionId) -> Option<String> {
        let link = self.links.write().remove(&conn)?;
        let key = link.lock().peer_key.clone();
        key
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.links.read().contains_key(&conn)
    }

    pub fn our_ephemeral_id(&self, conn: ConnectionId) -> Result<String, MeshError> {
        Ok(self.get(conn)?.lock().our_ephemeral_id.clone())
    }

    pub fn set_peer_identity(
        &self,
        conn: ConnectionId,
        ephemeral_id: &str,
        display_name: &str,
    ) -> Result<(), MeshError> {
        let link = self.get(conn)?;
        let mut link = link.lock();
        link.peer_ephemeral_id = Some(ephemeral_id.to_owned());
        link.display_name = Some(display_name.to_owned());
        Ok(())
    }

    pub fn peer_ephemeral_id(&self, conn: ConnectionId) -> Option<String> {
        self.get(conn).ok()?.lock().peer_ephemeral_id.clone()
    }

    pub fn set_established(&self, conn: ConnectionId, peer_key: &str) -> Result<(), MeshError> {
        self.get(conn)?.lock().peer_key = Some(peer_key.to_owned());
        Ok(())
    }

    pub fn peer_key(&self, conn: ConnectionId) -> Option<String> {
        self.get(conn).ok()?.lock().peer_key.clone()
    }

    /// Established connection to `peer_key`, lowest id first when there are several.
    pub fn conn_for_peer(&self, peer_key: &str) -> Option<ConnectionId> {
        self.links
            .read()
            .values()
            .filter_map(|l| {
                let l = l.lock();
                (l.peer_key.as_deref() == Some(peer_key)).then_some(l.conn)
            })
            .min()
    }

    pub fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .links
            .read()
            .values()
            .filter_map(|l| l.lock().peer_key.clone())
            .collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn rekey_peer(&self, old_key: &str, new_key: &str) -> usize {
        let mut moved = 0;
        for link in self.links.read().values() {
            let mut link = link.lock();
            if link.peer_key.as_deref() == Some(old_key) {
                link.peer_key = Some(new_key.to_owned());
                moved += 1;
            }
        }
        moved
    }

    /// Feed a packet into the connection's reassembler.
    pub fn push_packet(
        &self,
        conn: ConnectionId,
        packet: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<u8>>, MeshError> {
        let link = self.get(conn)?;
        let mut link = link.lock();
        Ok(link.reassembler.push(packet, now)?)
    }

    /// Drop stale partial frames on every link; returns how many.
    pub fn expire_partials(&self, now: DateTime<Utc>) -> usize {
        self.links
            .read()
            .values()
            .map(|l| l.lock().reassembler.expire(now))
            .sum()
    }

    fn split(&self, conn: ConnectionId, encoded: &[u8]) -> Result<Vec<Vec<u8>>, MeshError> {
        let link = self.get(conn)?;
        let mut link = link.lock();
        let id = link.next_fragment_id;
        link.next_fragment_id = link.next_fragment_id.wrapping_add(1);
        Ok(fragment::split(encoded, link.mtu, id)?)
    }
}

/// Encode `frame`, cut it to the link MTU and hand the packets to the transport.
pub async fn send_frame(
    transport: &dyn Transport,
    links: &LinkTable,
    conn: ConnectionId,
    frame: &Frame,
) -> Result<(), MeshError> {
    let encoded = frame.encode()?;
    let packets = links.split(conn, &encoded)?;
    tracing::trace!(%conn, kind = ?frame.kind, packets = packets.len(), "sending frame");
    for packet in packets {
        transport.send(conn, packet).await?;
    }
    Ok(())
}
