//! MeshNode: wires transport, handshake coordinator, sessions, relay engine
//! and offline queue together.
//!
//! Transport events for one connection are handled by that connection's own
//! worker task, in arrival order. Different connections proceed in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use pak_crypto::{identity::new_ephemeral_id, IdentityKeyPair};
use pak_proto::{
    message, AckPayload, DirectMessage, Frame, FrameKind, QueueDigest, QueueSyncRequest,
    RelayEnvelope,
};
use pak_store::{IdentityStore, MeshStore, Priority, QueueStore, QueuedMessage, SeenMessageRecord, SeenStore};

use crate::{
    config::MeshConfig,
    error::MeshError,
    events::{EventBus, MeshEvent},
    handshake::{HandshakeCoordinator, HandshakeOutcome},
    link::{send_frame, LinkTable},
    queue::{sync, OfflineQueue},
    relay::{DropReason, RelayDecision, RelayEngine, RelayStatsSnapshot},
    sessions::SessionManager,
    transport::{ConnectionId, Transport, TransportEvent},
};

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub retried: usize,
    pub ack_timeouts: usize,
    pub seen_evicted: usize,
    /// Partial frames discarded by reassembly; each is a lost delivery.
    pub reassembly_failures: usize,
    pub sessions_pruned: usize,
    /// Rekey handshakes started for connected peers with expired sessions.
    pub rekeys_started: usize,
}

pub struct MeshNode {
    me: Weak<MeshNode>,
    config: MeshConfig,
    local_id: String,
    transport: Arc<dyn Transport>,
    links: Arc<LinkTable>,
    sessions: Arc<SessionManager>,
    handshakes: Arc<HandshakeCoordinator>,
    relay: RelayEngine,
    queue: Arc<OfflineQueue>,
    identities: Arc<dyn IdentityStore>,
    seen_store: Arc<dyn SeenStore>,
    events: EventBus,
    workers: SyncMutex<HashMap<ConnectionId, mpsc::UnboundedSender<TransportEvent>>>,
}

impl MeshNode {
    /// Build a node and restore its queue and duplicate cache from `store`.
    pub async fn start<S>(
        config: MeshConfig,
        identity: Arc<IdentityKeyPair>,
        transport: Arc<dyn Transport>,
        store: Arc<S>,
        events: EventBus,
    ) -> Result<Arc<Self>, MeshError>
    where
        S: MeshStore + 'static,
    {
        config.validate()?;
        let local_id = identity.persistent_id();
        let queue_store: Arc<dyn QueueStore> = store.clone();
        let identities: Arc<dyn IdentityStore> = store.clone();
        let seen_store: Arc<dyn SeenStore> = store;

        let links = Arc::new(LinkTable::new(config.link.clone()));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&identity),
            config.session.to_session_config(),
        ));
        let queue = Arc::new(OfflineQueue::new(
            config.queue.clone(),
            config.relay.max_relay_queue,
            queue_store,
            events.clone(),
        ));
        let handshakes = HandshakeCoordinator::new(
            config.handshake.clone(),
            config.node.clone(),
            local_id.clone(),
            Arc::clone(&transport),
            Arc::clone(&links),
            Arc::clone(&sessions),
            Arc::clone(&identities),
            Arc::clone(&queue),
            events.clone(),
        );
        let relay = RelayEngine::new(local_id.clone(), &config.relay);

        let restored = queue.load_from_store().await?;
        let now = Utc::now();
        let seen = seen_store.seen_since(now - relay.seen().window()).await?;
        let seen_loaded = relay.seen().load(seen, now);
        tracing::info!(
            node = %local_id,
            name = %config.node.display_name,
            queued = restored,
            seen = seen_loaded,
            "mesh node started"
        );

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            local_id,
            transport,
            links,
            sessions,
            handshakes,
            relay,
            queue,
            identities,
            seen_store,
            events,
            workers: SyncMutex::new(HashMap::new()),
        }))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn relay(&self) -> &RelayEngine {
        &self.relay
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn handshakes(&self) -> &HandshakeCoordinator {
        &self.handshakes
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn neighbours(&self) -> Vec<String> {
        self.links.connected_peers()
    }

    pub fn relay_stats(&self) -> RelayStatsSnapshot {
        self.relay.snapshot(self.queue.relay_depth())
    }

    // ── Transport events ──────────────────────────────────────────────────────

    /// Consume a transport event stream until it closes.
    pub fn spawn(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                node.handle_transport_event(event);
            }
            tracing::debug!(node = %node.local_id, "transport stream closed");
        })
    }

    pub fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { conn, mtu } => self.on_connected(conn, mtu),
            TransportEvent::Packet { conn, .. } | TransportEvent::Disconnected { conn } => {
                let worker = self.workers.lock().get(&conn).cloned();
                match worker {
                    Some(tx) => {
                        let _ = tx.send(event);
                    }
                    None => tracing::debug!(%conn, "event for unknown connection"),
                }
            }
        }
    }

    fn on_connected(&self, conn: ConnectionId, mtu: usize) {
        let Some(node) = self.me.upgrade() else {
            return;
        };
        if let Err(e) = self.links.insert(conn, mtu, new_ephemeral_id()) {
            tracing::warn!(%conn, error = %e, "refusing connection");
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                let _ = transport.disconnect(conn).await;
            });
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.workers.lock().insert(conn, tx);
        tracing::debug!(%conn, mtu, "connection up");

        tokio::spawn(async move {
            if let Err(e) = node.handshakes.begin_handshake(conn).await {
                tracing::warn!(%conn, error = %e, "could not start handshake");
            }
            while let Some(event) = rx.recv().await {
                match event {
                    TransportEvent::Packet { bytes, .. } => node.on_packet(conn, &bytes).await,
                    TransportEvent::Disconnected { .. } => {
                        node.on_disconnected(conn).await;
                        break;
                    }
                    TransportEvent::Connected { .. } => {}
                }
            }
        });
    }

    async fn on_disconnected(&self, conn: ConnectionId) {
        self.workers.lock().remove(&conn);
        self.handshakes.on_disconnect(conn).await;
        let peer = self.links.remove(conn);
        tracing::info!(%conn, peer = peer.as_deref().unwrap_or("-"), "connection closed");
    }

    async fn on_packet(&self, conn: ConnectionId, packet: &[u8]) {
        let encoded = match self.links.push_packet(conn, packet, Utc::now()) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(%conn, error = %e, "dropping bad packet");
                return;
            }
        };
        let frame = match Frame::decode(&encoded) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(%conn, error = %e, "dropping undecodable frame");
                return;
            }
        };
        if let Err(e) = self.handle_frame(conn, frame).await {
            tracing::debug!(%conn, error = %e, "frame handling failed");
        }
    }

    async fn handle_frame(&self, conn: ConnectionId, frame: Frame) -> Result<(), MeshError> {
        if matches!(
            frame.kind,
            FrameKind::Identity | FrameKind::HandshakeStep | FrameKind::StatusSync
        ) {
            if let Some(outcome) = self.handshakes.handle_frame(conn, &frame).await? {
                self.after_handshake(outcome).await;
            }
            return Ok(());
        }

        let Some(peer) = self.links.peer_key(conn) else {
            tracing::debug!(%conn, kind = ?frame.kind, "sealed frame before handshake");
            return Ok(());
        };
        let plaintext = match self
            .sessions
            .decrypt(&peer, &frame.payload, &frame.kind.aad())
            .await
        {
            Ok(p) => p,
            Err(MeshError::ReplayRejected) => {
                tracing::debug!(%conn, %peer, "replayed frame dropped");
                return Ok(());
            }
            Err(MeshError::RekeyRequired(_)) => {
                tracing::info!(%conn, %peer, "session due for rekey, starting handshake");
                self.handshakes.begin_handshake(conn).await?;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(%conn, %peer, error = %e, "dropping frame that failed to open");
                return Ok(());
            }
        };

        match frame.kind {
            FrameKind::DataMessage => {
                let direct: DirectMessage = message::from_json(&plaintext)?;
                self.events.emit(MeshEvent::DirectMessage {
                    from: peer,
                    body: direct.decode_body()?,
                });
            }
            FrameKind::RelayEnvelope => {
                let envelope = RelayEnvelope::from_json(&plaintext)?;
                self.on_envelope(conn, &peer, envelope).await?;
            }
            FrameKind::Ack => {
                let ack: AckPayload = message::from_json(&plaintext)?;
                self.queue.on_ack_received(&ack.message_id, &peer).await?;
            }
            FrameKind::QueueSyncDigest => {
                let digest: QueueDigest = message::from_json(&plaintext)?;
                self.on_queue_digest(conn, &peer, digest).await?;
            }
            FrameKind::QueueSyncRequest => {
                let request: QueueSyncRequest = message::from_json(&plaintext)?;
                self.on_queue_request(conn, &peer, request).await?;
            }
            FrameKind::Identity | FrameKind::HandshakeStep | FrameKind::StatusSync => {}
        }
        Ok(())
    }

    // ── Handshake follow-up ───────────────────────────────────────────────────

    async fn after_handshake(&self, outcome: HandshakeOutcome) {
        let mut peer = outcome.session_key.clone();
        if let Some(pid) = &outcome.persistent_id {
            if *pid != peer {
                match self.promote_peer_identity(&peer, pid).await {
                    Ok(()) => peer = pid.clone(),
                    Err(e) => tracing::warn!(peer = %peer, error = %e, "identity promotion failed"),
                }
            }
        }

        self.flush_peer(&peer).await;
        let digest = self.queue.digest();
        tracing::debug!(%peer, entries = digest.hashes.len(), "sending queue digest");
        let sent = match message::to_json(&digest) {
            Ok(json) => self.send_sealed(outcome.conn, &peer, FrameKind::QueueSyncDigest, &json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            tracing::debug!(%peer, error = %e, "queue digest not sent");
        }
    }

    /// Re-file everything known under `old_key` (an ephemeral id) under the
    /// peer's verified persistent id.
    pub async fn promote_peer_identity(&self, old_key: &str, new_key: &str) -> Result<(), MeshError> {
        if old_key == new_key {
            return Ok(());
        }
        self.identities.link_persistent_id(old_key, new_key).await?;
        self.sessions.rekey_peer_key(old_key, new_key).await;
        self.links.rekey_peer(old_key, new_key);
        let moved = self.queue.rekey_peer(old_key, new_key).await?;
        tracing::info!(old = %old_key, new = %new_key, queued = moved, "peer identity promoted");
        self.events.emit(MeshEvent::PeerPromoted {
            old_key: old_key.to_owned(),
            new_key: new_key.to_owned(),
        });
        Ok(())
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Encrypt `plaintext` for `peer` and send it on `conn`. An expired
    /// session kicks off a rekey handshake and reports `RekeyRequired`.
    async fn send_sealed(
        &self,
        conn: ConnectionId,
        peer: &str,
        kind: FrameKind,
        plaintext: &[u8],
    ) -> Result<(), MeshError> {
        let sealed = match self.sessions.encrypt(peer, plaintext, &kind.aad()).await {
            Ok(s) => s,
            Err(MeshError::RekeyRequired(p)) => {
                tracing::info!(%conn, peer = %p, "session due for rekey, starting handshake");
                self.handshakes.begin_handshake(conn).await?;
                return Err(MeshError::RekeyRequired(p));
            }
            // A linked peer without a usable session needs a handshake; one
            // already running on this connection is left alone.
            Err(MeshError::SessionNotEstablished(p)) if self.links.peer_key(conn).is_some() => {
                self.handshakes.begin_handshake(conn).await?;
                return Err(MeshError::SessionNotEstablished(p));
            }
            Err(e) => return Err(e),
        };
        let sender = self.links.our_ephemeral_id(conn)?;
        let frame = Frame::new(kind, sender, sealed);
        send_frame(self.transport.as_ref(), &self.links, conn, &frame).await
    }

    /// Originate a relay message to `recipient` (a persistent id). Returns
    /// its message id. The message is queued for every chosen next hop and
    /// sent at once to those that are connected.
    pub async fn send_message(
        &self,
        recipient: &str,
        payload: &[u8],
        priority: Priority,
    ) -> Result<String, MeshError> {
        let now = Utc::now();
        let envelope = RelayEnvelope::new(
            self.local_id.clone(),
            recipient,
            payload,
            self.config.relay.default_ttl,
            now,
        );
        self.relay.note_originated(&envelope, now);
        self.persist_seen(&envelope.message_id, now).await;

        let json = envelope.to_json()?;
        let hops = self.relay.next_hops(&envelope, None, &self.neighbours());
        let mut queued = 0;
        let mut last_err = None;
        for hop in &hops {
            match self
                .queue
                .enqueue_at(hop, &envelope.message_id, json.clone(), priority, false, now)
                .await
            {
                Ok(()) => queued += 1,
                Err(e) => last_err = Some(e),
            }
        }
        if queued == 0 {
            if let Some(e) = last_err {
                return Err(e);
            }
        }
        tracing::debug!(message_id = %envelope.message_id, to = %recipient, hops = hops.len(), "message queued");
        for hop in &hops {
            self.flush_peer(hop).await;
        }
        Ok(envelope.message_id)
    }

    /// Single-hop message to a connected, established peer.
    pub async fn send_direct(&self, peer: &str, body: &[u8]) -> Result<(), MeshError> {
        let conn = self
            .links
            .conn_for_peer(peer)
            .ok_or_else(|| MeshError::SessionNotEstablished(peer.to_owned()))?;
        let json = message::to_json(&DirectMessage::new(body, Utc::now()))?;
        self.send_sealed(conn, peer, FrameKind::DataMessage, &json).await
    }

    /// Send everything queued for `peer` if it is connected.
    async fn flush_peer(&self, peer: &str) {
        let Some(conn) = self.links.conn_for_peer(peer) else {
            return;
        };
        for entry in self.queue.on_peer_connected(peer) {
            self.deliver_entry(conn, entry).await;
        }
    }

    async fn deliver_entry(&self, conn: ConnectionId, entry: QueuedMessage) {
        let now = Utc::now();
        let result = self
            .send_sealed(conn, &entry.peer_key, FrameKind::RelayEnvelope, &entry.payload)
            .await;
        let outcome = match result {
            Ok(()) => self.queue.mark_sent_at(&entry.message_id, &entry.peer_key, now).await,
            Err(MeshError::RekeyRequired(_)) | Err(MeshError::SessionNotEstablished(_)) => {
                self.queue.release(&entry.message_id, &entry.peer_key).await
            }
            Err(e) => {
                tracing::debug!(message_id = %entry.message_id, peer = %entry.peer_key, error = %e, "send failed");
                self.queue
                    .mark_send_failed_at(&entry.message_id, &entry.peer_key, now)
                    .await
            }
        };
        if let Err(e) = outcome {
            tracing::warn!(message_id = %entry.message_id, error = %e, "queue update failed");
        }
    }

    async fn send_ack(&self, conn: ConnectionId, peer: &str, message_id: &str) {
        let ack = AckPayload {
            message_id: message_id.to_owned(),
        };
        let sent = match message::to_json(&ack) {
            Ok(json) => self.send_sealed(conn, peer, FrameKind::Ack, &json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            tracing::debug!(%peer, %message_id, error = %e, "ack not sent");
        }
    }

    // ── Relay ─────────────────────────────────────────────────────────────────

    async fn persist_seen(&self, message_id: &str, now: DateTime<Utc>) {
        let record = SeenMessageRecord {
            message_id: message_id.to_owned(),
            seen_at: now,
        };
        if let Err(e) = self.seen_store.record_seen(&record).await {
            tracing::warn!(%message_id, error = %e, "could not persist seen record");
        }
    }

    async fn on_envelope(&self, conn: ConnectionId, from: &str, envelope: RelayEnvelope) -> Result<(), MeshError> {
        let now = Utc::now();
        let decision = self
            .relay
            .on_message_received_at(&envelope, Some(from), &self.neighbours(), now);

        if !matches!(
            decision,
            RelayDecision::Drop(
                DropReason::Duplicate | DropReason::Malformed | DropReason::RateLimited
            )
        ) {
            self.persist_seen(&envelope.message_id, now).await;
        }

        match &decision {
            RelayDecision::DeliverLocally => {
                let payload = envelope.decode_payload()?;
                tracing::info!(
                    message_id = %envelope.message_id,
                    from = %envelope.original_sender,
                    "message delivered"
                );
                self.events.emit(MeshEvent::MessageDelivered {
                    message_id: envelope.message_id.clone(),
                    original_sender: envelope.original_sender.clone(),
                    payload,
                });
            }
            RelayDecision::Forward(hops) => {
                let onward = envelope.forwarded_by(&self.local_id);
                let json = onward.to_json()?;
                for hop in hops {
                    let queued = self
                        .queue
                        .enqueue_at(hop, &onward.message_id, json.clone(), Priority::Normal, true, now)
                        .await;
                    if let Err(e) = queued {
                        tracing::debug!(message_id = %onward.message_id, %hop, error = %e, "relay copy not queued");
                        self.relay.stats().record_drop(DropReason::QueueFull);
                    }
                }
            }
            RelayDecision::Drop(_) => {}
        }

        // Unacked rate-limited copies stay queued upstream and are retried.
        if !matches!(
            decision,
            RelayDecision::Drop(DropReason::Malformed | DropReason::RateLimited)
        ) {
            self.send_ack(conn, from, &envelope.message_id).await;
        }
        if let RelayDecision::Forward(hops) = &decision {
            for hop in hops {
                self.flush_peer(hop).await;
            }
        }
        self.events.emit(MeshEvent::RelayStatsChanged(self.relay_stats()));
        Ok(())
    }

    // ── Queue sync ────────────────────────────────────────────────────────────

    async fn on_queue_digest(&self, conn: ConnectionId, peer: &str, digest: QueueDigest) -> Result<(), MeshError> {
        let mut known = self.queue.digest_set();
        known.extend(self.relay.seen().digests());
        let Some(request) = sync::request_for(&digest, &known) else {
            tracing::debug!(%peer, "queue already in sync");
            return Ok(());
        };
        tracing::debug!(%peer, missing = request.hashes.len(), "requesting missing queue entries");
        let json = message::to_json(&request)?;
        self.send_sealed(conn, peer, FrameKind::QueueSyncRequest, &json).await
    }

    async fn on_queue_request(
        &self,
        conn: ConnectionId,
        peer: &str,
        request: QueueSyncRequest,
    ) -> Result<(), MeshError> {
        let payloads = self.queue.payloads_for(&request.hashes);
        tracing::debug!(%peer, requested = request.hashes.len(), sending = payloads.len(), "serving queue sync");
        for payload in payloads {
            self.send_sealed(conn, peer, FrameKind::RelayEnvelope, &payload).await?;
        }
        Ok(())
    }

    // ── Maintenance ───────────────────────────────────────────────────────────

    /// One housekeeping pass: retry due entries, re-arm missed acks, age out
    /// the duplicate cache, reassembly buffers and stale sessions.
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        let connected: HashSet<String> = self.neighbours().into_iter().collect();
        let due = self.queue.due_at(now, &connected);
        report.retried = due.len();
        for entry in due {
            match self.links.conn_for_peer(&entry.peer_key) {
                Some(conn) => self.deliver_entry(conn, entry).await,
                None => {
                    if let Err(e) = self.queue.release(&entry.message_id, &entry.peer_key).await {
                        tracing::warn!(message_id = %entry.message_id, error = %e, "queue update failed");
                    }
                }
            }
        }

        match self.queue.check_ack_timeouts_at(now).await {
            Ok(n) => report.ack_timeouts = n,
            Err(e) => tracing::warn!(error = %e, "ack timeout sweep failed"),
        }

        report.seen_evicted = self.relay.evict_expired(now);
        let cutoff = now - self.relay.seen().window();
        if let Err(e) = self.seen_store.evict_seen_before(cutoff).await {
            tracing::warn!(error = %e, "seen store eviction failed");
        }

        report.reassembly_failures = self.links.expire_partials(now);
        if report.reassembly_failures > 0 {
            tracing::warn!(count = report.reassembly_failures, "partial frames expired before reassembly");
        }

        let max_idle = Duration::seconds(self.config.session.rekey_after_secs as i64);
        report.sessions_pruned = self.sessions.prune_at(now, max_idle, &connected).await;
        for peer in self.sessions.expired_among(&connected, now).await {
            let Some(conn) = self.links.conn_for_peer(&peer) else {
                continue;
            };
            tracing::info!(%conn, %peer, "session aged out, starting rekey");
            match self.handshakes.begin_handshake(conn).await {
                Ok(()) => report.rekeys_started += 1,
                Err(e) => tracing::warn!(%conn, %peer, error = %e, "could not start rekey"),
            }
        }

        if report != MaintenanceReport::default() {
            tracing::debug!(?report, "maintenance pass");
        }
        report
    }
}
