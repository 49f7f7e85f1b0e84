//! Handshake Coordinator.
//!
//! Drives each connection through
//! `Ready → IdentityExchange → CryptoHandshake → StatusSync → Complete`.
//! Every phase arms its own timer. Completing a phase aborts the timer before
//! anything else happens, and the timer re-checks the phase it was armed for
//! when it fires, so a handshake that finishes during a slow store write is
//! never reported as timed out.
//!
//! A failed or timed-out handshake tears the connection down. A lost
//! connection releases the context but leaves any established session in
//! place for a later reconnect.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use pak_crypto::{handshake::Role, PublicKeyBytes};
use pak_proto::{
    message::{self, MESH_PROTOCOL_VERSION},
    Frame, FrameKind, IdentityPayload, StatusSyncPayload,
};
use pak_store::{IdentityStore, PeerIdentity};

use crate::{
    config::{HandshakeSettings, NodeSettings},
    error::MeshError,
    events::{EventBus, MeshEvent},
    link::{send_frame, LinkTable},
    queue::OfflineQueue,
    sessions::SessionManager,
    transport::{ConnectionId, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakePhase {
    Ready,
    IdentityExchange,
    CryptoHandshake,
    StatusSync,
    Complete,
    Failed,
    TimedOut,
}

impl HandshakePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::IdentityExchange => "identity_exchange",
            Self::CryptoHandshake => "crypto_handshake",
            Self::StatusSync => "status_sync",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the rest of the node needs once a handshake completes.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub conn: ConnectionId,
    pub peer_ephemeral_id: String,
    /// Key the session is filed under.
    pub session_key: String,
    pub persistent_id: Option<String>,
    pub display_name: String,
    pub static_key: PublicKeyBytes,
    pub peer_queue_depth: u32,
    /// The link was already established; this was a rekey.
    pub rekey: bool,
}

struct HandshakeContext {
    conn: ConnectionId,
    phase: HandshakePhase,
    /// Bumped on every phase change; a timer only acts on its own epoch.
    epoch: u64,
    timer: Option<JoinHandle<()>>,
    our_ephemeral_id: String,
    peer_ephemeral_id: Option<String>,
    display_name: Option<String>,
    session_key: Option<String>,
    rekey: bool,
}

type ContextSlot = Arc<Mutex<HandshakeContext>>;

pub struct HandshakeCoordinator {
    me: Weak<HandshakeCoordinator>,
    settings: HandshakeSettings,
    node: NodeSettings,
    local_persistent_id: String,
    transport: Arc<dyn Transport>,
    links: Arc<LinkTable>,
    sessions: Arc<SessionManager>,
    identities: Arc<dyn IdentityStore>,
    queue: Arc<OfflineQueue>,
    events: EventBus,
    contexts: SyncMutex<HashMap<ConnectionId, ContextSlot>>,
}

impl HandshakeCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: HandshakeSettings,
        node: NodeSettings,
        local_persistent_id: String,
        transport: Arc<dyn Transport>,
        links: Arc<LinkTable>,
        sessions: Arc<SessionManager>,
        identities: Arc<dyn IdentityStore>,
        queue: Arc<OfflineQueue>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings,
            node,
            local_persistent_id,
            transport,
            links,
            sessions,
            identities,
            queue,
            events,
            contexts: SyncMutex::new(HashMap::new()),
        })
    }

    fn context(&self, conn: ConnectionId) -> Option<ContextSlot> {
        self.contexts.lock().get(&conn).cloned()
    }

    fn release(&self, conn: ConnectionId, slot: &ContextSlot) {
        let mut contexts = self.contexts.lock();
        if contexts.get(&conn).map(|s| Arc::ptr_eq(s, slot)).unwrap_or(false) {
            contexts.remove(&conn);
        }
    }

    pub async fn phase(&self, conn: ConnectionId) -> Option<HandshakePhase> {
        let slot = self.context(conn)?;
        let phase = slot.lock().await.phase;
        Some(phase)
    }

    pub fn in_progress(&self) -> usize {
        self.contexts.lock().len()
    }

    fn new_context(&self, conn: ConnectionId) -> Result<(ContextSlot, bool), MeshError> {
        let our_ephemeral_id = self.links.our_ephemeral_id(conn)?;
        let rekey = self.links.peer_key(conn).is_some();
        let mut contexts = self.contexts.lock();
        if let Some(existing) = contexts.get(&conn) {
            return Ok((Arc::clone(existing), false));
        }
        let slot = Arc::new(Mutex::new(HandshakeContext {
            conn,
            phase: HandshakePhase::Ready,
            epoch: 0,
            timer: None,
            our_ephemeral_id,
            peer_ephemeral_id: None,
            display_name: None,
            session_key: None,
            rekey,
        }));
        contexts.insert(conn, Arc::clone(&slot));
        Ok((slot, true))
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    fn enter_phase(&self, ctx: &mut HandshakeContext, phase: HandshakePhase) {
        if let Some(timer) = ctx.timer.take() {
            timer.abort();
        }
        ctx.phase = phase;
        ctx.epoch += 1;
        if phase.is_terminal() {
            return;
        }
        let weak = self.me.clone();
        let conn = ctx.conn;
        let epoch = ctx.epoch;
        let timeout = self.settings.phase_timeout();
        ctx.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(coordinator) = weak.upgrade() {
                coordinator.on_phase_timeout(conn, phase, epoch).await;
            }
        }));
    }

    /// Timer callback. Acts only if the connection is still in the phase the
    /// timer was armed for; anything else means the timer is stale.
    pub async fn on_phase_timeout(&self, conn: ConnectionId, phase: HandshakePhase, epoch: u64) {
        let Some(slot) = self.context(conn) else {
            tracing::debug!(%conn, %phase, "stale handshake timer, no context");
            return;
        };
        let mut ctx = slot.lock().await;
        if ctx.phase != phase || ctx.epoch != epoch || ctx.phase.is_terminal() {
            tracing::debug!(%conn, armed = %phase, current = %ctx.phase, "stale handshake timer ignored");
            return;
        }
        // This task is the timer; detach rather than abort it.
        drop(ctx.timer.take());
        tracing::warn!(%conn, %phase, "handshake phase timed out");
        self.fail_locked(&slot, &mut ctx, MeshError::HandshakeTimeout(phase.as_str()), true)
            .await;
    }

    // ── Entry points ──────────────────────────────────────────────────────────

    /// Start a handshake on `conn` by announcing our identity. A handshake
    /// already running on the connection is left alone.
    pub async fn begin_handshake(&self, conn: ConnectionId) -> Result<(), MeshError> {
        let (slot, created) = self.new_context(conn)?;
        if !created {
            return Ok(());
        }
        let mut ctx = slot.lock().await;
        self.enter_phase(&mut ctx, HandshakePhase::IdentityExchange);
        if let Err(e) = self.send_identity(&ctx).await {
            self.fail_locked(&slot, &mut ctx, e, false).await;
        }
        Ok(())
    }

    /// Route a cleartext or status frame to the right phase handler.
    pub async fn handle_frame(
        &self,
        conn: ConnectionId,
        frame: &Frame,
    ) -> Result<Option<HandshakeOutcome>, MeshError> {
        match frame.kind {
            FrameKind::Identity => {
                self.handle_identity(conn, frame).await?;
                Ok(None)
            }
            FrameKind::HandshakeStep => {
                self.handle_handshake_step(conn, frame).await?;
                Ok(None)
            }
            FrameKind::StatusSync => self.handle_status_sync(conn, frame).await,
            other => Err(MeshError::HandshakeFailed(format!(
                "unexpected {other:?} frame during handshake"
            ))),
        }
    }

    async fn handle_identity(&self, conn: ConnectionId, frame: &Frame) -> Result<(), MeshError> {
        let (slot, created) = self.new_context(conn)?;
        let mut ctx = slot.lock().await;

        if created {
            // Peer started a handshake (initial or rekey); answer in kind.
            self.enter_phase(&mut ctx, HandshakePhase::IdentityExchange);
            if let Err(e) = self.send_identity(&ctx).await {
                self.fail_locked(&slot, &mut ctx, e, false).await;
                return Ok(());
            }
        }
        if ctx.phase != HandshakePhase::IdentityExchange {
            tracing::debug!(%conn, phase = %ctx.phase, "ignoring identity outside identity exchange");
            return Ok(());
        }

        let identity: IdentityPayload = match message::from_json(&frame.payload) {
            Ok(p) => p,
            Err(e) => {
                self.fail_locked(&slot, &mut ctx, MeshError::Proto(e), false).await;
                return Ok(());
            }
        };
        if identity.protocol_version != MESH_PROTOCOL_VERSION
            || identity.ephemeral_id != frame.sender_id
            || identity.ephemeral_id == ctx.our_ephemeral_id
        {
            let reason = MeshError::HandshakeFailed(format!(
                "bad identity from {} (protocol {})",
                frame.sender_id, identity.protocol_version
            ));
            self.fail_locked(&slot, &mut ctx, reason, false).await;
            return Ok(());
        }

        self.links
            .set_peer_identity(conn, &identity.ephemeral_id, &identity.display_name)?;
        let session_key = self
            .links
            .peer_key(conn)
            .unwrap_or_else(|| identity.ephemeral_id.clone());
        let role = Role::from_ephemeral_ids(&ctx.our_ephemeral_id, &identity.ephemeral_id);
        tracing::debug!(%conn, peer = %identity.ephemeral_id, ?role, "identity exchanged");

        ctx.peer_ephemeral_id = Some(identity.ephemeral_id);
        ctx.display_name = Some(identity.display_name);
        ctx.session_key = Some(session_key.clone());
        self.enter_phase(&mut ctx, HandshakePhase::CryptoHandshake);

        let first = match self.sessions.begin_handshake(&session_key, role).await {
            Ok(first) => first,
            Err(e) => {
                self.fail_locked(&slot, &mut ctx, e, false).await;
                return Ok(());
            }
        };
        if let Some(msg) = first {
            if let Err(e) = self.send(&ctx, FrameKind::HandshakeStep, msg).await {
                self.fail_locked(&slot, &mut ctx, e, false).await;
            }
        }
        Ok(())
    }

    async fn handle_handshake_step(&self, conn: ConnectionId, frame: &Frame) -> Result<(), MeshError> {
        let Some(slot) = self.context(conn) else {
            tracing::debug!(%conn, "handshake step without a handshake in progress");
            return Ok(());
        };
        let mut ctx = slot.lock().await;
        if ctx.phase != HandshakePhase::CryptoHandshake {
            tracing::debug!(%conn, phase = %ctx.phase, "ignoring out-of-phase handshake step");
            return Ok(());
        }
        let Some(session_key) = ctx.session_key.clone() else {
            return Ok(());
        };

        let progress = match self.sessions.handshake_message(&session_key, &frame.payload).await {
            Ok(p) => p,
            Err(e) => {
                self.fail_locked(&slot, &mut ctx, e, false).await;
                return Ok(());
            }
        };
        if let Some(reply) = progress.outbound {
            if let Err(e) = self.send(&ctx, FrameKind::HandshakeStep, reply).await {
                self.fail_locked(&slot, &mut ctx, e, false).await;
                return Ok(());
            }
        }
        if !progress.established {
            return Ok(());
        }

        self.enter_phase(&mut ctx, HandshakePhase::StatusSync);
        let status = StatusSyncPayload {
            persistent_id: self
                .node
                .share_persistent_id
                .then(|| self.local_persistent_id.clone()),
            queue_depth: u32::try_from(self.queue.total_depth()).unwrap_or(u32::MAX),
        };
        let sent = async {
            let plaintext = message::to_json(&status)?;
            let sealed = self
                .sessions
                .encrypt(&session_key, &plaintext, &FrameKind::StatusSync.aad())
                .await?;
            self.send(&ctx, FrameKind::StatusSync, sealed).await
        }
        .await;
        if let Err(e) = sent {
            self.fail_locked(&slot, &mut ctx, e, false).await;
        }
        Ok(())
    }

    async fn handle_status_sync(
        &self,
        conn: ConnectionId,
        frame: &Frame,
    ) -> Result<Option<HandshakeOutcome>, MeshError> {
        let Some(slot) = self.context(conn) else {
            tracing::debug!(%conn, "status sync without a handshake in progress");
            return Ok(None);
        };
        let mut ctx = slot.lock().await;
        if ctx.phase != HandshakePhase::StatusSync {
            tracing::debug!(%conn, phase = %ctx.phase, "ignoring out-of-phase status sync");
            return Ok(None);
        }
        let Some(session_key) = ctx.session_key.clone() else {
            return Ok(None);
        };

        let verified = async {
            let plaintext = self
                .sessions
                .decrypt(&session_key, &frame.payload, &FrameKind::StatusSync.aad())
                .await?;
            let status: StatusSyncPayload = message::from_json(&plaintext)?;
            let static_key = self
                .sessions
                .remote_static(&session_key)
                .await
                .ok_or_else(|| MeshError::SessionNotEstablished(session_key.clone()))?;
            if let Some(claimed) = &status.persistent_id {
                if *claimed != static_key.persistent_id() {
                    return Err(MeshError::HandshakeFailed(format!(
                        "persistent id {claimed} does not match the authenticated key"
                    )));
                }
            }
            Ok::<_, MeshError>((status, static_key))
        }
        .await;

        match verified {
            Ok((status, static_key)) => {
                let outcome = self.complete(&slot, &mut ctx, session_key, status, static_key).await;
                Ok(outcome)
            }
            Err(e) => {
                self.fail_locked(&slot, &mut ctx, e, false).await;
                Ok(None)
            }
        }
    }

    /// Connection gone: abort whatever handshake was running on it.
    pub async fn on_disconnect(&self, conn: ConnectionId) {
        let Some(slot) = self.context(conn) else {
            return;
        };
        let mut ctx = slot.lock().await;
        if ctx.phase.is_terminal() {
            return;
        }
        if let Some(timer) = ctx.timer.take() {
            timer.abort();
        }
        let phase = ctx.phase;
        ctx.phase = HandshakePhase::Failed;
        ctx.epoch += 1;
        if let Some(key) = ctx.session_key.clone() {
            self.sessions.abandon_handshake(&key).await;
        }
        drop(ctx);
        self.release(conn, &slot);
        tracing::info!(%conn, %phase, "connection lost during handshake");
        self.events.emit(MeshEvent::HandshakeFailed {
            conn,
            timed_out: false,
            reason: format!("connection lost during {phase}"),
        });
    }

    // ── Terminal transitions ──────────────────────────────────────────────────

    async fn complete(
        &self,
        slot: &ContextSlot,
        ctx: &mut HandshakeContext,
        session_key: String,
        status: StatusSyncPayload,
        static_key: PublicKeyBytes,
    ) -> Option<HandshakeOutcome> {
        // Timer first; nothing below may race it.
        self.enter_phase(ctx, HandshakePhase::Complete);

        let conn = ctx.conn;
        let peer_ephemeral_id = ctx.peer_ephemeral_id.clone().unwrap_or_default();
        let display_name = ctx.display_name.clone().unwrap_or_default();
        let now = Utc::now();
        let record = PeerIdentity {
            static_public_key: static_key.to_b64(),
            persistent_id: status.persistent_id.clone(),
            ephemeral_id: Some(peer_ephemeral_id.clone()),
            display_name: Some(display_name.clone()),
            first_seen: now,
            last_seen: now,
        };
        if let Err(e) = self.identities.upsert_identity(&record).await {
            tracing::warn!(%conn, error = %e, "could not persist peer identity");
        }
        if let Err(e) = self.links.set_established(conn, &session_key) {
            tracing::debug!(%conn, error = %e, "link vanished before handshake completed");
        }

        tracing::info!(
            %conn,
            peer = %peer_ephemeral_id,
            persistent_id = status.persistent_id.as_deref().unwrap_or("-"),
            rekey = ctx.rekey,
            "handshake complete"
        );
        self.events.emit(MeshEvent::HandshakeComplete {
            conn,
            their_ephemeral_id: peer_ephemeral_id.clone(),
            their_persistent_id: status.persistent_id.clone(),
            display_name: display_name.clone(),
        });
        self.release(conn, slot);

        Some(HandshakeOutcome {
            conn,
            peer_ephemeral_id,
            session_key,
            persistent_id: status.persistent_id,
            display_name,
            static_key,
            peer_queue_depth: status.queue_depth,
            rekey: ctx.rekey,
        })
    }

    async fn fail_locked(
        &self,
        slot: &ContextSlot,
        ctx: &mut HandshakeContext,
        reason: MeshError,
        timed_out: bool,
    ) {
        let terminal = if timed_out {
            HandshakePhase::TimedOut
        } else {
            HandshakePhase::Failed
        };
        let from = ctx.phase;
        self.enter_phase(ctx, terminal);
        if let Some(key) = ctx.session_key.clone() {
            self.sessions.abandon_handshake(&key).await;
        }
        self.release(ctx.conn, slot);

        tracing::warn!(conn = %ctx.conn, phase = %from, error = %reason, "handshake failed");
        self.events.emit(MeshEvent::HandshakeFailed {
            conn: ctx.conn,
            timed_out,
            reason: reason.to_string(),
        });
        if let Err(e) = self.transport.disconnect(ctx.conn).await {
            tracing::debug!(conn = %ctx.conn, error = %e, "disconnect after failed handshake");
        }
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    async fn send_identity(&self, ctx: &HandshakeContext) -> Result<(), MeshError> {
        let payload = message::to_json(&IdentityPayload {
            ephemeral_id: ctx.our_ephemeral_id.clone(),
            display_name: self.node.display_name.clone(),
            protocol_version: MESH_PROTOCOL_VERSION,
        })?;
        self.send(ctx, FrameKind::Identity, payload).await
    }

    async fn send(&self, ctx: &HandshakeContext, kind: FrameKind, payload: Vec<u8>) -> Result<(), MeshError> {
        let frame = Frame::new(kind, ctx.our_ephemeral_id.clone(), payload);
        send_frame(self.transport.as_ref(), &self.links, ctx.conn, &frame).await
    }
}
