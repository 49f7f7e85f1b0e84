//! Session Manager.
//!
//! Owns one [`NoiseLikeSession`] per peer key. The table lock only guards
//! lookup and insertion; each session has its own async mutex, so crypto for
//! one peer never waits on another and no two operations on the same session
//! interleave.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use pak_crypto::{
    handshake::Role,
    session::{HandshakeProgress, SessionConfig, SessionState},
    IdentityKeyPair, NoiseLikeSession, PublicKeyBytes,
};

use crate::error::MeshError;

type SessionSlot = Arc<Mutex<NoiseLikeSession>>;

pub struct SessionManager {
    identity: Arc<IdentityKeyPair>,
    config: SessionConfig,
    sessions: RwLock<HashMap<String, SessionSlot>>,
}

impl SessionManager {
    pub fn new(identity: Arc<IdentityKeyPair>, config: SessionConfig) -> Self {
        Self {
            identity,
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn session(&self, peer_key: &str) -> Option<SessionSlot> {
        self.sessions.read().get(peer_key).cloned()
    }

    pub fn get_or_create_session(&self, peer_key: &str) -> SessionSlot {
        if let Some(s) = self.session(peer_key) {
            return s;
        }
        let mut sessions = self.sessions.write();
        Arc::clone(sessions.entry(peer_key.to_owned()).or_insert_with(|| {
            Arc::new(Mutex::new(NoiseLikeSession::new(peer_key, self.config.clone())))
        }))
    }

    fn require(&self, peer_key: &str) -> Result<SessionSlot, MeshError> {
        self.session(peer_key)
            .ok_or_else(|| MeshError::SessionNotEstablished(peer_key.to_owned()))
    }

    /// Start (or restart) the handshake with `peer_key`. Any previous keys
    /// are discarded. Returns the first message when we initiate.
    pub async fn begin_handshake(&self, peer_key: &str, role: Role) -> Result<Option<Vec<u8>>, MeshError> {
        let slot = self.get_or_create_session(peer_key);
        let mut session = slot.lock().await;
        session
            .begin_handshake(&self.identity, role)
            .map_err(|e| MeshError::HandshakeFailed(e.to_string()))
    }

    pub async fn handshake_message(
        &self,
        peer_key: &str,
        inbound: &[u8],
    ) -> Result<HandshakeProgress, MeshError> {
        let slot = self.require(peer_key)?;
        let mut session = slot.lock().await;
        session
            .handshake_message(inbound)
            .map_err(|e| MeshError::HandshakeFailed(e.to_string()))
    }

    /// Encrypt for `peer_key`. A session that is mid-handshake (a rekey in
    /// progress) yields `SessionNotEstablished` rather than tripping the
    /// session's contract check.
    pub async fn encrypt(&self, peer_key: &str, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, MeshError> {
        let slot = self.require(peer_key)?;
        let mut session = slot.lock().await;
        if matches!(session.state(), SessionState::Handshaking | SessionState::Uninitialized) {
            return Err(MeshError::SessionNotEstablished(peer_key.to_owned()));
        }
        session
            .encrypt(plaintext, aad)
            .map_err(|e| MeshError::from_session(peer_key, e))
    }

    pub async fn decrypt(
        &self,
        peer_key: &str,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, MeshError> {
        let slot = self.require(peer_key)?;
        let mut session = slot.lock().await;
        if matches!(session.state(), SessionState::Handshaking | SessionState::Uninitialized) {
            return Err(MeshError::SessionNotEstablished(peer_key.to_owned()));
        }
        session
            .decrypt(ciphertext, aad)
            .map_err(|e| MeshError::from_session(peer_key, e))
    }

    pub async fn is_established(&self, peer_key: &str) -> bool {
        match self.session(peer_key) {
            Some(slot) => slot.lock().await.is_established(),
            None => false,
        }
    }

    pub async fn state(&self, peer_key: &str) -> Option<SessionState> {
        let slot = self.session(peer_key)?;
        let state = slot.lock().await.state();
        Some(state)
    }

    pub async fn remote_static(&self, peer_key: &str) -> Option<PublicKeyBytes> {
        let slot = self.session(peer_key)?;
        let session = slot.lock().await;
        session.remote_static().cloned()
    }

    /// Move the session from `old_key` to `new_key` after an identity
    /// promotion. An existing session under `new_key` is replaced.
    pub async fn rekey_peer_key(&self, old_key: &str, new_key: &str) -> bool {
        if old_key == new_key {
            return false;
        }
        let moved = {
            let mut sessions = self.sessions.write();
            match sessions.remove(old_key) {
                Some(slot) => {
                    sessions.insert(new_key.to_owned(), Arc::clone(&slot));
                    Some(slot)
                }
                None => None,
            }
        };
        match moved {
            Some(slot) => {
                slot.lock().await.relabel(new_key);
                tracing::debug!(old = %old_key, new = %new_key, "session re-keyed");
                true
            }
            None => false,
        }
    }

    /// Drop a half-finished handshake. Established sessions are left alone.
    pub async fn abandon_handshake(&self, peer_key: &str) {
        if let Some(slot) = self.session(peer_key) {
            let mut session = slot.lock().await;
            if session.state() == SessionState::Handshaking {
                session.reset();
            }
        }
    }

    pub fn remove(&self, peer_key: &str) -> bool {
        self.sessions.write().remove(peer_key).is_some()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Remove expired, idle or never-used sessions whose peer is not in
    /// `keep`. An expired session for a kept peer stays in place so the next
    /// use reports `RekeyRequired`. Returns how many were removed.
    pub async fn prune_at(&self, now: DateTime<Utc>, max_idle: Duration, keep: &HashSet<String>) -> usize {
        let all: Vec<(String, SessionSlot)> = self
            .sessions
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        let mut doomed = Vec::new();
        for (key, slot) in all {
            let mut session = slot.lock().await;
            let expired = session.check_expiry(now);
            let idle = now - session.last_activity() > max_idle;
            let unused = session.state() == SessionState::Uninitialized;
            if (expired || idle || unused) && !keep.contains(&key) {
                doomed.push((key, Arc::clone(&slot)));
            }
        }

        let mut sessions = self.sessions.write();
        let mut removed = 0;
        for (key, slot) in doomed {
            // Skip entries replaced while we were checking.
            if sessions.get(&key).map(|s| Arc::ptr_eq(s, &slot)).unwrap_or(false) {
                sessions.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Peers in `peers` whose session has passed its rekey threshold.
    pub async fn expired_among(&self, peers: &HashSet<String>, now: DateTime<Utc>) -> Vec<String> {
        let mut out = Vec::new();
        for peer in peers {
            if let Some(slot) = self.session(peer) {
                if slot.lock().await.check_expiry(now) {
                    out.push(peer.clone());
                }
            }
        }
        out.sort();
        out
    }
}
