//! Per-peer transport session.
//!
//! A `NoiseLikeSession` wraps one handshake and the transport keys it yields.
//!
//! ```text
//! Uninitialized ──begin_handshake──▶ Handshaking ──finish──▶ Established
//!        ▲                                ▲                      │
//!        └──────────── reset ◀────────────┴── begin_handshake ◀──┤
//!                                                   Expired ◀────┘ (count / age)
//! ```
//!
//! Wire format of a sealed message:
//! `[ counter (u64 BE, 8 bytes) | XChaCha20-Poly1305 ciphertext + tag ]`.
//! The counter is the send nonce and the receive-side replay sequence.
//!
//! Starting a new handshake discards the previous keys and replay state;
//! there is never more than one key set alive per session object.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    aead,
    error::CryptoError,
    handshake::{HandshakeState, Role, TransportKeys},
    identity::{IdentityKeyPair, PublicKeyBytes},
    replay::ReplayWindow,
};

const COUNTER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Established,
    Expired,
}

#[derive(Debug, Clone)]
pub struct RekeyPolicy {
    /// Sent plus received messages before the session is retired.
    pub max_messages: u64,
    pub max_age: Duration,
}

impl Default for RekeyPolicy {
    fn default() -> Self {
        Self {
            max_messages: 10_000,
            max_age: Duration::hours(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub rekey: RekeyPolicy,
    /// Panic on encrypt/decrypt before the session is established instead of
    /// returning `SessionNotEstablished`.
    pub strict_contracts: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rekey: RekeyPolicy::default(),
            strict_contracts: cfg!(debug_assertions),
        }
    }
}

/// Result of feeding a handshake message to a session.
#[derive(Debug, Default)]
pub struct HandshakeProgress {
    /// Bytes to send back to the peer, if the pattern calls for a reply.
    pub outbound: Option<Vec<u8>>,
    /// Payload the peer attached to the message just read.
    pub payload: Vec<u8>,
    /// The handshake finished with this message.
    pub established: bool,
}

pub struct NoiseLikeSession {
    peer_key: String,
    state: SessionState,
    config: SessionConfig,
    handshake: Option<HandshakeState>,
    keys: Option<TransportKeys>,
    send_nonce: u64,
    replay: ReplayWindow,
    established_at: Option<DateTime<Utc>>,
    last_activity: DateTime<Utc>,
    message_count: u64,
}

impl NoiseLikeSession {
    pub fn new(peer_key: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            peer_key: peer_key.into(),
            state: SessionState::Uninitialized,
            config,
            handshake: None,
            keys: None,
            send_nonce: 0,
            replay: ReplayWindow::new(),
            established_at: None,
            last_activity: Utc::now(),
            message_count: 0,
        }
    }

    pub fn peer_key(&self) -> &str {
        &self.peer_key
    }

    /// Re-label the session after the peer's identifier was promoted.
    pub fn relabel(&mut self, new_key: impl Into<String>) {
        self.peer_key = new_key.into();
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn established_at(&self) -> Option<DateTime<Utc>> {
        self.established_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn send_nonce(&self) -> u64 {
        self.send_nonce
    }

    pub fn session_id(&self) -> Option<String> {
        self.keys.as_ref().map(TransportKeys::session_id)
    }

    pub fn remote_static(&self) -> Option<&PublicKeyBytes> {
        self.keys.as_ref().map(|k| &k.remote_static)
    }

    pub fn role(&self) -> Option<Role> {
        self.handshake.as_ref().map(HandshakeState::role)
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    /// Discard any existing keys and start a fresh handshake.
    ///
    /// For the initiator this returns the first handshake message.
    pub fn begin_handshake(
        &mut self,
        identity: &IdentityKeyPair,
        role: Role,
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        self.reset();
        let mut hs = HandshakeState::new(identity, role)?;
        let first = if role == Role::Initiator {
            Some(hs.write_message(&[])?)
        } else {
            None
        };
        self.handshake = Some(hs);
        self.state = SessionState::Handshaking;
        self.last_activity = Utc::now();
        Ok(first)
    }

    /// Feed an inbound handshake message; returns the reply (if any).
    pub fn handshake_message(&mut self, inbound: &[u8]) -> Result<HandshakeProgress, CryptoError> {
        self.handshake_message_at(inbound, Utc::now())
    }

    pub fn handshake_message_at(
        &mut self,
        inbound: &[u8],
        now: DateTime<Utc>,
    ) -> Result<HandshakeProgress, CryptoError> {
        let hs = self
            .handshake
            .as_mut()
            .ok_or(CryptoError::HandshakeOutOfOrder("no handshake in progress"))?;

        let payload = match hs.read_message(inbound) {
            Ok(p) => p,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };
        let outbound = if !hs.is_finished() && hs.is_my_turn() {
            Some(hs.write_message(&[])?)
        } else {
            None
        };

        let established = hs.is_finished();
        if established {
            self.finish(now)?;
        }
        Ok(HandshakeProgress { outbound, payload, established })
    }

    fn finish(&mut self, now: DateTime<Utc>) -> Result<(), CryptoError> {
        let hs = self
            .handshake
            .take()
            .ok_or(CryptoError::HandshakeOutOfOrder("no handshake in progress"))?;
        let keys = hs.into_transport()?;
        tracing::debug!(peer = %self.peer_key, session = %keys.session_id(), "session established");
        self.keys = Some(keys);
        self.state = SessionState::Established;
        self.send_nonce = 0;
        self.replay = ReplayWindow::new();
        self.established_at = Some(now);
        self.last_activity = now;
        self.message_count = 0;
        Ok(())
    }

    /// Drop keys and handshake state, returning to `Uninitialized`.
    pub fn reset(&mut self) {
        self.handshake = None;
        self.keys = None;
        self.send_nonce = 0;
        self.replay = ReplayWindow::new();
        self.established_at = None;
        self.message_count = 0;
        self.state = SessionState::Uninitialized;
    }

    // ── Lifetime ──────────────────────────────────────────────────────────────

    /// Move to `Expired` if the message-count or age threshold was crossed.
    /// Returns true if the session is (now) expired.
    pub fn check_expiry(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == SessionState::Expired {
            return true;
        }
        if self.state != SessionState::Established {
            return false;
        }
        let too_many = self.message_count >= self.config.rekey.max_messages;
        let too_old = self
            .established_at
            .map(|t| now - t >= self.config.rekey.max_age)
            .unwrap_or(false);
        if too_many || too_old {
            tracing::info!(
                peer = %self.peer_key,
                messages = self.message_count,
                "session reached rekey threshold"
            );
            self.keys = None;
            self.state = SessionState::Expired;
            return true;
        }
        false
    }

    fn require_established(&mut self, now: DateTime<Utc>) -> Result<(), CryptoError> {
        if self.check_expiry(now) {
            return Err(CryptoError::RekeyRequired);
        }
        if self.state != SessionState::Established {
            if self.config.strict_contracts {
                panic!(
                    "session for {} used in state {:?} before handshake completed",
                    self.peer_key, self.state
                );
            }
            return Err(CryptoError::SessionNotEstablished);
        }
        Ok(())
    }

    // ── Transport ─────────────────────────────────────────────────────────────

    pub fn encrypt(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encrypt_at(plaintext, aad, Utc::now())
    }

    pub fn encrypt_at(
        &mut self,
        plaintext: &[u8],
        aad: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, CryptoError> {
        self.require_established(now)?;
        let keys = self.keys.as_ref().ok_or(CryptoError::SessionNotEstablished)?;
        let counter = self.send_nonce;
        let sealed = aead::seal_counter(&keys.send_key, counter, plaintext, aad)?;

        self.send_nonce = counter
            .checked_add(1)
            .ok_or(CryptoError::RekeyRequired)?;
        self.message_count += 1;
        self.last_activity = now;

        let mut out = Vec::with_capacity(COUNTER_LEN + sealed.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&mut self, data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.decrypt_at(data, aad, Utc::now())
    }

    pub fn decrypt_at(
        &mut self,
        data: &[u8],
        aad: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.require_established(now)?;
        if data.len() < COUNTER_LEN + aead::TAG_LEN {
            return Err(CryptoError::AeadDecrypt);
        }
        let (counter_bytes, sealed) = data.split_at(COUNTER_LEN);
        let mut arr = [0u8; COUNTER_LEN];
        arr.copy_from_slice(counter_bytes);
        let counter = u64::from_be_bytes(arr);

        self.replay.check(counter)?;
        let keys = self.keys.as_ref().ok_or(CryptoError::SessionNotEstablished)?;
        let plaintext = aead::open_counter(&keys.recv_key, counter, sealed, aad)?;
        self.replay.commit(counter);

        self.message_count += 1;
        self.last_activity = now;
        Ok(plaintext)
    }
}

impl std::fmt::Debug for NoiseLikeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseLikeSession")
            .field("peer_key", &self.peer_key)
            .field("state", &self.state)
            .field("send_nonce", &self.send_nonce)
            .field("message_count", &self.message_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lenient() -> SessionConfig {
        SessionConfig {
            strict_contracts: false,
            ..SessionConfig::default()
        }
    }

    fn established_pair(config: SessionConfig) -> (NoiseLikeSession, NoiseLikeSession) {
        let a_id = IdentityKeyPair::generate().unwrap();
        let b_id = IdentityKeyPair::generate().unwrap();
        let mut a = NoiseLikeSession::new("bob", config.clone());
        let mut b = NoiseLikeSession::new("alice", config);

        let m1 = a.begin_handshake(&a_id, Role::Initiator).unwrap().unwrap();
        assert!(b.begin_handshake(&b_id, Role::Responder).unwrap().is_none());
        let m2 = b.handshake_message(&m1).unwrap().outbound.unwrap();
        let step = a.handshake_message(&m2).unwrap();
        assert!(step.established);
        let fin = b.handshake_message(&step.outbound.unwrap()).unwrap();
        assert!(fin.established && fin.outbound.is_none());
        (a, b)
    }

    #[test]
    fn established_sessions_exchange_messages() {
        let (mut a, mut b) = established_pair(lenient());
        assert_eq!(a.session_id(), b.session_id());

        let ct = a.encrypt(b"hello", &[4]).unwrap();
        assert_eq!(&b.decrypt(&ct, &[4]).unwrap()[..], b"hello");
        let reply = b.encrypt(b"hi", &[4]).unwrap();
        assert_eq!(&a.decrypt(&reply, &[4]).unwrap()[..], b"hi");
        assert_eq!(a.message_count(), 2);
    }

    #[test]
    fn replayed_ciphertext_is_rejected() {
        let (mut a, mut b) = established_pair(lenient());
        let ct = a.encrypt(b"once", &[4]).unwrap();
        b.decrypt(&ct, &[4]).unwrap();
        assert!(matches!(b.decrypt(&ct, &[4]), Err(CryptoError::ReplayRejected(0))));
    }

    #[test]
    fn out_of_order_delivery_is_accepted() {
        let (mut a, mut b) = established_pair(lenient());
        let c0 = a.encrypt(b"0", &[4]).unwrap();
        let c1 = a.encrypt(b"1", &[4]).unwrap();
        b.decrypt(&c1, &[4]).unwrap();
        b.decrypt(&c0, &[4]).unwrap();
    }

    #[test]
    fn forged_frame_does_not_advance_window() {
        let (mut a, mut b) = established_pair(lenient());
        let mut forged = a.encrypt(b"x", &[4]).unwrap();
        let real = forged.clone();
        let last = forged.len() - 1;
        forged[last] ^= 0xff;
        assert!(b.decrypt(&forged, &[4]).is_err());
        b.decrypt(&real, &[4]).unwrap();
    }

    #[test]
    fn send_nonces_strictly_increase() {
        let (mut a, _b) = established_pair(lenient());
        let c0 = a.encrypt(b"a", &[4]).unwrap();
        let c1 = a.encrypt(b"b", &[4]).unwrap();
        assert_eq!(&c0[..8], &0u64.to_be_bytes());
        assert_eq!(&c1[..8], &1u64.to_be_bytes());
    }

    #[test]
    fn message_count_threshold_forces_rekey() {
        let (mut a, mut b) = established_pair(lenient());
        for i in 0..10_000u32 {
            let ct = a.encrypt(&i.to_be_bytes(), &[4]).unwrap();
            if i % 1_000 == 0 {
                b.decrypt(&ct, &[4]).unwrap();
            }
        }
        assert!(matches!(a.encrypt(b"10001", &[4]), Err(CryptoError::RekeyRequired)));
        assert_eq!(a.state(), SessionState::Expired);
        assert!(a.session_id().is_none());
    }

    #[test]
    fn age_threshold_expires_session() {
        let (mut a, _b) = established_pair(lenient());
        let later = Utc::now() + Duration::hours(2);
        assert!(a.check_expiry(later));
        assert!(matches!(a.encrypt_at(b"late", &[4], later), Err(CryptoError::RekeyRequired)));
    }

    #[test]
    fn rekey_handshake_replaces_keys() {
        let (mut a, mut b) = established_pair(lenient());
        let old_id = a.session_id();
        let a_id = IdentityKeyPair::generate().unwrap();
        let b_id = IdentityKeyPair::generate().unwrap();

        let m1 = a.begin_handshake(&a_id, Role::Initiator).unwrap().unwrap();
        assert_eq!(a.state(), SessionState::Handshaking);
        b.begin_handshake(&b_id, Role::Responder).unwrap();
        let m2 = b.handshake_message(&m1).unwrap().outbound.unwrap();
        let m3 = a.handshake_message(&m2).unwrap().outbound.unwrap();
        b.handshake_message(&m3).unwrap();

        assert_ne!(a.session_id(), old_id);
        assert_eq!(a.send_nonce(), 0);
        let ct = a.encrypt(b"fresh", &[4]).unwrap();
        assert_eq!(&b.decrypt(&ct, &[4]).unwrap()[..], b"fresh");
    }

    #[test]
    fn lenient_contract_returns_not_established() {
        let mut s = NoiseLikeSession::new("peer", lenient());
        assert!(matches!(s.encrypt(b"early", &[4]), Err(CryptoError::SessionNotEstablished)));
        assert!(matches!(
            s.decrypt(&[0u8; 32], &[4]),
            Err(CryptoError::SessionNotEstablished)
        ));
    }

    #[test]
    #[should_panic(expected = "before handshake completed")]
    fn strict_contract_panics() {
        let mut s = NoiseLikeSession::new(
            "peer",
            SessionConfig {
                strict_contracts: true,
                ..SessionConfig::default()
            },
        );
        let _ = s.encrypt(b"early", &[4]);
    }

    #[test]
    fn corrupt_handshake_message_resets_session() {
        let id = IdentityKeyPair::generate().unwrap();
        let mut s = NoiseLikeSession::new("peer", lenient());
        s.begin_handshake(&id, Role::Initiator).unwrap();
        assert!(s.handshake_message(&[1, 2, 3]).is_err());
        assert_eq!(s.state(), SessionState::Uninitialized);
    }
}
