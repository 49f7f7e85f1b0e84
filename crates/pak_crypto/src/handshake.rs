//! Three-message mutually authenticated handshake (XX pattern).
//!
//! ```text
//!   -> e
//!   <- e, ee, s, es
//!   -> s, se
//! ```
//!
//! Statics are the nodes' Ed25519 identity keys, carried encrypted and mapped
//! onto X25519 for the DH legs. The handshake hash `h` is SHA-256; the chaining
//! key is advanced with HKDF-SHA256 and payloads are sealed with
//! XChaCha20-Poly1305 using `h` as associated data, so every byte on the wire
//! is bound into the transcript.
//!
//! A `HandshakeState` is single-use. After the third message both sides call
//! [`HandshakeState::into_transport`] to obtain directional keys and the
//! transcript hash, which serves as the session id.

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    aead,
    error::CryptoError,
    identity::{ed25519_pub_to_x25519, IdentityKeyPair, PublicKeyBytes},
    kdf,
};

pub const PROTOCOL_NAME: &[u8] = b"pak-mesh-XX-25519-XChaChaPoly-SHA256";

const DH_LEN: usize = 32;
const STATIC_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The side with the lexicographically smaller ephemeral id initiates.
    pub fn from_ephemeral_ids(ours: &str, theirs: &str) -> Self {
        if ours < theirs {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

// ── Symmetric state ───────────────────────────────────────────────────────────

#[derive(ZeroizeOnDrop)]
struct SymmetricState {
    ck: [u8; 32],
    h: [u8; 32],
    k: Option<[u8; 32]>,
    n: u64,
}

impl SymmetricState {
    fn new(protocol_name: &[u8]) -> Self {
        let mut h = [0u8; 32];
        if protocol_name.len() <= 32 {
            h[..protocol_name.len()].copy_from_slice(protocol_name);
        } else {
            h.copy_from_slice(&Sha256::digest(protocol_name));
        }
        Self { ck: h, h, k: None, n: 0 }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h.copy_from_slice(&hasher.finalize());
    }

    fn mix_key(&mut self, ikm: &[u8]) -> Result<(), CryptoError> {
        let (ck, k) = kdf::hkdf2(&self.ck, ikm)?;
        self.ck = ck;
        self.k = Some(k);
        self.n = 0;
        Ok(())
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let out = match &self.k {
            Some(k) => {
                let ct = aead::seal_counter(k, self.n, plaintext, &self.h)?;
                self.n += 1;
                ct
            }
            None => plaintext.to_vec(),
        };
        self.mix_hash(&out);
        Ok(out)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let out = match &self.k {
            Some(k) => {
                let pt = aead::open_counter(k, self.n, ciphertext, &self.h)
                    .map_err(|_| CryptoError::Handshake("payload authentication failed".into()))?;
                self.n += 1;
                pt.to_vec()
            }
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        Ok(out)
    }

    fn split(&self) -> Result<([u8; 32], [u8; 32]), CryptoError> {
        kdf::hkdf2(&self.ck, &[])
    }

    fn sealed_len(&self, plaintext_len: usize) -> usize {
        if self.k.is_some() {
            plaintext_len + aead::TAG_LEN
        } else {
            plaintext_len
        }
    }
}

// ── Transport output ──────────────────────────────────────────────────────────

/// Keys handed to the transport session once the handshake finishes.
#[derive(ZeroizeOnDrop)]
pub struct TransportKeys {
    pub send_key: [u8; 32],
    pub recv_key: [u8; 32],
    #[zeroize(skip)]
    pub handshake_hash: [u8; 32],
    #[zeroize(skip)]
    pub remote_static: PublicKeyBytes,
}

impl TransportKeys {
    pub fn session_id(&self) -> String {
        hex::encode(self.handshake_hash)
    }
}

// ── Handshake state machine ───────────────────────────────────────────────────

pub struct HandshakeState {
    role: Role,
    symmetric: SymmetricState,
    s_public: [u8; 32],
    s_secret: StaticSecret,
    e: Option<StaticSecret>,
    re: Option<X25519Public>,
    rs: Option<PublicKeyBytes>,
    /// Index of the next message in the pattern (0..=3).
    step: usize,
}

impl HandshakeState {
    pub fn new(identity: &IdentityKeyPair, role: Role) -> Result<Self, CryptoError> {
        let mut symmetric = SymmetricState::new(PROTOCOL_NAME);
        // Empty prologue.
        symmetric.mix_hash(&[]);
        Ok(Self {
            role,
            symmetric,
            s_public: identity.public.as_array()?,
            s_secret: identity.to_x25519_secret(),
            e: None,
            re: None,
            rs: None,
            step: 0,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_finished(&self) -> bool {
        self.step >= 3
    }

    /// True when the next pattern message is ours to write.
    pub fn is_my_turn(&self) -> bool {
        match self.role {
            Role::Initiator => self.step == 0 || self.step == 2,
            Role::Responder => self.step == 1,
        }
    }

    pub fn remote_static(&self) -> Option<&PublicKeyBytes> {
        self.rs.as_ref()
    }

    pub fn write_message(&mut self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.is_finished() {
            return Err(CryptoError::HandshakeOutOfOrder("handshake already finished"));
        }
        if !self.is_my_turn() {
            return Err(CryptoError::HandshakeOutOfOrder("not our turn to write"));
        }
        let mut out = Vec::new();
        match self.step {
            0 => {
                self.write_e(&mut out);
            }
            1 => {
                self.write_e(&mut out);
                self.dh_ee()?;
                self.write_s(&mut out)?;
                // es: responder side uses its static with the initiator's ephemeral.
                self.dh_local_static_remote_ephemeral()?;
            }
            _ => {
                self.write_s(&mut out)?;
                // se: initiator side uses its static with the responder's ephemeral.
                self.dh_local_static_remote_ephemeral()?;
            }
        }
        out.extend(self.symmetric.encrypt_and_hash(payload)?);
        self.step += 1;
        Ok(out)
    }

    pub fn read_message(&mut self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.is_finished() {
            return Err(CryptoError::HandshakeOutOfOrder("handshake already finished"));
        }
        if self.is_my_turn() {
            return Err(CryptoError::HandshakeOutOfOrder("expected to write, not read"));
        }
        let mut rest = message;
        match self.step {
            0 => {
                rest = self.read_e(rest)?;
            }
            1 => {
                rest = self.read_e(rest)?;
                self.dh_ee()?;
                rest = self.read_s(rest)?;
                self.dh_local_ephemeral_remote_static()?;
            }
            _ => {
                rest = self.read_s(rest)?;
                self.dh_local_ephemeral_remote_static()?;
            }
        }
        let payload = self.symmetric.decrypt_and_hash(rest)?;
        self.step += 1;
        Ok(payload)
    }

    /// Consume the finished handshake and derive directional transport keys.
    pub fn into_transport(self) -> Result<TransportKeys, CryptoError> {
        if !self.is_finished() {
            return Err(CryptoError::HandshakeOutOfOrder("handshake not finished"));
        }
        let remote_static = self
            .rs
            .clone()
            .ok_or_else(|| CryptoError::Handshake("remote static key missing".into()))?;
        let (k1, k2) = self.symmetric.split()?;
        let (send_key, recv_key) = match self.role {
            Role::Initiator => (k1, k2),
            Role::Responder => (k2, k1),
        };
        Ok(TransportKeys {
            send_key,
            recv_key,
            handshake_hash: self.symmetric.h,
            remote_static,
        })
    }

    // ── Tokens ────────────────────────────────────────────────────────────────

    fn write_e(&mut self, out: &mut Vec<u8>) {
        let e = StaticSecret::random_from_rng(OsRng);
        let e_pub = X25519Public::from(&e);
        self.symmetric.mix_hash(e_pub.as_bytes());
        out.extend_from_slice(e_pub.as_bytes());
        self.e = Some(e);
    }

    fn read_e<'a>(&mut self, input: &'a [u8]) -> Result<&'a [u8], CryptoError> {
        if input.len() < DH_LEN {
            return Err(CryptoError::Handshake("truncated ephemeral key".into()));
        }
        let (e_bytes, rest) = input.split_at(DH_LEN);
        let mut arr = [0u8; DH_LEN];
        arr.copy_from_slice(e_bytes);
        self.symmetric.mix_hash(&arr);
        self.re = Some(X25519Public::from(arr));
        Ok(rest)
    }

    fn write_s(&mut self, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let s_public = self.s_public;
        out.extend(self.symmetric.encrypt_and_hash(&s_public)?);
        Ok(())
    }

    fn read_s<'a>(&mut self, input: &'a [u8]) -> Result<&'a [u8], CryptoError> {
        let len = self.symmetric.sealed_len(STATIC_LEN);
        if input.len() < len {
            return Err(CryptoError::Handshake("truncated static key".into()));
        }
        let (s_bytes, rest) = input.split_at(len);
        let rs = self.symmetric.decrypt_and_hash(s_bytes)?;
        self.rs = Some(PublicKeyBytes::from_slice(&rs)?);
        Ok(rest)
    }

    fn dh_ee(&mut self) -> Result<(), CryptoError> {
        let e = self.e.as_ref().ok_or(CryptoError::HandshakeOutOfOrder("local ephemeral missing"))?;
        let re = self.re.ok_or(CryptoError::HandshakeOutOfOrder("remote ephemeral missing"))?;
        let mut shared = e.diffie_hellman(&re).to_bytes();
        let res = self.symmetric.mix_key(&shared);
        shared.zeroize();
        res
    }

    fn dh_local_static_remote_ephemeral(&mut self) -> Result<(), CryptoError> {
        let re = self.re.ok_or(CryptoError::HandshakeOutOfOrder("remote ephemeral missing"))?;
        let mut shared = self.s_secret.diffie_hellman(&re).to_bytes();
        let res = self.symmetric.mix_key(&shared);
        shared.zeroize();
        res
    }

    fn dh_local_ephemeral_remote_static(&mut self) -> Result<(), CryptoError> {
        let e = self.e.as_ref().ok_or(CryptoError::HandshakeOutOfOrder("local ephemeral missing"))?;
        let rs = self
            .rs
            .as_ref()
            .ok_or(CryptoError::HandshakeOutOfOrder("remote static missing"))?;
        let rs_x = ed25519_pub_to_x25519(&rs.as_array()?)?;
        let mut shared = e.diffie_hellman(&rs_x).to_bytes();
        let res = self.symmetric.mix_key(&shared);
        shared.zeroize();
        res
    }
}
