//! pak_crypto — PakConnect mesh cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Session keys never outlive their rekey threshold.
//!
//! # Module layout
//! - `identity`   — long-term Ed25519 identity, Ed25519→X25519 mapping, node ids
//! - `handshake`  — XX-pattern mutually authenticated key agreement
//! - `session`    — NoiseLikeSession: transport keys, nonces, rekey policy
//! - `replay`     — sliding-window replay protection
//! - `aead`       — XChaCha20-Poly1305 encrypt/decrypt helpers
//! - `kdf`        — HKDF / Argon2id key derivation
//! - `hash`       — BLAKE3 utilities (message IDs, digests, persistent ids)
//! - `error`      — unified error type

pub mod aead;
pub mod error;
pub mod handshake;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod replay;
pub mod session;

pub use error::CryptoError;
pub use handshake::Role;
pub use identity::{IdentityKeyPair, PublicKeyBytes};
pub use session::{NoiseLikeSession, RekeyPolicy, SessionConfig, SessionState};
