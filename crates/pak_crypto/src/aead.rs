//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Tag: 16 bytes.
//!
//! Two nonce disciplines are offered:
//! - `encrypt` / `decrypt` draw a random 24-byte nonce and prepend it
//!   (`[ nonce (24 bytes) | ciphertext + tag ]`). Used for data at rest.
//! - `seal_counter` / `open_counter` derive the nonce from a 64-bit counter
//!   that the caller transmits separately. Used for handshake payloads and
//!   transport messages, where the counter doubles as the replay sequence.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` with a 32-byte key, prepending a random 24-byte nonce.
/// `aad` is additional associated data (authenticated but not encrypted).
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;

    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce = XNonce::from_slice(nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;

    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

/// Nonce layout for counter mode: little-endian counter in the first eight
/// bytes, remaining sixteen bytes zero.
fn counter_nonce(counter: u64) -> XNonce {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    XNonce::clone_from_slice(&nonce)
}

/// Encrypt with a nonce derived from `counter`. The counter is NOT included in
/// the output; a (key, counter) pair must never be reused.
pub fn seal_counter(
    key: &[u8; 32],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    cipher
        .encrypt(&counter_nonce(counter), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)
}

/// Inverse of [`seal_counter`].
pub fn open_counter(
    key: &[u8; 32],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(&counter_nonce(counter), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_nonce_roundtrip_and_aad_binding() {
        let key = [7u8; 32];
        let ct = encrypt(&key, b"queued payload", b"pak-store-v1").unwrap();
        assert_eq!(&decrypt(&key, &ct, b"pak-store-v1").unwrap()[..], b"queued payload");
        assert!(decrypt(&key, &ct, b"other-aad").is_err());
    }

    #[test]
    fn counter_mode_rejects_wrong_counter() {
        let key = [9u8; 32];
        let ct = seal_counter(&key, 41, b"hello", b"\x05").unwrap();
        assert!(open_counter(&key, 42, &ct, b"\x05").is_err());
        assert_eq!(&open_counter(&key, 41, &ct, b"\x05").unwrap()[..], b"hello");
    }

    #[test]
    fn truncated_input_is_rejected() {
        let key = [1u8; 32];
        assert!(decrypt(&key, &[0u8; 10], b"").is_err());
        assert!(open_counter(&key, 0, &[0u8; 4], b"").is_err());
    }
}
