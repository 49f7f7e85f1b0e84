use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch, possible tampering)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Session not established")]
    SessionNotEstablished,

    #[error("Session expired, a fresh handshake is required")]
    RekeyRequired,

    #[error("Replay rejected for counter {0}")]
    ReplayRejected(u64),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Handshake message out of order: {0}")]
    HandshakeOutOfOrder(&'static str),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
