use thiserror::Error;

use pak_crypto::CryptoError;
use pak_proto::ProtoError;
use pak_store::StoreError;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Handshake timed out in phase {0}")]
    HandshakeTimeout(&'static str),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("No established session with {0}")]
    SessionNotEstablished(String),

    #[error("Session with {0} needs a fresh handshake")]
    RekeyRequired(String),

    #[error("Replay rejected")]
    ReplayRejected,

    #[error("Duplicate message {0}")]
    DuplicateMessage(String),

    #[error("Message TTL expired")]
    TtlExpired,

    #[error("Routing loop detected")]
    LoopDetected,

    #[error("Sender {0} exceeded the relay rate limit")]
    RateLimited(String),

    #[error("Queue for {0} is full")]
    QueueFull(String),

    #[error("Delivery of {message_id} failed after {attempts} attempts")]
    DeliveryFailed { message_id: String, attempts: u32 },

    #[error("Unknown connection {0}")]
    UnknownConnection(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl MeshError {
    /// Map a session-layer crypto error onto the mesh taxonomy for `peer`.
    pub fn from_session(peer: &str, err: CryptoError) -> Self {
        match err {
            CryptoError::SessionNotEstablished => MeshError::SessionNotEstablished(peer.to_owned()),
            CryptoError::RekeyRequired => MeshError::RekeyRequired(peer.to_owned()),
            CryptoError::ReplayRejected(_) => MeshError::ReplayRejected,
            other => MeshError::Crypto(other),
        }
    }
}
