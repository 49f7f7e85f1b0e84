//! Payload types carried inside frames.
//!
//! `IdentityPayload` travels in cleartext; everything else is JSON sealed by
//! the peer session.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ProtoError;

pub const MESH_PROTOCOL_VERSION: u16 = 1;

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPayload {
    pub ephemeral_id: String,
    pub display_name: String,
    pub protocol_version: u16,
}

/// Sent by both sides once the session is established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSyncPayload {
    /// Revealed only to peers the sender is willing to be addressed by.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_id: Option<String>,
    #[serde(default)]
    pub queue_depth: u32,
}

/// Hop-by-hop acknowledgement of a relay envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub message_id: String,
}

/// Sorted 64-bit digests of the relay messages a node still holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDigest {
    pub hashes: Vec<u64>,
}

/// Digests the receiver lacks and wants retransmitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSyncRequest {
    pub hashes: Vec<u64>,
}

/// Single-hop application message between directly connected peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// base64url body.
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl DirectMessage {
    pub fn new(body: &[u8], sent_at: DateTime<Utc>) -> Self {
        Self {
            body: URL_SAFE_NO_PAD.encode(body),
            sent_at,
        }
    }

    pub fn decode_body(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(URL_SAFE_NO_PAD.decode(&self.body)?)
    }
}

pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    Ok(serde_json::to_vec(value)?)
}

pub fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtoError> {
    Ok(serde_json::from_slice(bytes)?)
}
