//! Relay envelope: what every intermediate hop sees.
//!
//! A relay node reads only the routing header:
//!   - message_id      (deterministic, recomputed and checked on receipt)
//!   - original_sender (rate-limit key)
//!   - final_recipient (local-delivery and next-hop decision)
//!   - ttl             (remaining transmissions)
//!   - visited_hops    (loop prevention)
//!   - created_at      (input to the message id; epoch millis on the wire)
//!
//! The payload is opaque to relays.

use std::collections::BTreeSet;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pak_crypto::hash;

use crate::error::ProtoError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub message_id: String,
    pub original_sender: String,
    pub final_recipient: String,
    pub ttl: u8,
    #[serde(default)]
    pub visited_hops: BTreeSet<String>,
    /// base64url payload.
    pub payload: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl RelayEnvelope {
    /// Build a fresh envelope originating at `original_sender`.
    ///
    /// `created_at` is truncated to millisecond precision so the id survives
    /// a trip through the wire format.
    pub fn new(
        original_sender: impl Into<String>,
        final_recipient: impl Into<String>,
        payload: &[u8],
        ttl: u8,
        created_at: DateTime<Utc>,
    ) -> Self {
        let original_sender = original_sender.into();
        let created_ms = created_at.timestamp_millis();
        let created_at = DateTime::from_timestamp_millis(created_ms).unwrap_or(created_at);
        let message_id = hash::message_id(created_ms, &original_sender, payload);
        let mut visited_hops = BTreeSet::new();
        visited_hops.insert(original_sender.clone());
        Self {
            message_id,
            original_sender,
            final_recipient: final_recipient.into(),
            ttl,
            visited_hops,
            payload: URL_SAFE_NO_PAD.encode(payload),
            created_at,
        }
    }

    pub fn decode_payload(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(URL_SAFE_NO_PAD.decode(&self.payload)?)
    }

    /// Recompute the deterministic id and compare it to the advertised one.
    pub fn verify_id(&self) -> Result<(), ProtoError> {
        let payload = self.decode_payload()?;
        let expected = hash::message_id(
            self.created_at.timestamp_millis(),
            &self.original_sender,
            &payload,
        );
        if expected != self.message_id {
            return Err(ProtoError::MessageIdMismatch);
        }
        Ok(())
    }

    pub fn has_visited(&self, node: &str) -> bool {
        self.visited_hops.contains(node)
    }

    /// Copy for onward transmission: one hop spent, `node` recorded.
    pub fn forwarded_by(&self, node: &str) -> Self {
        let mut next = self.clone();
        next.ttl = self.ttl.saturating_sub(1);
        next.visited_hops.insert(node.to_owned());
        next
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
