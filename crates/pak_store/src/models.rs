//! Domain records and the SQL rows they map to.
//!
//! Times are epoch milliseconds in SQL so range scans (seen-cache eviction,
//! queue ordering) stay on plain integer indexes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// ── Identity ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// base64url Ed25519 public key authenticated by the handshake.
    pub static_public_key: String,
    pub persistent_id: Option<String>,
    /// Ephemeral id of the most recent connection.
    pub ephemeral_id: Option<String>,
    pub display_name: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PeerIdentityRow {
    pub static_public_key: String,
    pub persistent_id: Option<String>,
    pub ephemeral_id: Option<String>,
    pub display_name: Option<String>,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
}

impl From<PeerIdentityRow> for PeerIdentity {
    fn from(row: PeerIdentityRow) -> Self {
        Self {
            static_public_key: row.static_public_key,
            persistent_id: row.persistent_id,
            ephemeral_id: row.ephemeral_id,
            display_name: row.display_name,
            first_seen: from_ms(row.first_seen_ms),
            last_seen: from_ms(row.last_seen_ms),
        }
    }
}

// ── Queue ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl Priority {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Result<Self, StoreError> {
        match v {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            other => Err(StoreError::InvalidValue {
                column: "priority",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Sending,
    AwaitingAck,
    Retrying,
    Delivered,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Sending => "sending",
            QueueStatus::AwaitingAck => "awaiting_ack",
            QueueStatus::Retrying => "retrying",
            QueueStatus::Delivered => "delivered",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        Ok(match s {
            "pending" => QueueStatus::Pending,
            "sending" => QueueStatus::Sending,
            "awaiting_ack" => QueueStatus::AwaitingAck,
            "retrying" => QueueStatus::Retrying,
            "delivered" => QueueStatus::Delivered,
            "failed" => QueueStatus::Failed,
            other => {
                return Err(StoreError::InvalidValue {
                    column: "status",
                    value: other.to_owned(),
                })
            }
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Delivered | QueueStatus::Failed)
    }
}

/// One message waiting for delivery to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub message_id: String,
    /// Key of the peer this copy is addressed to (next hop).
    pub peer_key: String,
    /// Serialized relay envelope.
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub status: QueueStatus,
    pub attempts: u32,
    /// Accepted from another node for forwarding rather than originated here.
    pub relayed: bool,
    pub enqueued_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub ack_deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedMessageRow {
    pub message_id: String,
    pub peer_key: String,
    pub payload_enc: String,
    pub priority: i64,
    pub status: String,
    pub attempts: i64,
    pub relayed: bool,
    pub enqueued_at_ms: i64,
    pub next_attempt_at_ms: i64,
    pub ack_deadline_ms: Option<i64>,
}

// ── Seen cache ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenMessageRecord {
    pub message_id: String,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SeenMessageRow {
    pub message_id: String,
    pub seen_at_ms: i64,
}

impl From<SeenMessageRow> for SeenMessageRecord {
    fn from(row: SeenMessageRow) -> Self {
        Self {
            message_id: row.message_id,
            seen_at: from_ms(row.seen_at_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_low_to_high() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert_eq!(Priority::from_i64(2).unwrap(), Priority::High);
        assert!(Priority::from_i64(7).is_err());
    }

    #[test]
    fn status_strings_are_stable() {
        for s in [
            QueueStatus::Pending,
            QueueStatus::Sending,
            QueueStatus::AwaitingAck,
            QueueStatus::Retrying,
            QueueStatus::Delivered,
            QueueStatus::Failed,
        ] {
            assert_eq!(QueueStatus::parse(s.as_str()).unwrap(), s);
        }
    }
}
