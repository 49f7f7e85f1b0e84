//! BLAKE3-based hash utilities
//!
//! - Deterministic relay message IDs
//! - Compact queue-digest entries
//! - Persistent node identifiers derived from static public keys

pub fn hash(data: &[u8]) -> [u8; 32] {
    blake3::hash(data).into()
}

/// Derive the deterministic message ID every node computes for a relayed
/// message: H(tag || created_at_ms || original_sender || content).
pub fn message_id(created_at_ms: i64, original_sender: &str, content: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"pak-msg-id-v1\x00");
    hasher.update(&created_at_ms.to_be_bytes());
    hasher.update(b"\x00");
    hasher.update(original_sender.as_bytes());
    hasher.update(b"\x00");
    hasher.update(content);
    hex::encode(hasher.finalize().as_bytes())
}

/// 64-bit digest entry for a message id, used by queue sync.
pub fn digest_entry(message_id: &str) -> u64 {
    let h = blake3::hash(message_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&h.as_bytes()[..8]);
    u64::from_be_bytes(prefix)
}

/// Stable node identifier: hex of the first 16 bytes of BLAKE3(static key).
pub fn persistent_id(static_public_key: &[u8]) -> String {
    let h = blake3::hash(static_public_key);
    hex::encode(&h.as_bytes()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_covers_every_input() {
        let base = message_id(1_700_000_000_000, "alice", b"hi");
        assert_eq!(base, message_id(1_700_000_000_000, "alice", b"hi"));
        assert_ne!(base, message_id(1_700_000_000_001, "alice", b"hi"));
        assert_ne!(base, message_id(1_700_000_000_000, "bob", b"hi"));
        assert_ne!(base, message_id(1_700_000_000_000, "alice", b"ho"));
        assert_eq!(base.len(), 64);
    }

    #[test]
    fn persistent_id_is_32_hex_chars() {
        let id = persistent_id(&[4u8; 32]);
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
