//! Queue sync on reconnect.
//!
//! Each side sends a [`QueueDigest`] of the message ids it holds. The other
//! side answers with a [`QueueSyncRequest`] naming only the entries it has
//! neither queued nor recently seen, so sync traffic scales with divergence.

use std::collections::{BTreeSet, HashSet};

use pak_proto::{QueueDigest, QueueSyncRequest};

/// Digest entries in `theirs` that are absent from `known`. `None` when
/// nothing is missing.
pub fn request_for(theirs: &QueueDigest, known: &HashSet<u64>) -> Option<QueueSyncRequest> {
    let missing: BTreeSet<u64> = theirs
        .hashes
        .iter()
        .copied()
        .filter(|h| !known.contains(h))
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(QueueSyncRequest {
            hashes: missing.into_iter().collect(),
        })
    }
}
