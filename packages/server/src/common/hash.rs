//! 128-bit content digests for idempotency tokens.
//!
//! Fire keys and enqueue fingerprints need to be collision-resistant across
//! every replica of the control plane, but short enough to index. SHA-256
//! truncated to 128 bits and hex-encoded gives a 32-character token.

use sha2::{Digest, Sha256};

/// Hex-encoded 128-bit digest of the given byte segments.
///
/// Segments are length-delimited before hashing so that `("ab", "c")` and
/// `("a", "bc")` produce different digests.
pub fn hex128(segments: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for segment in segments {
        hasher.update((segment.len() as u64).to_be_bytes());
        hasher.update(segment);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Fire key for one scheduled firing: unique per task name, firing window,
/// and payload.
pub fn fire_key(task_name: &str, window: i64, payload: &[u8]) -> String {
    hex128(&[task_name.as_bytes(), &window.to_be_bytes(), payload])
}
