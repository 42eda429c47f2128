//! Shared-secret integrity tag.
//!
//! The tag is `hex(sha256(body || key))` over the wire bytes exactly as
//! sent, so the receiver can check it before unwrapping anything. When no
//! key is configured the tag step is skipped on both sides.

use sha2::{Digest, Sha256};

/// Header the tag travels in.
pub const HASH_HEADER: &str = "HashSHA256";

/// Compute the integrity tag for `body` under `key`.
pub fn tag(body: &[u8], key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a received tag against `body`.
pub fn verify(body: &[u8], received: &str, key: &str) -> bool {
    tag(body, key) == received
}
