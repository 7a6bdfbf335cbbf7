//! Small shared helpers.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of `bytes`.
///
/// Used as the content address of stored payloads.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
