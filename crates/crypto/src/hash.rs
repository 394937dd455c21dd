//! SHA-256 content hashing and derived identifiers.

use sha2::{Digest, Sha256};

/// SHA-256 of `bytes`, lowercase hex.
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Derives a document id from a content hash and a timestamp: the first 16
/// hex characters of `SHA-256(hash || "-" || timestamp)`. Callers treat the
/// result as opaque.
pub fn document_id(content_hash: &str, timestamp_ms: i64) -> String {
    let digest = Sha256::digest(format!("{content_hash}-{timestamp_ms}").as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(16);
    id
}

/// Combines a set of hashes into one digest that is independent of input
/// order: the inputs are sorted lexicographically before concatenation.
pub fn combine_hashes<S: AsRef<str>>(hashes: &[S]) -> String {
    let mut sorted: Vec<&str> = hashes.iter().map(|h| h.as_ref()).collect();
    sorted.sort_unstable();
    let mut hasher = Sha256::new();
    for h in sorted {
        hasher.update(h.as_bytes());
    }
    hex::encode(hasher.finalize())
}
