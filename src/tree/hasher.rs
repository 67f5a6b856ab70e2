//! BLAKE3 hashing: file contents and the canonical snapshot encoding

use crate::types::Hash;
use blake3::Hasher;

/// Compute content hash for file bytes
pub fn compute_content_hash(content: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(content);
    *hasher.finalize().as_bytes()
}

/// Hash a set of canonical encoding lines
///
/// Lines are sorted before hashing, so callers may produce them in any order.
/// Each line is length-prefixed (8 bytes, big-endian) so that no two distinct
/// line sets share a byte stream.
pub fn hash_canonical_lines(mut lines: Vec<String>) -> Hash {
    lines.sort();
    let mut hasher = Hasher::new();
    hasher.update(&(lines.len() as u64).to_be_bytes());
    for line in &lines {
        hasher.update(&(line.len() as u64).to_be_bytes());
        hasher.update(line.as_bytes());
    }
    *hasher.finalize().as_bytes()
}
