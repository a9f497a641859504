//! # Hashing Utilities
//!
//! BLAKE3, and only BLAKE3. Used for derived token ids (a child's id commits to
//! its parent), transfer ids, and anywhere else the protocol needs a stable
//! 32-byte fingerprint.
//!
//! Every hash input that means something is domain-separated with a tag from
//! [`crate::config`], so a division-id preimage can never be confused with a
//! transfer-id preimage even if the remaining bytes collide.

/// BLAKE3 of the input.
///
/// ```
/// use otm_protocol::crypto::blake3_hash;
///
/// assert_eq!(blake3_hash(b"otm").len(), 32);
/// ```
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 over a domain tag followed by each part, in order.
///
/// The parts are fed to a single incremental hasher, so no intermediate buffer
/// is allocated. Callers are responsible for making the part layout
/// unambiguous (fixed widths, or a length prefix).
pub fn tagged_hash(tag: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag);
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Constant-time equality for 32-byte digests.
pub fn digest_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
