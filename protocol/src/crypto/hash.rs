//! # Hashing
//!
//! BLAKE3 everywhere. Block hashes, transaction ids, gossip envelope ids and
//! addresses all come out of this module, so there is exactly one place to
//! look when a digest disagrees between two nodes.
//!
//! ## Canonical encoding
//!
//! Hash inputs are built from fixed-width big-endian integers and raw byte
//! fields fed in a fixed order. Never hash a `serde_json` blob of a struct
//! whose field order you do not control; the one exception is the gossip
//! event body, which is serialized from a typed enum with a stable layout.

/// A 32-byte digest.
pub type Hash32 = [u8; 32];

/// The all-zero digest. Used as the genesis `prev_hash` and the empty
/// merkle root.
pub const ZERO_HASH: Hash32 = [0u8; 32];

/// BLAKE3 of a single buffer.
pub fn blake3_hash(data: &[u8]) -> Hash32 {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 over several slices fed in order, without concatenating them.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Domain-separated hash using BLAKE3's `derive_key` mode.
///
/// `domain_separated_hash("kestrel tx id", data)` and
/// `domain_separated_hash("kestrel block hash", data)` can never collide even
/// for identical `data`.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> Hash32 {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Binary merkle root over leaf hashes.
///
/// Odd levels duplicate their last element. An empty leaf set yields
/// [`ZERO_HASH`]; a single leaf is hashed with itself so the root is always
/// the output of a hash step. Transaction ids are unique within a block
/// (enforced by block validation), which rules out the duplicate-leaf
/// ambiguity.
pub fn merkle_root(leaves: &[Hash32]) -> Hash32 {
    if leaves.is_empty() {
        return ZERO_HASH;
    }
    if leaves.len() == 1 {
        return blake3_hash_multi(&[&leaves[0], &leaves[0]]);
    }

    let mut level: Vec<Hash32> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                blake3_hash_multi(&[&pair[0], right])
            })
            .collect();
    }
    level[0]
}

/// First 8 hex characters of a digest, for log lines.
pub fn short_hex(hash: &Hash32) -> String {
    hex::encode(&hash[..4])
}

/// Parse a 64-character hex digest, as shown to operators.
pub fn parse_hex32(s: &str) -> Option<Hash32> {
    let bytes = hex::decode(s.trim()).ok()?;
    bytes.as_slice().try_into().ok()
}
