//! Canonical serialization for form fingerprints.
//!
//! A session records the fingerprint of the form it started on so that a
//! form edited mid-session can be detected. The fingerprint must therefore
//! be stable across processes:
//!
//! - Struct fields serialize in declaration order
//! - Questions are hashed after sorting by position
//! - Maps in hashed data are BTreeMaps, never HashMaps

use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

/// Seed for all fingerprint hashes.
const FINGERPRINT_SEED: u64 = 0;

/// Serialize a value to canonical JSON bytes.
///
/// Serialization of the crate's own types cannot fail (no non-string map
/// keys, no fallible `Serialize` impls); an empty buffer is returned if a
/// foreign type ever does.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Compute the canonical xxh64 hash of a serializable value.
pub fn canonical_hash<T: Serialize>(value: &T) -> u64 {
    xxh64(&to_canonical_bytes(value), FINGERPRINT_SEED)
}

/// Compute the canonical hash as a 16-digit hex string.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> String {
    format!("{:016x}", canonical_hash(value))
}
