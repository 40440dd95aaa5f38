//! Hashing and canonicalization primitives.
//!
//! Every identity in CPM derives from SHA-256: chunk hashes, file checksums,
//! the source-tree fingerprint, packet ids, and embedding fingerprints.
//! Hashes that combine multiple inputs are domain-separated so that values
//! from one surface can never collide with another.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{CpmError, Result};

/// Domain tag for the source-tree fingerprint.
pub const DOMAIN_TREE: &str = "cpm/tree/v1";
/// Domain tag for packet identity.
pub const DOMAIN_PACKET_ID: &str = "cpm/packet-id/v1";
/// Domain tag for step config hashes.
pub const DOMAIN_CONFIG: &str = "cpm/config/v1";
/// Domain tag for the embedding fingerprint.
pub const DOMAIN_EMBEDDING_FP: &str = "cpm/embedding-fp/v1";
/// Domain tag for alias cache keys.
pub const DOMAIN_ALIAS_KEY: &str = "cpm/alias/v1";

/// Compute SHA256 hash of a byte slice, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compute SHA256 hash of file contents
pub fn sha256_file(path: &Path) -> Result<String> {
    let content = std::fs::read(path).map_err(CpmError::Io)?;
    Ok(sha256_hex(&content))
}

/// Serialize a value as canonical JSON: UTF-8, object keys sorted, compact
/// separators, no trailing whitespace.
///
/// Routing through `serde_json::Value` is what sorts the keys: `Value`
/// objects are backed by a `BTreeMap`, so struct field order never leaks
/// into the output bytes.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)
        .map_err(|e| CpmError::Parse(format!("canonical JSON serialization failed: {}", e)))?;
    serde_json::to_vec(&value)
        .map_err(|e| CpmError::Parse(format!("canonical JSON serialization failed: {}", e)))
}

/// Canonical JSON as a string with a trailing LF, the on-disk form for
/// manifest.json and cpm.lock.json.
pub fn canonical_json_string<T: Serialize>(value: &T) -> Result<String> {
    let bytes = canonical_json_bytes(value)?;
    let mut s = String::from_utf8(bytes)
        .map_err(|e| CpmError::Parse(format!("canonical JSON is not UTF-8: {}", e)))?;
    s.push('\n');
    Ok(s)
}

/// SHA-256 of a value's canonical JSON form.
pub fn config_hash<T: Serialize>(params: &T) -> Result<String> {
    let bytes = canonical_json_bytes(params)?;
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_CONFIG.as_bytes());
    hasher.update([0u8]);
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Fold a sorted list of `(relpath, sha256)` pairs into the source-tree
/// fingerprint. The caller's ordering does not matter; entries are sorted
/// here so identical trees always produce identical hashes.
pub fn tree_hash(entries: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = entries.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TREE.as_bytes());
    hasher.update([0u8]);
    for (relpath, hash) in sorted {
        hasher.update(relpath.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash.as_bytes());
        hasher.update([0x0a]);
    }
    format!("{:x}", hasher.finalize())
}

/// Derive a packet id from its identity tuple. Same inputs produce the same
/// id, bit-exact, on any machine.
pub fn packet_id(
    name: &str,
    version: &str,
    build_profile: &str,
    normalized_source_path: &str,
    config_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_PACKET_ID.as_bytes());
    hasher.update([0u8]);
    for part in [name, version, build_profile, normalized_source_path, config_hash] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    format!("sha256:{:x}", hasher.finalize())
}

/// Fingerprint of an embedding configuration (model, dimension, and
/// normalization flag). Disambiguates indexes built by different embedders
/// over the same packet.
pub fn embedding_fingerprint(model: &str, dim: u32, normalized: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_EMBEDDING_FP.as_bytes());
    hasher.update([0u8]);
    hasher.update(model.as_bytes());
    hasher.update([0x1f]);
    hasher.update(dim.to_le_bytes());
    hasher.update([u8::from(normalized)]);
    format!("{:x}", hasher.finalize())
}

/// Cache key for the TTL alias cache, derived from `(host, repo, name, alias)`.
pub fn alias_cache_key(host: &str, repo: &str, name: &str, alias: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_ALIAS_KEY.as_bytes());
    hasher.update([0u8]);
    for part in [host, repo, name, alias] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    format!("{:x}", hasher.finalize())
}
