use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One semantic segment of one source file.
///
/// Ids have the form `<relpath>:<counter>` with a per-file counter starting
/// at 0, so ids stay stable when unrelated files are added to the source
/// tree. Immutable once written into a packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocChunk {
    pub id: String,
    pub text: String,
    /// SHA-256 hex of `text`; the incremental-reuse key.
    pub hash: String,
    /// Scalar metadata; always carries `path` and `ext`.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl DocChunk {
    /// Metadata value as a string, if present and scalar.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Metadata value as an integer, if present.
    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }
}

/// Describes the embedding model that produced a packet's vectors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingSpec {
    pub provider: String,
    pub model: String,
    pub dim: u32,
    /// `f16` or `f32`.
    pub dtype: String,
    pub normalized: bool,
    pub max_seq_length: Option<u32>,
}

/// Similarity contract: inner product over normalized vectors, flat index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilaritySpec {
    pub space: String,
    pub index_type: String,
}

impl Default for SimilaritySpec {
    fn default() -> Self {
        Self {
            space: "ip".to_string(),
            index_type: "flat".to_string(),
        }
    }
}

/// Relative file names of the packet payload. `vectors` and `index` are
/// nullable to signal partial success (embedding failed after chunk-write).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilesSpec {
    pub docs: String,
    pub vectors: Option<String>,
    pub index: Option<String>,
    pub calibration: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Counts {
    pub docs: usize,
    pub vectors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceInfo {
    /// POSIX-normalized source path as given to the builder.
    pub path: String,
    /// Domain-separated fold of sorted (relpath, sha256) pairs.
    pub tree_hash: String,
}

/// Incremental-reuse accounting for one build.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IncrementalInfo {
    pub enabled: bool,
    pub reused: usize,
    pub embedded: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checksum {
    pub algo: String,
    pub value: String,
}

impl Checksum {
    pub fn sha256(value: String) -> Self {
        Self {
            algo: "sha256".to_string(),
            value,
        }
    }
}

/// The packet manifest, written twice by the builder: once tentatively
/// before embedding, once finally with checksums after success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PacketManifest {
    pub schema_version: String,
    pub packet_id: String,
    pub embedding: EmbeddingSpec,
    pub similarity: SimilaritySpec,
    pub files: FilesSpec,
    pub counts: Counts,
    pub source: SourceInfo,
    /// CPM version that produced the packet.
    pub cpm: String,
    pub incremental: IncrementalInfo,
    pub checksums: BTreeMap<String, Checksum>,
    pub extras: BTreeMap<String, serde_json::Value>,
}

pub const MANIFEST_SCHEMA_VERSION: &str = "1.0";

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> DocChunk {
        let mut metadata = BTreeMap::new();
        metadata.insert("path".to_string(), serde_json::json!("src/a.py"));
        metadata.insert("ext".to_string(), serde_json::json!("py"));
        metadata.insert("line_start".to_string(), serde_json::json!(1));
        DocChunk {
            id: "src/a.py:0".to_string(),
            text: "def main(): pass".to_string(),
            hash: crate::hash::sha256_hex(b"def main(): pass"),
            metadata,
        }
    }

    #[test]
    fn test_chunk_serialization_field_order() {
        // docs.jsonl line schema: id, text, hash, metadata in that order.
        let json = serde_json::to_string(&chunk()).unwrap();
        let id_pos = json.find("\"id\"").unwrap();
        let text_pos = json.find("\"text\"").unwrap();
        let hash_pos = json.find("\"hash\"").unwrap();
        let meta_pos = json.find("\"metadata\"").unwrap();
        assert!(id_pos < text_pos && text_pos < hash_pos && hash_pos < meta_pos);
    }

    #[test]
    fn test_chunk_metadata_keys_sorted() {
        let json = serde_json::to_string(&chunk()).unwrap();
        // BTreeMap: ext < line_start < path
        let ext_pos = json.find("\"ext\"").unwrap();
        let line_pos = json.find("\"line_start\"").unwrap();
        let path_pos = json.find("\"path\"").unwrap();
        assert!(ext_pos < line_pos && line_pos < path_pos);
    }

    #[test]
    fn test_chunk_meta_accessors() {
        let c = chunk();
        assert_eq!(c.meta_str("path"), Some("src/a.py"));
        assert_eq!(c.meta_u64("line_start"), Some(1));
        assert_eq!(c.meta_str("missing"), None);
    }

    #[test]
    fn test_manifest_round_trip() {
        let manifest = PacketManifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            packet_id: "sha256:abc".to_string(),
            embedding: EmbeddingSpec {
                provider: "openai-compatible".to_string(),
                model: "m".to_string(),
                dim: 8,
                dtype: "f16".to_string(),
                normalized: true,
                max_seq_length: Some(512),
            },
            similarity: SimilaritySpec::default(),
            files: FilesSpec {
                docs: "docs.jsonl".to_string(),
                vectors: None,
                index: None,
                calibration: None,
            },
            counts: Counts { docs: 3, vectors: 0 },
            source: SourceInfo {
                path: "src".to_string(),
                tree_hash: "t".to_string(),
            },
            cpm: "0.9.0".to_string(),
            incremental: IncrementalInfo::default(),
            checksums: BTreeMap::new(),
            extras: BTreeMap::new(),
        };
        let json = serde_json::to_string(&manifest).unwrap();
        let back: PacketManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
        // Nullable files signal partial success
        assert!(json.contains("\"vectors\":null"));
    }
}
