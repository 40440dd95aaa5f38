//! manifest.json read/write in canonical JSON form.

use std::path::Path;

use crate::error::{CpmError, Result};
use crate::hash::canonical_json_string;
use crate::packet::types::PacketManifest;

/// Write the manifest as canonical JSON (sorted keys, trailing LF).
///
/// Goes through a temp file + rename so readers never observe a torn
/// manifest.
pub fn write_manifest(path: &Path, manifest: &PacketManifest) -> Result<()> {
    let json = canonical_json_string(manifest)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and parse a packet manifest.
pub fn read_manifest(path: &Path) -> Result<PacketManifest> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| CpmError::Parse(format!("invalid manifest {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::types::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn manifest() -> PacketManifest {
        PacketManifest {
            schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
            packet_id: "sha256:deadbeef".to_string(),
            embedding: EmbeddingSpec {
                provider: "openai-compatible".to_string(),
                model: "test-model".to_string(),
                dim: 8,
                dtype: "f16".to_string(),
                normalized: true,
                max_seq_length: None,
            },
            similarity: SimilaritySpec::default(),
            files: FilesSpec {
                docs: "docs.jsonl".to_string(),
                vectors: Some("vectors.f16.bin".to_string()),
                index: Some("faiss/index.faiss".to_string()),
                calibration: None,
            },
            counts: Counts { docs: 2, vectors: 2 },
            source: SourceInfo {
                path: "src".to_string(),
                tree_hash: "abc".to_string(),
            },
            cpm: "0.9.0".to_string(),
            incremental: IncrementalInfo {
                enabled: true,
                reused: 1,
                embedded: 1,
                removed: 0,
            },
            checksums: BTreeMap::new(),
            extras: BTreeMap::new(),
        }
    }

    #[test]
    fn test_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        let m = manifest();
        write_manifest(&path, &m).unwrap();
        assert_eq!(read_manifest(&path).unwrap(), m);
    }

    #[test]
    fn test_canonical_output_sorted_and_stable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        write_manifest(&path, &manifest()).unwrap();
        let bytes1 = std::fs::read(&path).unwrap();

        // Sorted keys: "checksums" precedes "counts" precedes "embedding"
        let text = String::from_utf8(bytes1.clone()).unwrap();
        let checksums_pos = text.find("\"checksums\"").unwrap();
        let counts_pos = text.find("\"counts\"").unwrap();
        let embedding_pos = text.find("\"embedding\"").unwrap();
        assert!(checksums_pos < counts_pos && counts_pos < embedding_pos);
        assert!(text.ends_with('\n'));

        write_manifest(&path, &manifest()).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), bytes1);
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        write_manifest(&path, &manifest()).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_read_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(read_manifest(&path), Err(CpmError::Parse(_))));
    }
}
