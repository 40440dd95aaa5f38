//! The `cpm.packet.metadata` v1.0 blob: the small JSON document a
//! metadata-only lookup fetches instead of the payload.
//!
//! The legacy `cpm-oci/v1` shape is accepted read-only and normalized into
//! the v1 form at load time.

use serde::{Deserialize, Serialize};

use crate::error::{CpmError, OciError, Result};

/// Media type of the metadata layer in the OCI image manifest.
pub const METADATA_MEDIA_TYPE: &str = "application/vnd.cpm.packet.manifest.v1+json";

/// Media type of ordinary packet file layers.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.cpm.packet.layer.v1";

pub const METADATA_SCHEMA: &str = "cpm.packet.metadata";
pub const METADATA_SCHEMA_VERSION: &str = "1.0";
const LEGACY_SCHEMA: &str = "cpm-oci/v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PacketMetadata {
    pub schema: String,
    pub schema_version: String,
    pub packet: PacketInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compat: Option<CompatInfo>,
    pub payload: PayloadInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PacketInfo {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoints: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompatInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpm_min_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayloadInfo {
    pub files: Vec<PayloadFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayloadFile {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildMeta {
    pub minimal: bool,
    pub include_docs: bool,
    pub include_embeddings: bool,
}

/// Parse a metadata blob: current schema first, then the legacy shape.
pub fn parse_metadata(bytes: &[u8]) -> Result<PacketMetadata> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| CpmError::Oci(OciError::Protocol(format!("metadata blob is not JSON: {}", e))))?;

    match value.get("schema").and_then(|s| s.as_str()) {
        Some(METADATA_SCHEMA) => serde_json::from_value(value)
            .map_err(|e| CpmError::Oci(OciError::Protocol(format!("invalid metadata: {}", e)))),
        Some(LEGACY_SCHEMA) => normalize_legacy(&value),
        other => Err(CpmError::Oci(OciError::Protocol(format!(
            "unknown metadata schema: {:?}",
            other
        )))),
    }
}

/// Legacy `cpm-oci/v1` metadata was flat: name/version/description/tags at
/// the top level, `files` as plain strings, optional `full_ref`.
fn normalize_legacy(value: &serde_json::Value) -> Result<PacketMetadata> {
    let get_str = |key: &str| value.get(key).and_then(|v| v.as_str()).map(String::from);

    let name = get_str("name").ok_or_else(|| legacy_err("missing name"))?;
    let version = get_str("version").ok_or_else(|| legacy_err("missing version"))?;

    let tags = value.get("tags").and_then(|t| t.as_array()).map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect::<Vec<_>>()
    });

    let files = value
        .get("files")
        .and_then(|f| f.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| match v {
                    serde_json::Value::String(name) => Some(PayloadFile {
                        name: name.clone(),
                        digest: None,
                        size: None,
                    }),
                    serde_json::Value::Object(obj) => {
                        obj.get("name").and_then(|n| n.as_str()).map(|name| PayloadFile {
                            name: name.to_string(),
                            digest: obj.get("digest").and_then(|d| d.as_str()).map(String::from),
                            size: obj.get("size").and_then(|s| s.as_u64()),
                        })
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(PacketMetadata {
        schema: METADATA_SCHEMA.to_string(),
        schema_version: METADATA_SCHEMA_VERSION.to_string(),
        packet: PacketInfo {
            name,
            version,
            description: get_str("description"),
            tags,
            kind: get_str("kind"),
            entrypoints: None,
            capabilities: None,
        },
        compat: None,
        payload: PayloadInfo {
            files,
            full_ref: get_str("full_ref"),
        },
        source: None,
    })
}

fn legacy_err(reason: &str) -> CpmError {
    CpmError::Oci(OciError::Protocol(format!("legacy metadata: {}", reason)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1_blob() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schema": "cpm.packet.metadata",
            "schema_version": "1.0",
            "packet": {
                "name": "demo",
                "version": "1.0.0",
                "description": "A demo packet",
                "tags": ["docs"],
                "entrypoints": ["README.md"]
            },
            "payload": {
                "files": [
                    {"name": "docs.jsonl", "digest": "sha256:aa", "size": 320},
                    {"name": "manifest.json"}
                ],
                "full_ref": "oci://reg/team/demo@sha256:bb"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_v1() {
        let meta = parse_metadata(&v1_blob()).unwrap();
        assert_eq!(meta.packet.name, "demo");
        assert_eq!(meta.packet.version, "1.0.0");
        assert_eq!(meta.payload.files.len(), 2);
        assert_eq!(meta.payload.files[0].size, Some(320));
        assert_eq!(meta.schema, METADATA_SCHEMA);
    }

    #[test]
    fn test_parse_legacy_normalizes() {
        let legacy = serde_json::to_vec(&serde_json::json!({
            "schema": "cpm-oci/v1",
            "name": "old-packet",
            "version": "0.3.1",
            "description": "pre-v1 layout",
            "tags": ["legacy"],
            "files": ["docs.jsonl", {"name": "manifest.json", "size": 100}],
            "full_ref": "oci://reg/team/old-packet@sha256:cc"
        }))
        .unwrap();

        let meta = parse_metadata(&legacy).unwrap();
        assert_eq!(meta.schema, METADATA_SCHEMA);
        assert_eq!(meta.schema_version, METADATA_SCHEMA_VERSION);
        assert_eq!(meta.packet.name, "old-packet");
        assert_eq!(meta.packet.tags, Some(vec!["legacy".to_string()]));
        assert_eq!(meta.payload.files.len(), 2);
        assert_eq!(meta.payload.files[0].name, "docs.jsonl");
        assert_eq!(meta.payload.files[1].size, Some(100));
        assert_eq!(
            meta.payload.full_ref.as_deref(),
            Some("oci://reg/team/old-packet@sha256:cc")
        );
    }

    #[test]
    fn test_parse_rejects_unknown_schema() {
        let blob = serde_json::to_vec(&serde_json::json!({"schema": "who-knows/v9"})).unwrap();
        assert!(parse_metadata(&blob).is_err());

        let blob = serde_json::to_vec(&serde_json::json!({"no_schema": true})).unwrap();
        assert!(parse_metadata(&blob).is_err());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(parse_metadata(b"<xml/>").is_err());
    }

    #[test]
    fn test_legacy_requires_name_and_version() {
        let blob = serde_json::to_vec(&serde_json::json!({
            "schema": "cpm-oci/v1",
            "name": "incomplete"
        }))
        .unwrap();
        assert!(parse_metadata(&blob).is_err());
    }

    #[test]
    fn test_round_trip_canonical() {
        let meta = parse_metadata(&v1_blob()).unwrap();
        let bytes = crate::hash::canonical_json_bytes(&meta).unwrap();
        let back = parse_metadata(&bytes).unwrap();
        assert_eq!(back, meta);
    }
}
