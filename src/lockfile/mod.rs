//! Lockfile engine: deterministic plan hashing, lockfile synthesis, and
//! three-tier verification.
//!
//! A lockfile records exactly what went into a build (inputs, pipeline,
//! models) and what came out (artifact hashes). Plan computation is a pure
//! function of the invocation; rendering stamps resolution metadata on top.

pub mod plan;
pub mod verify;

pub use plan::{compute_plan, PlanInvocation, ResolvedPlan};
pub use verify::{verify, TierResult, VerifyReport};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::build::ArtifactHashes;
use crate::error::{CpmError, LockfileError, Result};
use crate::hash::canonical_json_string;

pub const LOCKFILE_VERSION: u32 = 1;

/// The on-disk lockfile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lockfile {
    #[serde(rename = "lockfileVersion")]
    pub lockfile_version: u32,
    pub packet: PacketSection,
    pub inputs: InputsSection,
    pub pipeline: Vec<PipelineStep>,
    pub models: Vec<ModelEntry>,
    pub artifacts: ArtifactsSection,
    pub resolution: ResolutionSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PacketSection {
    pub name: String,
    pub version: String,
    pub packet_id: String,
    pub resolved_packet_id: String,
    pub build_profile: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputsSection {
    /// Domain-separated fold of sorted (relpath, sha256) pairs.
    pub tree_hash: String,
    pub file_hashes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineStep {
    pub step: String,
    /// Qualified plugin name, `group:name`.
    pub plugin: String,
    pub plugin_version: String,
    pub config_hash: String,
    pub params: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub non_deterministic: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub provider: String,
    pub model: String,
    pub revision: Option<String>,
    pub dtype: String,
    pub device_policy: String,
    pub normalize: bool,
    pub max_seq_length: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub non_deterministic: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactsSection {
    pub chunks_manifest_hash: String,
    pub embeddings_hash: Option<String>,
    pub index_hash: Option<String>,
    pub packet_manifest_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolutionSection {
    pub generated_at: String,
    pub cpm_version: String,
    pub warnings: Vec<String>,
}

/// Render a lockfile from a resolved plan and the artifact hashes of the
/// build it describes.
pub fn render(plan: &ResolvedPlan, artifacts: &ArtifactHashes, now: DateTime<Utc>) -> Lockfile {
    Lockfile {
        lockfile_version: LOCKFILE_VERSION,
        packet: plan.packet.clone(),
        inputs: plan.inputs.clone(),
        pipeline: plan.pipeline.clone(),
        models: plan.models.clone(),
        artifacts: ArtifactsSection {
            chunks_manifest_hash: artifacts.chunks_manifest_hash.clone(),
            embeddings_hash: artifacts.embeddings_hash.clone(),
            index_hash: artifacts.index_hash.clone(),
            packet_manifest_hash: artifacts.packet_manifest_hash.clone(),
        },
        resolution: ResolutionSection {
            generated_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            cpm_version: env!("CARGO_PKG_VERSION").to_string(),
            warnings: Vec::new(),
        },
    }
}

/// Write the lockfile as canonical JSON, atomically (tmp + rename).
pub fn write(lockfile: &Lockfile, path: &Path) -> Result<()> {
    let json = canonical_json_string(lockfile)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and parse a lockfile.
pub fn read(path: &Path) -> Result<Lockfile> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| {
        CpmError::Lockfile(LockfileError::Unreadable(format!(
            "{}: {}",
            path.display(),
            e
        )))
    })
}

/// Whether any pipeline step or model carries a `non_deterministic` marker.
pub fn has_non_deterministic(lockfile: &Lockfile) -> bool {
    lockfile
        .pipeline
        .iter()
        .any(|s| s.non_deterministic == Some(true))
        || lockfile
            .models
            .iter()
            .any(|m| m.non_deterministic == Some(true))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn sample_lockfile() -> Lockfile {
        let mut file_hashes = BTreeMap::new();
        file_hashes.insert("a.py".to_string(), "h1".to_string());
        Lockfile {
            lockfile_version: LOCKFILE_VERSION,
            packet: PacketSection {
                name: "demo".to_string(),
                version: "1.0.0".to_string(),
                packet_id: "sha256:abc".to_string(),
                resolved_packet_id: "sha256:abc".to_string(),
                build_profile: "default".to_string(),
            },
            inputs: InputsSection {
                tree_hash: "tree".to_string(),
                file_hashes,
            },
            pipeline: vec![PipelineStep {
                step: "build".to_string(),
                plugin: "builtin:chunk".to_string(),
                plugin_version: "0.9.0".to_string(),
                config_hash: "cfg".to_string(),
                params: serde_json::json!({"chunk_tokens": 200}),
                non_deterministic: None,
            }],
            models: vec![ModelEntry {
                provider: "openai-compatible".to_string(),
                model: "m".to_string(),
                revision: None,
                dtype: "f16".to_string(),
                device_policy: "auto".to_string(),
                normalize: true,
                max_seq_length: None,
                non_deterministic: None,
            }],
            artifacts: ArtifactsSection {
                chunks_manifest_hash: "c".to_string(),
                embeddings_hash: Some("e".to_string()),
                index_hash: Some("i".to_string()),
                packet_manifest_hash: "p".to_string(),
            },
            resolution: ResolutionSection {
                generated_at: "2025-06-01T12:00:00Z".to_string(),
                cpm_version: "0.9.0".to_string(),
                warnings: Vec::new(),
            },
        }
    }
}
