//! Plan computation: a `ResolvedPlan` is a deterministic function of the
//! packet identity, the source tree, and the resolved pipeline and model
//! parameters. No wall-clock, environment, or machine state leaks in.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::build::{build_config_hash, normalize_source_path};
use crate::config::{BuildConfig, EmbeddingsConfig};
use crate::error::Result;
use crate::hash::{self, config_hash, sha256_file};
use crate::lockfile::{InputsSection, ModelEntry, PacketSection, PipelineStep};

/// Everything that identifies one `build run` invocation.
#[derive(Debug, Clone)]
pub struct PlanInvocation {
    pub name: String,
    pub version: String,
    pub build_profile: String,
    pub source: PathBuf,
    pub build: BuildConfig,
    pub embeddings: EmbeddingsConfig,
}

/// The deterministic sections of a lockfile (everything except artifacts
/// and resolution metadata).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlan {
    pub packet: PacketSection,
    pub inputs: InputsSection,
    pub pipeline: Vec<PipelineStep>,
    pub models: Vec<ModelEntry>,
}

/// Compute the plan for an invocation. Walks the source tree to fingerprint
/// inputs; byte-identical output for identical inputs regardless of
/// iteration order or machine.
pub fn compute_plan(invocation: &PlanInvocation) -> Result<ResolvedPlan> {
    let scan = crate::build::scan(&invocation.source)?;

    let mut file_hashes = BTreeMap::new();
    for file in &scan.files {
        file_hashes.insert(file.relpath.clone(), sha256_file(&file.absolute_path)?);
    }
    let entries: Vec<(String, String)> = file_hashes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let tree_hash = hash::tree_hash(&entries);

    let combined_config_hash = build_config_hash(
        &invocation.build,
        &invocation.embeddings.model,
        invocation.embeddings.dim,
        invocation.embeddings.max_seq_length,
    )?;
    let packet_id = hash::packet_id(
        &invocation.name,
        &invocation.version,
        &invocation.build_profile,
        &normalize_source_path(&invocation.source),
        &combined_config_hash,
    );

    let pipeline = vec![
        chunk_step(&invocation.build)?,
        embed_step(&invocation.embeddings)?,
        index_step()?,
    ];

    let models = vec![ModelEntry {
        provider: "openai-compatible".to_string(),
        model: invocation.embeddings.model.clone(),
        revision: None,
        dtype: "f16".to_string(),
        device_policy: "auto".to_string(),
        normalize: true,
        max_seq_length: invocation.embeddings.max_seq_length,
        non_deterministic: None,
    }];

    Ok(ResolvedPlan {
        packet: PacketSection {
            name: invocation.name.clone(),
            version: invocation.version.clone(),
            packet_id: packet_id.clone(),
            resolved_packet_id: packet_id,
            build_profile: invocation.build_profile.clone(),
        },
        inputs: InputsSection {
            tree_hash,
            file_hashes,
        },
        pipeline,
        models,
    })
}

fn chunk_step(build: &BuildConfig) -> Result<PipelineStep> {
    let params = serde_json::json!({
        "chunk_tokens": build.chunk_tokens,
        "overlap_tokens": build.overlap_tokens,
        "max_symbol_blocks_per_chunk": build.max_symbol_blocks_per_chunk,
        "hard_cap_tokens": build.hard_cap_tokens,
        "micro_chunk_tokens": build.micro_chunk_tokens,
    });
    Ok(PipelineStep {
        step: "build".to_string(),
        plugin: "builtin:chunk".to_string(),
        plugin_version: env!("CARGO_PKG_VERSION").to_string(),
        config_hash: config_hash(&params)?,
        params,
        non_deterministic: None,
    })
}

fn embed_step(embeddings: &EmbeddingsConfig) -> Result<PipelineStep> {
    let params = serde_json::json!({
        "model": embeddings.model,
        "dim": embeddings.dim,
        "normalize_mode": embeddings.normalize_mode,
        "max_seq_length": embeddings.max_seq_length,
        "batch_size": embeddings.batch_size,
    });
    Ok(PipelineStep {
        step: "embed".to_string(),
        plugin: "builtin:embed-http".to_string(),
        plugin_version: env!("CARGO_PKG_VERSION").to_string(),
        config_hash: config_hash(&params)?,
        params,
        non_deterministic: None,
    })
}

fn index_step() -> Result<PipelineStep> {
    let params = serde_json::json!({
        "index_type": "flat",
        "space": "ip",
    });
    Ok(PipelineStep {
        step: "index".to_string(),
        plugin: "builtin:flat-ip".to_string(),
        plugin_version: env!("CARGO_PKG_VERSION").to_string(),
        config_hash: config_hash(&params)?,
        params,
        non_deterministic: None,
    })
}
