//! Three-tier lockfile verification: plan match, artifact hashes, frozen
//! determinism. Each tier fails independently; `verify` reports rather than
//! throws so callers decide what a mismatch means.

use std::path::Path;

use crate::error::Result;
use crate::hash::{canonical_json_bytes, sha256_file};
use crate::lockfile::{Lockfile, ResolvedPlan};

/// Outcome of one verification tier.
#[derive(Debug, Clone, PartialEq)]
pub struct TierResult {
    pub passed: bool,
    pub mismatches: Vec<String>,
}

impl TierResult {
    fn pass() -> Self {
        Self {
            passed: true,
            mismatches: Vec::new(),
        }
    }

    fn fail(mismatches: Vec<String>) -> Self {
        Self {
            passed: false,
            mismatches,
        }
    }
}

/// Structured verification report.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyReport {
    pub plan_match: TierResult,
    pub artifact_match: TierResult,
    pub frozen_determinism: TierResult,
}

impl VerifyReport {
    pub fn all_passed(&self) -> bool {
        self.plan_match.passed && self.artifact_match.passed && self.frozen_determinism.passed
    }

    /// Flat list of every mismatch across tiers, for display.
    pub fn mismatches(&self) -> Vec<&str> {
        self.plan_match
            .mismatches
            .iter()
            .chain(&self.artifact_match.mismatches)
            .chain(&self.frozen_determinism.mismatches)
            .map(String::as_str)
            .collect()
    }
}

/// Conventional artifact-name to lockfile-field mapping.
const ARTIFACT_FILES: &[(&str, &str)] = &[
    ("docs.jsonl", "chunks_manifest_hash"),
    ("vectors.f16.bin", "embeddings_hash"),
    ("faiss/index.faiss", "index_hash"),
    ("manifest.json", "packet_manifest_hash"),
];

/// Verify a lockfile against a freshly computed plan and the packet
/// directory on disk. `frozen` enables the determinism tier.
pub fn verify(
    lockfile: &Lockfile,
    plan: &ResolvedPlan,
    packet_dir: &Path,
    frozen: bool,
) -> Result<VerifyReport> {
    Ok(VerifyReport {
        plan_match: verify_plan(lockfile, plan)?,
        artifact_match: verify_artifacts(lockfile, packet_dir),
        frozen_determinism: verify_frozen(lockfile, frozen),
    })
}

/// Tier 1: the packet, inputs, pipeline, and models sections must match the
/// fresh plan exactly. Compared via canonical JSON so formatting and field
/// ordering never produce false mismatches.
fn verify_plan(lockfile: &Lockfile, plan: &ResolvedPlan) -> Result<TierResult> {
    let mut mismatches = Vec::new();

    if canonical_json_bytes(&lockfile.packet)? != canonical_json_bytes(&plan.packet)? {
        mismatches.push(format!(
            "packet section differs (lockfile id {}, plan id {})",
            lockfile.packet.packet_id, plan.packet.packet_id
        ));
    }
    if canonical_json_bytes(&lockfile.inputs)? != canonical_json_bytes(&plan.inputs)? {
        mismatches.push(describe_input_diff(lockfile, plan));
    }
    if canonical_json_bytes(&lockfile.pipeline)? != canonical_json_bytes(&plan.pipeline)? {
        mismatches.push("pipeline section differs".to_string());
    }
    if canonical_json_bytes(&lockfile.models)? != canonical_json_bytes(&plan.models)? {
        mismatches.push("models section differs".to_string());
    }

    Ok(if mismatches.is_empty() {
        TierResult::pass()
    } else {
        TierResult::fail(mismatches)
    })
}

/// Name the files behind an inputs mismatch, for a readable diff.
fn describe_input_diff(lockfile: &Lockfile, plan: &ResolvedPlan) -> String {
    let mut changed = Vec::new();
    for (path, hash) in &plan.inputs.file_hashes {
        match lockfile.inputs.file_hashes.get(path) {
            None => changed.push(format!("+{}", path)),
            Some(locked) if locked != hash => changed.push(format!("~{}", path)),
            Some(_) => {}
        }
    }
    for path in lockfile.inputs.file_hashes.keys() {
        if !plan.inputs.file_hashes.contains_key(path) {
            changed.push(format!("-{}", path));
        }
    }
    if changed.is_empty() {
        "inputs tree hash differs".to_string()
    } else {
        format!("inputs differ: {}", changed.join(", "))
    }
}

/// Tier 2: every artifact named in the lockfile must exist under
/// `packet_dir` with a matching SHA-256.
fn verify_artifacts(lockfile: &Lockfile, packet_dir: &Path) -> TierResult {
    let mut mismatches = Vec::new();

    for (file_name, field) in ARTIFACT_FILES {
        let expected = match *field {
            "chunks_manifest_hash" => Some(&lockfile.artifacts.chunks_manifest_hash),
            "embeddings_hash" => lockfile.artifacts.embeddings_hash.as_ref(),
            "index_hash" => lockfile.artifacts.index_hash.as_ref(),
            "packet_manifest_hash" => Some(&lockfile.artifacts.packet_manifest_hash),
            _ => None,
        };
        let Some(expected) = expected else {
            continue;
        };

        let path = packet_dir.join(file_name);
        if !path.exists() {
            mismatches.push(format!("missing artifact: {}", file_name));
            continue;
        }
        match sha256_file(&path) {
            Ok(actual) if &actual == expected => {}
            Ok(_) => mismatches.push(format!("hash mismatch: {}", file_name)),
            Err(e) => mismatches.push(format!("unreadable artifact {}: {}", file_name, e)),
        }
    }

    if mismatches.is_empty() {
        TierResult::pass()
    } else {
        TierResult::fail(mismatches)
    }
}

/// Tier 3: with `frozen`, any `non_deterministic: true` marker fails.
fn verify_frozen(lockfile: &Lockfile, frozen: bool) -> TierResult {
    if !frozen {
        return TierResult::pass();
    }

    let mut mismatches = Vec::new();
    for (i, step) in lockfile.pipeline.iter().enumerate() {
        if step.non_deterministic == Some(true) {
            mismatches.push(format!("pipeline[{}] ({}) is non-deterministic", i, step.step));
        }
    }
    for (i, model) in lockfile.models.iter().enumerate() {
        if model.non_deterministic == Some(true) {
            mismatches.push(format!("models[{}] ({}) is non-deterministic", i, model.model));
        }
    }

    if mismatches.is_empty() {
        TierResult::pass()
    } else {
        TierResult::fail(mismatches)
    }
}
