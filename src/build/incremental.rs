//! Incremental embedding reuse: copy vector rows from a prior build when
//! chunk text hashes match, so unchanged content is never re-embedded.
//!
//! Content identity is the reuse key: chunk ids may shift between builds
//! (files added, counters moved) without invalidating reuse.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::Result;
use crate::packet::{self, types::PacketManifest};

/// A prior packet loaded from the build destination.
#[derive(Debug)]
pub struct PriorPacket {
    pub manifest: PacketManifest,
    /// chunk hash -> row index of the prior matrix.
    rows_by_hash: HashMap<String, usize>,
    /// Prior vector rows, f32, in prior row order.
    rows: Vec<Vec<f32>>,
}

impl PriorPacket {
    /// Load the prior build from `dest`, if a complete one exists.
    ///
    /// Requires `manifest.json`, `docs.jsonl`, and `vectors.f16.bin` to all
    /// be present and mutually consistent; anything less returns None and
    /// the build embeds from scratch.
    pub fn load(dest: &Path) -> Option<Self> {
        let manifest_path = dest.join(packet::MANIFEST_FILE);
        let docs_path = dest.join(packet::DOCS_FILE);
        let vectors_path = dest.join(packet::VECTORS_FILE);
        if !manifest_path.exists() || !docs_path.exists() || !vectors_path.exists() {
            return None;
        }

        let manifest = packet::read_manifest(&manifest_path).ok()?;
        // A manifest with vectors unset is a partial build; its vector file
        // (if any survives) does not belong to the chunks on disk.
        manifest.files.vectors.as_ref()?;
        let chunks = packet::read_chunks(&docs_path).ok()?;
        let rows = packet::vectors::read_f16(&vectors_path, manifest.embedding.dim).ok()?;
        if rows.len() != chunks.len() {
            log::warn!(
                "prior packet rows ({}) do not match chunks ({}), ignoring",
                rows.len(),
                chunks.len()
            );
            return None;
        }

        let mut rows_by_hash = HashMap::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            // First occurrence wins for duplicate text.
            rows_by_hash.entry(chunk.hash.clone()).or_insert(i);
        }

        Some(Self {
            manifest,
            rows_by_hash,
            rows,
        })
    }

    /// Whether the prior embedding configuration matches the current one.
    /// Model, max_seq_length, and output dimension must all agree.
    pub fn compatible(&self, model: &str, max_seq_length: Option<u32>, dim: u32) -> bool {
        self.manifest.embedding.model == model
            && self.manifest.embedding.max_seq_length == max_seq_length
            && self.manifest.embedding.dim == dim
    }

    fn row_for_hash(&self, hash: &str) -> Option<&Vec<f32>> {
        self.rows_by_hash.get(hash).map(|&i| &self.rows[i])
    }

    fn hash_set(&self) -> HashSet<&str> {
        self.rows_by_hash.keys().map(String::as_str).collect()
    }
}

/// The reuse decision for one build: per-chunk rows (filled where reused)
/// plus the accounting that ends up in `manifest.incremental`.
#[derive(Debug)]
pub struct ReusePlan {
    /// One slot per current chunk; Some(row) where the prior build supplied it.
    pub rows: Vec<Option<Vec<f32>>>,
    pub reused: usize,
    /// Indices of chunks that still need embedding.
    pub missing: Vec<usize>,
    /// Prior chunks whose hash no longer appears.
    pub removed: usize,
}

/// Decide, for each current chunk hash, whether a prior vector row can be
/// reused. `prior` of None means a cold build: everything is missing.
pub fn plan_reuse(current_hashes: &[String], prior: Option<&PriorPacket>) -> ReusePlan {
    let mut rows = Vec::with_capacity(current_hashes.len());
    let mut missing = Vec::new();
    let mut reused = 0usize;

    match prior {
        Some(prior) => {
            for (i, hash) in current_hashes.iter().enumerate() {
                match prior.row_for_hash(hash) {
                    Some(row) => {
                        rows.push(Some(row.clone()));
                        reused += 1;
                    }
                    None => {
                        rows.push(None);
                        missing.push(i);
                    }
                }
            }
            let current_set: HashSet<&str> = current_hashes.iter().map(String::as_str).collect();
            let removed = prior
                .hash_set()
                .iter()
                .filter(|h| !current_set.contains(**h))
                .count();
            ReusePlan {
                rows,
                reused,
                missing,
                removed,
            }
        }
        None => {
            for i in 0..current_hashes.len() {
                rows.push(None);
                missing.push(i);
            }
            ReusePlan {
                rows,
                reused: 0,
                missing,
                removed: 0,
            }
        }
    }
}
