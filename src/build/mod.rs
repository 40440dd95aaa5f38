//! Builder: deterministic packet assembly.
//!
//! Phases run in a fixed order: scan, chunk, incremental-reuse decision,
//! embed, index, persist, optional archive. Failures after chunk-write
//! leave a partial manifest behind so a later invocation can resume from
//! `docs.jsonl`.

pub mod archive;
pub mod chunker;
pub mod incremental;
pub mod scanner;

pub use archive::ArchiveFormat;
pub use scanner::{scan, ScanResult, SourceFile};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::embeddings::Embedder;
use crate::error::{BuildError, CpmError, Result};
use crate::hash::{self, sha256_file, sha256_hex};
use crate::index::FlatIpIndex;
use crate::packet::{
    self,
    types::{
        Checksum, Counts, DocChunk, EmbeddingSpec, FilesSpec, IncrementalInfo, PacketManifest,
        SimilaritySpec, SourceInfo, MANIFEST_SCHEMA_VERSION,
    },
    CpmYaml,
};

/// Time source for `created_at`, injectable so tests can fix the clock.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A frozen clock for deterministic output.
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// One build invocation.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub name: String,
    pub version: String,
    pub description: String,
    pub tags: Vec<String>,
    pub entrypoints: Vec<String>,
    pub build_profile: String,
    /// Permit reusing an existing destination (incremental / resume).
    pub allow_reuse: bool,
}

/// SHA-256 of each persisted artifact, for the lockfile.
#[derive(Debug, Clone)]
pub struct ArtifactHashes {
    pub chunks_manifest_hash: String,
    pub embeddings_hash: Option<String>,
    pub index_hash: Option<String>,
    pub packet_manifest_hash: String,
}

/// Everything a successful build leaves behind, plus the input fingerprint
/// the lockfile engine records.
#[derive(Debug)]
pub struct BuildResult {
    pub manifest: PacketManifest,
    pub artifacts: ArtifactHashes,
    pub tree_hash: String,
    pub file_hashes: BTreeMap<String, String>,
    pub ext_counts: BTreeMap<String, usize>,
    pub archive_path: Option<PathBuf>,
}

/// Hash of the resolved build parameters (chunking + embedding), the
/// `config_hash` component of the packet id. The lockfile plan uses the
/// same function so both derive identical ids.
pub fn build_config_hash(
    config: &BuildConfig,
    model: &str,
    dim: u32,
    max_seq_length: Option<u32>,
) -> Result<String> {
    hash::config_hash(&serde_json::json!({
        "chunk_tokens": config.chunk_tokens,
        "overlap_tokens": config.overlap_tokens,
        "max_symbol_blocks_per_chunk": config.max_symbol_blocks_per_chunk,
        "hard_cap_tokens": config.hard_cap_tokens,
        "micro_chunk_tokens": config.micro_chunk_tokens,
        "model": model,
        "dim": dim,
        "max_seq_length": max_seq_length,
    }))
}

/// POSIX rendering of a path, the form hashed into packet ids.
pub fn normalize_source_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Removes the `.building` sentinel when the build ends, success or not.
/// Files already flushed stay behind for incremental recovery.
struct SentinelGuard(PathBuf);

impl Drop for SentinelGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Build a packet directory from a source tree.
///
/// On embedding failure a partial manifest is written (`vectors`/`index`
/// null, `extras.build_status = "embedding_failed"`) and the error is
/// returned; `docs.jsonl` stays so `build embed` can resume.
pub async fn build<E: Embedder>(
    request: &BuildRequest,
    config: &BuildConfig,
    embedder: &E,
    clock: &dyn Clock,
) -> Result<BuildResult> {
    // Scan before touching the destination: source errors write nothing.
    let scan_result = scanner::scan(&request.source)?;

    let sentinel = request.dest.join(".building");
    if sentinel.exists() {
        return Err(CpmError::Build(BuildError::BuildInProgress(request.dest.clone())));
    }
    if request.dest.exists() && !request.allow_reuse {
        let occupied = std::fs::read_dir(&request.dest)?.next().is_some();
        if occupied {
            return Err(CpmError::Build(BuildError::DestinationExists(request.dest.clone())));
        }
    }

    // Chunk
    let mut chunks: Vec<DocChunk> = Vec::new();
    for file in &scan_result.files {
        chunks.extend(chunker::chunk_file(file, config));
    }
    let current_hashes: Vec<String> = chunks.iter().map(|c| c.hash.clone()).collect();

    // Input fingerprint over raw file bytes
    let mut file_hashes = BTreeMap::new();
    for file in &scan_result.files {
        file_hashes.insert(file.relpath.clone(), sha256_file(&file.absolute_path)?);
    }
    let tree_entries: Vec<(String, String)> = file_hashes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let tree_hash = hash::tree_hash(&tree_entries);

    // Incremental-reuse decision happens against the destination as it was
    // before this build rewrites it.
    let prior = if request.allow_reuse {
        incremental::PriorPacket::load(&request.dest).filter(|p| {
            p.compatible(embedder.model(), embedder.max_seq_length(), embedder.dim())
        })
    } else {
        None
    };
    let incremental_enabled = prior.is_some();
    let mut plan = incremental::plan_reuse(&current_hashes, prior.as_ref());

    std::fs::create_dir_all(&request.dest)?;
    std::fs::write(&sentinel, b"")?;
    let _guard = SentinelGuard(sentinel);

    // Persist chunks, then a tentative manifest, before any network call.
    packet::write_chunks(&request.dest.join(packet::DOCS_FILE), &chunks)?;

    let config_hash = build_config_hash(
        config,
        embedder.model(),
        embedder.dim(),
        embedder.max_seq_length(),
    )?;
    let packet_id = hash::packet_id(
        &request.name,
        &request.version,
        &request.build_profile,
        &normalize_source_path(&request.source),
        &config_hash,
    );

    let embedding_spec = EmbeddingSpec {
        provider: "openai-compatible".to_string(),
        model: embedder.model().to_string(),
        dim: embedder.dim(),
        dtype: "f16".to_string(),
        normalized: true,
        max_seq_length: embedder.max_seq_length(),
    };

    let mut manifest = PacketManifest {
        schema_version: MANIFEST_SCHEMA_VERSION.to_string(),
        packet_id: packet_id.clone(),
        embedding: embedding_spec,
        similarity: SimilaritySpec::default(),
        files: FilesSpec {
            docs: packet::DOCS_FILE.to_string(),
            vectors: None,
            index: None,
            calibration: None,
        },
        counts: Counts {
            docs: chunks.len(),
            vectors: 0,
        },
        source: SourceInfo {
            path: normalize_source_path(&request.source),
            tree_hash: tree_hash.clone(),
        },
        cpm: env!("CARGO_PKG_VERSION").to_string(),
        incremental: IncrementalInfo {
            enabled: incremental_enabled,
            reused: plan.reused,
            embedded: plan.missing.len(),
            removed: plan.removed,
        },
        checksums: BTreeMap::new(),
        extras: BTreeMap::new(),
    };
    packet::write_manifest(&request.dest.join(packet::MANIFEST_FILE), &manifest)?;

    // Embed missing chunks
    let mut fresh_rows = match embed_missing(&chunks, &plan.missing, embedder).await {
        Ok(rows) => rows,
        Err(e) => {
            let reason = e.to_string();
            write_failure_extras(&request.dest, &mut manifest, "embedding_failed", &reason)?;
            return Err(CpmError::Build(BuildError::EmbeddingUnavailable(reason)));
        }
    };

    // Dimension check: on mismatch, invalidate the incremental cache and
    // embed everything once; a second mismatch is fatal.
    if let Some(bad) = dim_mismatch(&fresh_rows, embedder.dim()) {
        if plan.reused > 0 {
            log::warn!(
                "embedder returned dim {} (expected {}); invalidating incremental cache",
                bad,
                embedder.dim()
            );
            plan = incremental::plan_reuse(&current_hashes, None);
            manifest.incremental = IncrementalInfo {
                enabled: incremental_enabled,
                reused: 0,
                embedded: plan.missing.len(),
                removed: plan.removed,
            };
            fresh_rows = match embed_missing(&chunks, &plan.missing, embedder).await {
                Ok(rows) => rows,
                Err(e) => {
                    let reason = e.to_string();
                    write_failure_extras(&request.dest, &mut manifest, "embedding_failed", &reason)?;
                    return Err(CpmError::Build(BuildError::EmbeddingUnavailable(reason)));
                }
            };
        }
        if let Some(bad) = dim_mismatch(&fresh_rows, embedder.dim()) {
            return Err(CpmError::Build(BuildError::DimMismatch {
                expected: embedder.dim(),
                actual: bad,
            }));
        }
    }

    // Assemble the final matrix in chunk order, interleaving reused rows.
    let mut rows: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
    let mut fresh_iter = fresh_rows.into_iter();
    for slot in plan.rows.iter_mut() {
        match slot.take() {
            Some(row) => rows.push(row),
            None => {
                let row = fresh_iter.next().ok_or_else(|| {
                    CpmError::Storage("embedding response shorter than request".to_string())
                })?;
                rows.push(row);
            }
        }
    }

    if let Some(row) = packet::vectors::find_non_finite(&rows) {
        return Err(CpmError::Build(BuildError::NonFiniteVector { row }));
    }

    packet::vectors::l2_normalize_rows(&mut rows);

    // Persist vectors, then the index.
    packet::vectors::write_f16(&request.dest.join(packet::VECTORS_FILE), &rows)?;
    manifest.files.vectors = Some(packet::VECTORS_FILE.to_string());
    manifest.counts.vectors = rows.len();

    let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
    let index = FlatIpIndex::build(embedder.dim(), &rows, ids)?;
    let index_path = request.dest.join(packet::INDEX_FILE);
    if let Err(e) = index.save(&index_path) {
        let _ = std::fs::remove_file(&index_path);
        let reason = e.to_string();
        write_failure_extras(&request.dest, &mut manifest, "index_write_failed", &reason)?;
        return Err(CpmError::Build(BuildError::IndexWriteFailed(reason)));
    }

    // cpm.yml
    let meta = CpmYaml::new(
        &request.name,
        &request.version,
        &request.description,
        &request.tags,
        &request.entrypoints,
        embedder.model(),
        embedder.dim(),
        true,
        clock.now(),
    );
    packet::write_cpm_yaml(&request.dest.join(packet::META_YAML_FILE), &meta)?;

    // Final manifest with checksums
    let mut checksums = BTreeMap::new();
    for name in [packet::DOCS_FILE, packet::VECTORS_FILE, packet::INDEX_FILE, packet::META_YAML_FILE] {
        checksums.insert(
            name.to_string(),
            Checksum::sha256(sha256_file(&request.dest.join(name))?),
        );
    }
    manifest.files.index = Some(packet::INDEX_FILE.to_string());
    manifest.checksums = checksums;
    packet::write_manifest(&request.dest.join(packet::MANIFEST_FILE), &manifest)?;

    let artifacts = ArtifactHashes {
        chunks_manifest_hash: sha256_file(&request.dest.join(packet::DOCS_FILE))?,
        embeddings_hash: Some(sha256_file(&request.dest.join(packet::VECTORS_FILE))?),
        index_hash: Some(sha256_file(&request.dest.join(packet::INDEX_FILE))?),
        packet_manifest_hash: sha256_file(&request.dest.join(packet::MANIFEST_FILE))?,
    };

    let archive_path = match ArchiveFormat::parse(&config.archive) {
        Some(format) => Some(archive::archive_packet(&request.dest, format)?),
        None => None,
    };

    log::info!(
        "built packet {} ({} chunks, {} reused, {} embedded)",
        request.name,
        chunks.len(),
        manifest.incremental.reused,
        manifest.incremental.embedded
    );

    Ok(BuildResult {
        manifest,
        artifacts,
        tree_hash,
        file_hashes,
        ext_counts: scan_result.ext_counts,
        archive_path,
    })
}

/// Embed the texts of the chunks named by `missing`, in order.
async fn embed_missing<E: Embedder>(
    chunks: &[DocChunk],
    missing: &[usize],
    embedder: &E,
) -> Result<Vec<Vec<f32>>> {
    if missing.is_empty() {
        return Ok(Vec::new());
    }
    let texts: Vec<String> = missing.iter().map(|&i| chunks[i].text.clone()).collect();
    embedder.embed(&texts).await
}

/// First offending row width, if any row deviates from `expected`.
fn dim_mismatch(rows: &[Vec<f32>], expected: u32) -> Option<u32> {
    rows.iter()
        .find(|r| r.len() != expected as usize)
        .map(|r| r.len() as u32)
}

/// Record a failure in the manifest extras and rewrite it in place.
fn write_failure_extras(
    dest: &Path,
    manifest: &mut PacketManifest,
    status: &str,
    reason: &str,
) -> Result<()> {
    manifest
        .extras
        .insert("build_status".to_string(), serde_json::json!(status));
    manifest
        .extras
        .insert("build_error".to_string(), serde_json::json!(reason));
    manifest.checksums.insert(
        packet::DOCS_FILE.to_string(),
        Checksum::sha256(sha256_hex(&std::fs::read(dest.join(packet::DOCS_FILE))?)),
    );
    packet::write_manifest(&dest.join(packet::MANIFEST_FILE), manifest)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::EmbedError;
    use std::sync::Mutex;

    /// Deterministic embedder: row i of a request is one-hot((start + i) % dim),
    /// where start advances per call. Reset between builds for reproducibility.
    pub struct MockEmbedder {
        pub dim: u32,
        counter: Mutex<usize>,
    }

    impl MockEmbedder {
        pub fn new(dim: u32) -> Self {
            Self {
                dim,
                counter: Mutex::new(0),
            }
        }
    }

    impl Embedder for MockEmbedder {
        fn model(&self) -> &str {
            "mock-model"
        }

        fn dim(&self) -> u32 {
            self.dim
        }

        fn normalized(&self) -> bool {
            true
        }

        fn max_seq_length(&self) -> Option<u32> {
            None
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut counter = self.counter.lock().unwrap();
            let start = *counter;
            *counter += texts.len();
            Ok(texts
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    let mut row = vec![0.0f32; self.dim as usize];
                    row[(start + i) % self.dim as usize] = 1.0;
                    row
                })
                .collect())
        }
    }

    /// Embedder that always fails with an upstream error (503-style outage).
    pub struct FailingEmbedder {
        pub dim: u32,
    }

    impl Embedder for FailingEmbedder {
        fn model(&self) -> &str {
            "mock-model"
        }

        fn dim(&self) -> u32 {
            self.dim
        }

        fn normalized(&self) -> bool {
            true
        }

        fn max_seq_length(&self) -> Option<u32> {
            None
        }

        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(CpmError::Embed(EmbedError::Upstream(
                "provider returned 503".to_string(),
            )))
        }
    }

    /// Embedder that returns rows of the wrong width.
    pub struct WrongDimEmbedder {
        pub claimed_dim: u32,
        pub actual_dim: u32,
    }

    impl Embedder for WrongDimEmbedder {
        fn model(&self) -> &str {
            "mock-model"
        }

        fn dim(&self) -> u32 {
            self.claimed_dim
        }

        fn normalized(&self) -> bool {
            true
        }

        fn max_seq_length(&self) -> Option<u32> {
            None
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|_| vec![1.0f32; self.actual_dim as usize])
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FailingEmbedder, MockEmbedder, WrongDimEmbedder};
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn fixed_clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap())
    }

    fn config() -> BuildConfig {
        BuildConfig {
            chunk_tokens: 200,
            overlap_tokens: 20,
            max_symbol_blocks_per_chunk: 8,
            hard_cap_tokens: 600,
            micro_chunk_tokens: 0,
            archive: "none".to_string(),
        }
    }

    fn write_source(root: &Path) {
        let py: String = (0..120)
            .map(|i| format!("def fn_{}():\n    return {}\n", i / 3, i))
            .collect();
        std::fs::write(root.join("a.py"), py).unwrap();
        let md: String = (0..40).map(|i| format!("line {} of the guide\n", i)).collect();
        std::fs::write(root.join("b.md"), format!("# Guide\n{}", md)).unwrap();
        std::fs::write(root.join("c.txt"), "").unwrap();
    }

    fn request(src: &Path, dest: &Path) -> BuildRequest {
        BuildRequest {
            source: src.to_path_buf(),
            dest: dest.to_path_buf(),
            name: "demo".to_string(),
            version: "1.0.0".to_string(),
            description: "demo packet".to_string(),
            tags: vec![],
            entrypoints: vec![],
            build_profile: "default".to_string(),
            allow_reuse: true,
        }
    }

    #[tokio::test]
    async fn test_deterministic_build_and_incremental_rerun() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&src).unwrap();
        write_source(&src);

        let embedder = MockEmbedder::new(8);
        let result = build(&request(&src, &dest), &config(), &embedder, &fixed_clock())
            .await
            .unwrap();

        let n = result.manifest.counts.docs;
        assert!(n > 0);
        assert_eq!(result.manifest.counts.vectors, n);
        assert_eq!(result.manifest.embedding.dim, 8);
        assert_eq!(result.manifest.incremental.embedded, n);
        assert_eq!(result.manifest.incremental.reused, 0);

        // vectors.f16.bin length = n x dim x 2
        let vec_len = std::fs::metadata(dest.join(packet::VECTORS_FILE)).unwrap().len();
        assert_eq!(vec_len, (n as u64) * 8 * 2);

        // Empty c.txt skipped
        let chunks = packet::read_chunks(&dest.join(packet::DOCS_FILE)).unwrap();
        assert!(chunks.iter().all(|c| c.meta_str("path") != Some("c.txt")));

        let docs_before = std::fs::read(dest.join(packet::DOCS_FILE)).unwrap();
        let vectors_before = std::fs::read(dest.join(packet::VECTORS_FILE)).unwrap();

        // Re-run with unchanged source: everything reused, bytes stable.
        let embedder2 = MockEmbedder::new(8);
        let rerun = build(&request(&src, &dest), &config(), &embedder2, &fixed_clock())
            .await
            .unwrap();
        assert_eq!(rerun.manifest.incremental.embedded, 0);
        assert_eq!(rerun.manifest.incremental.reused, n);
        assert_eq!(std::fs::read(dest.join(packet::DOCS_FILE)).unwrap(), docs_before);
        assert_eq!(std::fs::read(dest.join(packet::VECTORS_FILE)).unwrap(), vectors_before);
        // Same inputs, same id
        assert_eq!(rerun.manifest.packet_id, result.manifest.packet_id);
    }

    #[tokio::test]
    async fn test_embedding_outage_writes_partial_manifest() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&src).unwrap();
        write_source(&src);

        let embedder = FailingEmbedder { dim: 8 };
        let err = build(&request(&src, &dest), &config(), &embedder, &fixed_clock())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CpmError::Build(BuildError::EmbeddingUnavailable(_))
        ));

        assert!(dest.join(packet::DOCS_FILE).exists());
        assert!(!dest.join(packet::VECTORS_FILE).exists());

        let manifest = packet::read_manifest(&dest.join(packet::MANIFEST_FILE)).unwrap();
        assert_eq!(manifest.files.vectors, None);
        assert_eq!(manifest.files.index, None);
        assert_eq!(
            manifest.extras.get("build_status"),
            Some(&serde_json::json!("embedding_failed"))
        );
        assert!(manifest.extras.contains_key("build_error"));
        // Sentinel is cleaned up even on failure
        assert!(!dest.join(".building").exists());
    }

    #[tokio::test]
    async fn test_resume_after_outage_embeds_everything() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&src).unwrap();
        write_source(&src);

        let failing = FailingEmbedder { dim: 8 };
        let _ = build(&request(&src, &dest), &config(), &failing, &fixed_clock()).await;

        // Second run with a healthy embedder succeeds from the same dest.
        let embedder = MockEmbedder::new(8);
        let result = build(&request(&src, &dest), &config(), &embedder, &fixed_clock())
            .await
            .unwrap();
        assert!(result.manifest.files.vectors.is_some());
        assert_eq!(result.manifest.counts.vectors, result.manifest.counts.docs);
    }

    #[tokio::test]
    async fn test_source_missing_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("missing");
        let dest = temp.path().join("out");

        let embedder = MockEmbedder::new(8);
        let err = build(&request(&src, &dest), &config(), &embedder, &fixed_clock())
            .await
            .unwrap_err();
        assert!(matches!(err, CpmError::Build(BuildError::SourceMissing(_))));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_no_inputs_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("only.png"), b"\x89PNG").unwrap();

        let embedder = MockEmbedder::new(8);
        let err = build(&request(&src, &dest), &config(), &embedder, &fixed_clock())
            .await
            .unwrap_err();
        assert!(matches!(err, CpmError::Build(BuildError::NoInputs)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_dim_mismatch_is_fatal() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&src).unwrap();
        write_source(&src);

        let embedder = WrongDimEmbedder {
            claimed_dim: 8,
            actual_dim: 4,
        };
        let err = build(&request(&src, &dest), &config(), &embedder, &fixed_clock())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CpmError::Build(BuildError::DimMismatch { expected: 8, actual: 4 })
        ));
    }

    #[tokio::test]
    async fn test_build_in_progress_refused() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        write_source(&src);
        std::fs::write(dest.join(".building"), b"").unwrap();

        let embedder = MockEmbedder::new(8);
        let err = build(&request(&src, &dest), &config(), &embedder, &fixed_clock())
            .await
            .unwrap_err();
        assert!(matches!(err, CpmError::Build(BuildError::BuildInProgress(_))));
    }

    #[tokio::test]
    async fn test_destination_exists_without_reuse() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        write_source(&src);
        std::fs::write(dest.join("stale.txt"), "old").unwrap();

        let mut req = request(&src, &dest);
        req.allow_reuse = false;
        let embedder = MockEmbedder::new(8);
        let err = build(&req, &config(), &embedder, &fixed_clock()).await.unwrap_err();
        assert!(matches!(err, CpmError::Build(BuildError::DestinationExists(_))));
    }

    #[tokio::test]
    async fn test_normalization_invariant() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&src).unwrap();
        write_source(&src);

        let embedder = MockEmbedder::new(8);
        build(&request(&src, &dest), &config(), &embedder, &fixed_clock())
            .await
            .unwrap();

        let rows = packet::vectors::read_f16(&dest.join(packet::VECTORS_FILE), 8).unwrap();
        assert!(packet::vectors::norms_within(&rows, 1e-3));
    }

    #[tokio::test]
    async fn test_archive_written_when_configured() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("out");
        std::fs::create_dir_all(&src).unwrap();
        write_source(&src);

        let mut cfg = config();
        cfg.archive = "tar.gz".to_string();
        let embedder = MockEmbedder::new(8);
        let result = build(&request(&src, &dest), &cfg, &embedder, &fixed_clock())
            .await
            .unwrap();
        let archive_path = result.archive_path.unwrap();
        assert!(archive_path.exists());
        assert!(archive_path.to_string_lossy().ends_with("out.tar.gz"));
    }
}
