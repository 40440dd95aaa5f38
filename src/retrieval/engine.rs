//! Retrieval engine: the cache-hit / remote-miss query path over pinned
//! digests.
//!
//! A query needs two things materialized: the packet payload under
//! `cas/<digest>/payload` and a search index under
//! `index/<digest>/<embedding_fp>/`. The fingerprint ties the index to the
//! query-time embedder, so packets embedded with a different model get
//! their own index rather than wrong scores. Index rebuilds are guarded by
//! a per-fingerprint lock: concurrent queries see at most one rebuild.

use std::path::Path;

use crate::cas::FileLock;
use crate::embeddings::Embedder;
use crate::error::{CpmError, Result};
use crate::hash::embedding_fingerprint;
use crate::index::FlatIpIndex;
use crate::oci::{PacketRef, RegistryClient, Resolver};
use crate::packet::{self, DocOffsets};

/// Characters of chunk text included in a hit snippet.
const SNIPPET_CHARS: usize = 240;

/// One scored hit.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit {
    pub score: f32,
    pub path: String,
    pub start: u64,
    pub end: u64,
    pub snippet: String,
    pub chunk_id: String,
}

/// A complete query response.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// True when both payload and index pre-existed: zero OCI calls.
    pub cache_hit: bool,
    pub pinned_uri: String,
    pub digest: String,
    pub results: Vec<QueryHit>,
}

pub struct RetrievalEngine<C: RegistryClient, E: Embedder> {
    resolver: Resolver<C>,
    embedder: E,
}

impl<C: RegistryClient, E: Embedder> RetrievalEngine<C, E> {
    pub fn new(resolver: Resolver<C>, embedder: E) -> Self {
        Self { resolver, embedder }
    }

    pub fn resolver(&self) -> &Resolver<C> {
        &self.resolver
    }

    fn fingerprint(&self) -> String {
        embedding_fingerprint(
            self.embedder.model(),
            self.embedder.dim(),
            self.embedder.normalized(),
        )
    }

    /// Execute a query against a reference (pinned or alias).
    pub async fn query(&self, packet_ref: &PacketRef, q: &str, k: usize) -> Result<QueryResult> {
        let digest = self.resolver.resolve_digest(packet_ref).await?;
        let pinned_uri = packet_ref.pinned(&digest).to_uri();
        let root = self.resolver.root().clone();

        let fingerprint = self.fingerprint();
        let index_path = root.index_dir(&digest, &fingerprint).join("index.faiss");
        let cache_hit = root.has_payload(&digest) && index_path.exists();

        let payload_dir = if root.has_payload(&digest) {
            root.cas_payload_dir(&digest)
        } else {
            self.resolver.resolve_and_fetch(packet_ref).await?.payload_dir
        };

        if !index_path.exists() {
            self.ensure_index(&digest, &fingerprint, &payload_dir, &index_path)
                .await?;
        }

        let index = FlatIpIndex::load(&index_path)?;
        if index.dim() != self.embedder.dim() {
            return Err(CpmError::Retrieval(format!(
                "index dimension {} does not match embedder dimension {}",
                index.dim(),
                self.embedder.dim()
            )));
        }

        let mut query_rows = self.embedder.embed(&[q.to_string()]).await?;
        let mut query_vec = query_rows
            .pop()
            .ok_or_else(|| CpmError::Retrieval("empty query embedding".to_string()))?;
        l2_normalize(&mut query_vec);

        let hits = index.search(&query_vec, k.max(1))?;

        // Collate hit rows with document text, loaded lazily by byte offset.
        let docs_path = payload_dir.join(packet::DOCS_FILE);
        let offsets = DocOffsets::build(&docs_path)?;
        let mut results = Vec::with_capacity(hits.len());
        for hit in hits {
            let chunk = offsets.load(&docs_path, hit.row)?;
            results.push(QueryHit {
                score: hit.score,
                path: chunk.meta_str("path").unwrap_or_default().to_string(),
                start: chunk.meta_u64("line_start").unwrap_or(0),
                end: chunk.meta_u64("line_end").unwrap_or(0),
                snippet: snippet_of(&chunk.text),
                chunk_id: chunk.id,
            });
        }

        Ok(QueryResult {
            cache_hit,
            pinned_uri,
            digest,
            results,
        })
    }

    /// Make sure an index exists for `(digest, fingerprint)`: mirror the
    /// shipped index when the packet's embedding spec matches the
    /// query-time embedder, otherwise rebuild from `docs.jsonl`. Guarded by
    /// the per-fingerprint lock so concurrent queries rebuild at most once.
    async fn ensure_index(
        &self,
        digest: &str,
        fingerprint: &str,
        payload_dir: &Path,
        index_path: &Path,
    ) -> Result<()> {
        let root = self.resolver.root();
        let lock_path = root.index_lock_path(digest, fingerprint);
        let _lock = tokio::task::spawn_blocking(move || FileLock::acquire(&lock_path))
            .await
            .map_err(|e| CpmError::Storage(format!("lock task failed: {}", e)))??;

        if index_path.exists() {
            return Ok(());
        }

        if self.can_mirror(payload_dir) {
            log::debug!("mirroring shipped index for {}", digest);
            let shipped = payload_dir.join(packet::INDEX_FILE);
            write_index_atomically(index_path, &std::fs::read(&shipped)?)?;
            return Ok(());
        }

        log::info!("rebuilding index for {} with {}", digest, self.embedder.model());
        let chunks = packet::read_chunks(&payload_dir.join(packet::DOCS_FILE))?;
        if chunks.is_empty() {
            return Err(CpmError::Retrieval(format!(
                "packet {} has no chunks to index",
                digest
            )));
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut rows = self.embedder.embed(&texts).await?;
        packet::vectors::l2_normalize_rows(&mut rows);

        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let index = FlatIpIndex::build(self.embedder.dim(), &rows, ids)?;

        // Build in a scratch file; the final name only appears complete. A
        // cancelled rebuild leaves no index.faiss, so the next query
        // restarts it.
        let tmp = index_path.with_extension("faiss.tmp");
        index.save(&tmp)?;
        std::fs::rename(&tmp, index_path).map_err(CpmError::Io)?;
        Ok(())
    }

    /// Whether the shipped index can be reused as-is: the payload carries
    /// both index and vectors, and its embedding spec matches the
    /// query-time embedder.
    fn can_mirror(&self, payload_dir: &Path) -> bool {
        let index_file = payload_dir.join(packet::INDEX_FILE);
        let vectors_file = payload_dir.join(packet::VECTORS_FILE);
        if !index_file.exists() || !vectors_file.exists() {
            return false;
        }
        match packet::read_manifest(&payload_dir.join(packet::MANIFEST_FILE)) {
            Ok(manifest) => {
                manifest.embedding.model == self.embedder.model()
                    && manifest.embedding.dim == self.embedder.dim()
                    && manifest.embedding.normalized == self.embedder.normalized()
            }
            Err(_) => false,
        }
    }
}

fn l2_normalize(row: &mut [f32]) {
    let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in row.iter_mut() {
            *x /= norm;
        }
    }
}

fn snippet_of(text: &str) -> String {
    if text.len() <= SNIPPET_CHARS {
        return text.to_string();
    }
    let mut end = SNIPPET_CHARS;
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    text[..end].to_string()
}

fn write_index_atomically(index_path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = index_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = index_path.with_extension("faiss.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, index_path)?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::{make_chunk, publish_packet, HashEmbedder};
    use super::*;
    use crate::cas::CpmRoot;
    use crate::config::{RegistryConfig, TrustConfig};
    use crate::oci::resolver::testing::{sample_metadata, FakeRegistry};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn engine<'a>(
        registry: &'a FakeRegistry,
        temp: &TempDir,
        dim: u32,
    ) -> RetrievalEngine<&'a FakeRegistry, HashEmbedder> {
        let resolver = Resolver::new(
            registry,
            CpmRoot::new(temp.path()),
            RegistryConfig::default(),
            TrustConfig::default(),
        );
        RetrievalEngine::new(resolver, HashEmbedder { dim })
    }

    fn demo_ref() -> PacketRef {
        PacketRef::parse("oci://reg.example.com/team/demo:1.0.0").unwrap()
    }

    fn chunks() -> Vec<crate::packet::types::DocChunk> {
        vec![
            make_chunk("a.md:0", "a.md", "configure the retry budget for uploads"),
            make_chunk("a.md:1", "a.md", "tuning the flush interval"),
            make_chunk("b.md:0", "b.md", "unrelated release notes"),
        ]
    }

    #[tokio::test]
    async fn test_cache_miss_then_hit() {
        let registry = FakeRegistry::new();
        let embedder = HashEmbedder { dim: 16 };
        publish_packet(&registry, "1.0.0", &sample_metadata("demo"), &chunks(), &embedder, true);

        let temp = TempDir::new().unwrap();
        let engine = engine(&registry, &temp, 16);

        // First query: remote miss, materializes and mirrors the index.
        let first = engine
            .query(&demo_ref(), "configure the retry budget for uploads", 3)
            .await
            .unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.results[0].chunk_id, "a.md:0");
        assert_eq!(first.results[0].path, "a.md");
        assert!(first.results[0].score > 0.99);

        // Second identical query: zero OCI calls, identical response.
        let manifest_calls = registry.manifest_calls.load(Ordering::SeqCst);
        let blob_calls = registry.blob_calls.load(Ordering::SeqCst);
        let second = engine
            .query(&demo_ref(), "configure the retry budget for uploads", 3)
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.results, first.results);
        assert_eq!(second.pinned_uri, first.pinned_uri);
        assert_eq!(registry.manifest_calls.load(Ordering::SeqCst), manifest_calls);
        assert_eq!(registry.blob_calls.load(Ordering::SeqCst), blob_calls);
    }

    #[tokio::test]
    async fn test_mirrors_shipped_index_when_spec_matches() {
        let registry = FakeRegistry::new();
        let embedder = HashEmbedder { dim: 16 };
        publish_packet(&registry, "1.0.0", &sample_metadata("demo"), &chunks(), &embedder, true);

        let temp = TempDir::new().unwrap();
        let engine = engine(&registry, &temp, 16);
        let result = engine.query(&demo_ref(), "tuning the flush interval", 1).await.unwrap();

        // The mirrored index file equals the shipped one byte-for-byte.
        let root = CpmRoot::new(temp.path());
        let fp = crate::hash::embedding_fingerprint("hash-model", 16, true);
        let mirrored = root.index_dir(&result.digest, &fp).join("index.faiss");
        let shipped = root.cas_payload_dir(&result.digest).join(packet::INDEX_FILE);
        assert_eq!(
            std::fs::read(&mirrored).unwrap(),
            std::fs::read(&shipped).unwrap()
        );
    }

    #[tokio::test]
    async fn test_rebuilds_index_when_packet_has_none() {
        let registry = FakeRegistry::new();
        let embedder = HashEmbedder { dim: 16 };
        publish_packet(&registry, "1.0.0", &sample_metadata("demo"), &chunks(), &embedder, false);

        let temp = TempDir::new().unwrap();
        let engine = engine(&registry, &temp, 16);
        let result = engine
            .query(&demo_ref(), "unrelated release notes", 2)
            .await
            .unwrap();
        assert_eq!(result.results[0].chunk_id, "b.md:0");

        let root = CpmRoot::new(temp.path());
        let fp = crate::hash::embedding_fingerprint("hash-model", 16, true);
        assert!(root.index_dir(&result.digest, &fp).join("index.faiss").exists());
    }

    #[tokio::test]
    async fn test_results_ordered_desc_with_id_tie_break() {
        let registry = FakeRegistry::new();
        let embedder = HashEmbedder { dim: 16 };
        // Two chunks with identical text score identically; ids break the tie.
        let chunks = vec![
            make_chunk("z.md:0", "z.md", "duplicate body"),
            make_chunk("a.md:0", "a.md", "duplicate body"),
            make_chunk("m.md:0", "m.md", "something else entirely"),
        ];
        publish_packet(&registry, "1.0.0", &sample_metadata("demo"), &chunks, &embedder, true);

        let temp = TempDir::new().unwrap();
        let engine = engine(&registry, &temp, 16);
        let result = engine.query(&demo_ref(), "duplicate body", 3).await.unwrap();

        assert_eq!(result.results[0].chunk_id, "a.md:0");
        assert_eq!(result.results[1].chunk_id, "z.md:0");
        assert!(result.results[0].score >= result.results[1].score);
        assert!(result.results[1].score >= result.results[2].score);
    }

    #[tokio::test]
    async fn test_snippet_and_line_ranges() {
        let registry = FakeRegistry::new();
        let embedder = HashEmbedder { dim: 16 };
        publish_packet(&registry, "1.0.0", &sample_metadata("demo"), &chunks(), &embedder, true);

        let temp = TempDir::new().unwrap();
        let engine = engine(&registry, &temp, 16);
        let result = engine.query(&demo_ref(), "tuning the flush interval", 1).await.unwrap();
        let hit = &result.results[0];
        assert_eq!(hit.start, 1);
        assert_eq!(hit.end, 3);
        assert_eq!(hit.snippet, "tuning the flush interval");
    }

    #[tokio::test]
    async fn test_pinned_ref_skips_alias_resolution() {
        let registry = FakeRegistry::new();
        let embedder = HashEmbedder { dim: 16 };
        publish_packet(&registry, "1.0.0", &sample_metadata("demo"), &chunks(), &embedder, true);

        let temp = TempDir::new().unwrap();
        let engine = engine(&registry, &temp, 16);
        let first = engine.query(&demo_ref(), "anything", 1).await.unwrap();

        let pinned = demo_ref().pinned(&first.digest);
        let resolves_before = registry.resolve_calls.load(Ordering::SeqCst);
        let result = engine.query(&pinned, "anything", 1).await.unwrap();
        assert_eq!(result.digest, first.digest);
        assert_eq!(registry.resolve_calls.load(Ordering::SeqCst), resolves_before);
    }
}
