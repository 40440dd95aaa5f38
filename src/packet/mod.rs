//! Packet file format: types and on-disk I/O.
//!
//! A packet directory contains `docs.jsonl`, `vectors.f16.bin`,
//! `faiss/index.faiss`, `cpm.yml`, `manifest.json`, and `cpm.lock.json`.
//! Everything in here is value-typed and deterministic; row `i` of the
//! vector file always corresponds to line `i` of `docs.jsonl`.

pub mod docs;
pub mod manifest;
pub mod meta_yaml;
pub mod types;
pub mod vectors;

pub use docs::{read_chunks, write_chunks, DocOffsets};
pub use manifest::{read_manifest, write_manifest};
pub use meta_yaml::{write_cpm_yaml, CpmYaml};
pub use types::{
    Checksum, Counts, DocChunk, EmbeddingSpec, FilesSpec, IncrementalInfo, PacketManifest,
    SimilaritySpec, SourceInfo,
};

/// Conventional file names inside a packet directory.
pub const DOCS_FILE: &str = "docs.jsonl";
pub const VECTORS_FILE: &str = "vectors.f16.bin";
pub const INDEX_FILE: &str = "faiss/index.faiss";
pub const META_YAML_FILE: &str = "cpm.yml";
pub const MANIFEST_FILE: &str = "manifest.json";
