//! OCI source resolver: metadata-first lookup and lazy, digest-keyed
//! payload materialization.
//!
//! `lookup_metadata` never touches the payload: after alias resolution it
//! costs exactly one manifest fetch plus one small blob fetch, and both
//! results are cached (digest-keyed forever, alias-keyed with a TTL).
//! `resolve_and_fetch` materializes the payload under `cas/<digest>/payload`
//! behind a per-digest advisory lock; either the payload lands complete or
//! the staging directory is removed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cas::{atomic_write, promote_staging, CpmRoot, FileLock};
use crate::config::{RegistryConfig, TrustConfig};
use crate::error::{CpmError, OciError, Result};
use crate::hash::{alias_cache_key, canonical_json_string};
use crate::oci::metadata::{parse_metadata, PacketMetadata, METADATA_MEDIA_TYPE};
use crate::oci::reference::PacketRef;
use crate::oci::registry::{OciImageManifest, RegistryClient};

/// Result of a metadata-only lookup.
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub digest: String,
    pub pinned_uri: String,
    pub metadata: PacketMetadata,
}

/// Result of a full payload materialization.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub digest: String,
    pub pinned_uri: String,
    pub payload_dir: PathBuf,
}

/// TTL alias-cache entry, `(host, repo, name, alias)`-keyed.
#[derive(Debug, Serialize, Deserialize)]
struct AliasCacheEntry {
    digest: String,
    cached_at: i64,
}

pub struct Resolver<C: RegistryClient> {
    client: C,
    root: CpmRoot,
    registry: RegistryConfig,
    trust: TrustConfig,
}

impl<C: RegistryClient> Resolver<C> {
    pub fn new(client: C, root: CpmRoot, registry: RegistryConfig, trust: TrustConfig) -> Self {
        Self {
            client,
            root,
            registry,
            trust,
        }
    }

    pub fn root(&self) -> &CpmRoot {
        &self.root
    }

    /// Resolve any reference form to a digest. Pinned refs skip the
    /// registry; aliases go through the TTL cache first.
    pub async fn resolve_digest(&self, packet_ref: &PacketRef) -> Result<String> {
        if let Some(digest) = packet_ref.digest() {
            return Ok(digest.to_string());
        }

        let key = alias_cache_key(
            &packet_ref.host,
            &packet_ref.repo,
            &packet_ref.name,
            packet_ref.reference_str(),
        );
        let cache_path = self.root.alias_cache_path(&key);
        if let Some(digest) = self.read_alias_cache(&cache_path) {
            log::debug!("alias cache hit for {}", packet_ref.to_uri());
            return Ok(digest);
        }

        let digest = self.client.resolve_digest(packet_ref).await?;

        let entry = AliasCacheEntry {
            digest: digest.clone(),
            cached_at: Utc::now().timestamp(),
        };
        if let Ok(json) = canonical_json_string(&entry) {
            // Cache write failures are not lookup failures.
            if let Err(e) = atomic_write(&cache_path, json.as_bytes()) {
                log::warn!("alias cache write failed: {}", e);
            }
        }
        Ok(digest)
    }

    /// Read the alias cache, honoring the TTL (0 disables expiry).
    fn read_alias_cache(&self, path: &Path) -> Option<String> {
        let content = std::fs::read_to_string(path).ok()?;
        let entry: AliasCacheEntry = serde_json::from_str(&content).ok()?;
        if self.registry.alias_ttl_secs > 0 {
            let age = Utc::now().timestamp() - entry.cached_at;
            if age < 0 || age as u64 >= self.registry.alias_ttl_secs {
                return None;
            }
        }
        Some(entry.digest)
    }

    /// Metadata-only lookup: exactly one manifest fetch plus one blob fetch
    /// per fresh digest, no payload download.
    pub async fn lookup_metadata(&self, packet_ref: &PacketRef) -> Result<LookupResult> {
        let digest = self.resolve_digest(packet_ref).await?;
        let pinned_uri = packet_ref.pinned(&digest).to_uri();

        // Digest-keyed entries are immutable and reused across processes.
        let cache_path = self.root.metadata_cache_path(&digest);
        if let Ok(content) = std::fs::read(&cache_path) {
            if let Ok(metadata) = parse_metadata(&content) {
                log::debug!("metadata cache hit for {}", digest);
                return Ok(LookupResult {
                    digest,
                    pinned_uri,
                    metadata,
                });
            }
        }

        let manifest = self.client.fetch_manifest(packet_ref, &digest).await?;
        let descriptor = select_metadata_layer(&manifest).ok_or_else(|| {
            CpmError::Oci(OciError::Protocol(format!(
                "no metadata layer in manifest for {}",
                pinned_uri
            )))
        })?;
        let blob = self.client.fetch_blob(packet_ref, &descriptor.digest).await?;
        let metadata = parse_metadata(&blob)?;

        let json = canonical_json_string(&metadata)?;
        atomic_write(&cache_path, json.as_bytes())?;

        Ok(LookupResult {
            digest,
            pinned_uri,
            metadata,
        })
    }

    /// Materialize the payload for a reference, pulling at most once per
    /// digest across concurrent callers.
    pub async fn resolve_and_fetch(&self, packet_ref: &PacketRef) -> Result<FetchResult> {
        let digest = self.resolve_digest(packet_ref).await?;
        let pinned_uri = packet_ref.pinned(&digest).to_uri();
        let payload_dir = self.root.cas_payload_dir(&digest);

        // Fast path without the lock.
        if self.root.has_payload(&digest) {
            return Ok(FetchResult {
                digest,
                pinned_uri,
                payload_dir,
            });
        }

        // Single writer per digest. Acquisition happens off the async
        // executor; contending callers park until the winner finishes.
        let lock_path = self.root.cas_lock_path(&digest);
        let _lock = tokio::task::spawn_blocking(move || FileLock::acquire(&lock_path))
            .await
            .map_err(|e| CpmError::Storage(format!("lock task failed: {}", e)))??;

        // Re-check under the lock: the previous holder may have extracted.
        if self.root.has_payload(&digest) {
            return Ok(FetchResult {
                digest,
                pinned_uri,
                payload_dir,
            });
        }

        let manifest = self.client.fetch_manifest(packet_ref, &digest).await?;
        self.check_trust(&manifest)?;

        let staging = self.root.cas_staging_dir(&digest);
        match self.extract_to_staging(packet_ref, &manifest, &staging).await {
            Ok(metadata) => {
                promote_staging(&staging, &payload_dir)?;
                if let Some(metadata) = metadata {
                    let json = canonical_json_string(&metadata)?;
                    atomic_write(&self.root.meta_manifest_path(&digest), json.as_bytes())?;
                }
                log::info!("materialized {} into {}", pinned_uri, payload_dir.display());
                Ok(FetchResult {
                    digest,
                    pinned_uri,
                    payload_dir,
                })
            }
            Err(e) => {
                // Never leave a partial cache entry behind.
                let _ = std::fs::remove_dir_all(&staging);
                Err(e)
            }
        }
    }

    /// Trust policy gate, evaluated before any blob download. With
    /// `strict`, a required attestation media type missing from the
    /// manifest refuses the fetch.
    fn check_trust(&self, manifest: &OciImageManifest) -> Result<()> {
        if !self.trust.strict {
            return Ok(());
        }
        for required in &self.trust.require_attestations {
            if !manifest.layers.iter().any(|l| &l.media_type == required) {
                return Err(CpmError::Oci(OciError::PolicyDenied(format!(
                    "required attestation {} is absent",
                    required
                ))));
            }
        }
        Ok(())
    }

    /// Pull every payload layer into `staging`, verifying digests and path
    /// safety. Returns the parsed metadata layer when one is present.
    async fn extract_to_staging(
        &self,
        packet_ref: &PacketRef,
        manifest: &OciImageManifest,
        staging: &Path,
    ) -> Result<Option<PacketMetadata>> {
        if staging.exists() {
            std::fs::remove_dir_all(staging)?;
        }
        std::fs::create_dir_all(staging)?;

        let mut metadata = None;
        for layer in &manifest.layers {
            let bytes = self.client.fetch_blob(packet_ref, &layer.digest).await?;

            if layer.media_type == METADATA_MEDIA_TYPE {
                metadata = Some(parse_metadata(&bytes)?);
                continue;
            }
            if !self.trust.require_attestations.is_empty()
                && self.trust.require_attestations.contains(&layer.media_type)
            {
                // Attestation layers are checked for presence, not stored.
                continue;
            }

            let name = layer.title().ok_or_else(|| {
                CpmError::Oci(OciError::Protocol(format!(
                    "layer {} has no file name annotation",
                    layer.digest
                )))
            })?;
            validate_entry_path(name)?;

            let target = staging.join(name);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &bytes)?;
        }
        Ok(metadata)
    }
}

/// Select the metadata layer: the v1 media type first, otherwise any JSON
/// layer (the legacy shape is detected at parse time), otherwise nothing.
fn select_metadata_layer(manifest: &OciImageManifest) -> Option<&crate::oci::registry::OciDescriptor> {
    manifest
        .layers
        .iter()
        .find(|l| l.media_type == METADATA_MEDIA_TYPE)
        .or_else(|| {
            manifest
                .layers
                .iter()
                .find(|l| l.media_type.ends_with("+json") || l.media_type == "application/json")
        })
}

/// Reject archive entries that would escape the extraction root. Extracted
/// entries are always written as regular files, so symlink tricks cannot
/// redirect writes either.
fn validate_entry_path(name: &str) -> Result<()> {
    let unsafe_path = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.split('/').any(|part| part == ".." || part.is_empty());
    if unsafe_path {
        return Err(CpmError::Oci(OciError::PathUnsafe(name.to_string())));
    }
    Ok(())
}
