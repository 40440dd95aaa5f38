//! CPM_ROOT cache layout and digest-keyed content-addressed storage.
//!
//! ```text
//! CPM_ROOT/
//!   cas/<digest>/payload/...               immutable packet files
//!   index/<digest>/<embedding_fp>/         index + lock
//!   meta/<digest>/packet.manifest.json     normalized metadata
//!   cache/metadata/<digest>.json           resolver metadata cache
//!   cache/metadata_alias/<alias_hash>.json TTL alias cache
//! ```
//!
//! Entries under `cas/` are immutable once materialized: rebuilds write new
//! digest directories, never overwrite. Per-digest writers serialize on an
//! advisory file lock.

use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{CpmError, Result};

/// Resolved CPM_ROOT, passed explicitly to every constructor that needs it.
#[derive(Debug, Clone)]
pub struct CpmRoot {
    root: PathBuf,
}

impl CpmRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// `cas/<digest>/payload/`: the materialized packet files.
    pub fn cas_payload_dir(&self, digest: &str) -> PathBuf {
        self.root.join("cas").join(digest).join("payload")
    }

    /// `cas/<digest>/staging/`: extraction scratch, renamed into payload.
    pub fn cas_staging_dir(&self, digest: &str) -> PathBuf {
        self.root.join("cas").join(digest).join("staging")
    }

    /// `cas/<digest>.lock`: single-writer-per-digest advisory lock.
    pub fn cas_lock_path(&self, digest: &str) -> PathBuf {
        self.root.join("cas").join(format!("{}.lock", digest))
    }

    /// `index/<digest>/<fp>/`: search index for a (packet, embedder) pair.
    pub fn index_dir(&self, digest: &str, fingerprint: &str) -> PathBuf {
        self.root.join("index").join(digest).join(fingerprint)
    }

    /// `index/<digest>/<fp>/.lock`: single-rebuilder lock.
    pub fn index_lock_path(&self, digest: &str, fingerprint: &str) -> PathBuf {
        self.index_dir(digest, fingerprint).join(".lock")
    }

    /// `meta/<digest>/packet.manifest.json`: normalized metadata copy.
    pub fn meta_manifest_path(&self, digest: &str) -> PathBuf {
        self.root.join("meta").join(digest).join("packet.manifest.json")
    }

    /// `cache/metadata/<digest>.json`: digest-keyed resolver cache.
    pub fn metadata_cache_path(&self, digest: &str) -> PathBuf {
        self.root.join("cache").join("metadata").join(format!("{}.json", digest))
    }

    /// `cache/metadata_alias/<alias_hash>.json`: TTL alias cache.
    pub fn alias_cache_path(&self, alias_key: &str) -> PathBuf {
        self.root
            .join("cache")
            .join("metadata_alias")
            .join(format!("{}.json", alias_key))
    }

    /// Whether a payload for `digest` is fully materialized.
    pub fn has_payload(&self, digest: &str) -> bool {
        self.cas_payload_dir(digest).join("manifest.json").exists()
    }
}

/// Held advisory lock; released on drop.
///
/// Acquisition blocks until the current holder releases, which is exactly
/// the single-writer discipline fetch and index-rebuild need.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock at `path` is acquired.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        file.lock_exclusive()
            .map_err(|e| CpmError::Storage(format!("lock {} failed: {}", path.display(), e)))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Write bytes atomically: temp file in the same directory, then rename.
/// Readers either see the old content or the new, never a torn write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CpmError::Storage(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("write")
    ));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Rename a fully staged directory into its final location. If the target
/// already exists (a concurrent writer won), the staging dir is discarded.
/// Never leaves a partial target behind.
pub fn promote_staging(staging: &Path, target: &Path) -> Result<()> {
    if target.exists() {
        std::fs::remove_dir_all(staging)?;
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(staging, target) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_dir_all(staging);
            Err(CpmError::Storage(format!(
                "failed to promote staging into {}: {}",
                target.display(),
                e
            )))
        }
    }
}
