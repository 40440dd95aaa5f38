use std::path::PathBuf;
use thiserror::Error;

/// Main error type for CPM
///
/// Every error belongs to one taxonomy bucket: configuration, source tree,
/// embedding transport, storage, OCI distribution, lockfile, or retrieval.
/// Reason strings never carry tokens or secrets.
#[derive(Error, Debug)]
pub enum CpmError {
    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (bad input, missing required values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Builder failures
    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    /// Embedding client failures
    #[error("Embedding error: {0}")]
    Embed(#[from] EmbedError),

    /// Storage failures (atomic rename, cache layout)
    #[error("Storage error: {0}")]
    Storage(String),

    /// OCI lookup / fetch / policy failures
    #[error("OCI error: {0}")]
    Oci(#[from] OciError),

    /// Lockfile plan / artifact / determinism failures
    #[error("Lockfile error: {0}")]
    Lockfile(#[from] LockfileError),

    /// Retrieval failures (missing packet, no index, embedder mismatch)
    #[error("Retrieval error: {0}")]
    Retrieval(String),

    /// Parse errors (manifest, metadata, lockfile JSON)
    #[error("Parse error: {0}")]
    Parse(String),

    /// MCP protocol errors
    #[error("MCP protocol error: {0}")]
    McpProtocol(String),
}

/// Builder failure kinds, mirroring the builder's failure table.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Source path does not exist; nothing was written.
    #[error("source path missing: {}", .0.display())]
    SourceMissing(PathBuf),

    /// The scan accepted zero files; nothing was written.
    #[error("no acceptable input files under source path")]
    NoInputs,

    /// Destination already exists and the caller did not ask to reuse it.
    #[error("destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),

    /// Another build holds the destination (`.building` sentinel present).
    #[error("destination is being written by another build: {}", .0.display())]
    BuildInProgress(PathBuf),

    /// Embedding server unreachable; a partial manifest was written.
    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Embedder output dimension does not match configuration, even after
    /// invalidating the incremental cache.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimMismatch { expected: u32, actual: u32 },

    /// The embedding response contained NaN or Inf.
    #[error("non-finite value in embedding row {row}")]
    NonFiniteVector { row: usize },

    /// The index could not be persisted; the partial file was removed.
    #[error("index write failed: {0}")]
    IndexWriteFailed(String),
}

/// Embedding client failure kinds.
#[derive(Error, Debug)]
pub enum EmbedError {
    /// 4xx from the provider: the request itself is wrong, never retried.
    #[error("bad request to embedding provider: {0}")]
    BadRequest(String),

    /// 5xx or timeout after retries were exhausted.
    #[error("embedding provider upstream failure: {0}")]
    Upstream(String),

    /// Response shape did not match the request (row count, parse).
    #[error("malformed embedding response: {0}")]
    Malformed(String),
}

/// OCI lookup / fetch failure kinds with their HTTP mapping.
#[derive(Error, Debug)]
pub enum OciError {
    /// 404 from the registry.
    #[error("not found: {0}")]
    NotFound(String),

    /// 401 / 403 from the registry.
    #[error("authentication required for {0}")]
    AuthRequired(String),

    /// 429 from the registry (retryable with backoff).
    #[error("rate limited by registry")]
    RateLimited,

    /// 5xx or timeout (retryable, bounded).
    #[error("registry upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Host allowlist / scheme / trust policy refused the operation.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// Downloaded content does not hash to the expected digest. Fatal.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Archive entry would escape the extraction root. Fatal.
    #[error("unsafe path in artifact: {0}")]
    PathUnsafe(String),

    /// The reference string could not be parsed.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// Malformed manifest or metadata blob.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl OciError {
    /// Whether the operation may be retried (backoff applies).
    pub fn is_retryable(&self) -> bool {
        matches!(self, OciError::RateLimited | OciError::UpstreamUnavailable(_))
    }
}

/// Lockfile verification failure kinds.
#[derive(Error, Debug)]
pub enum LockfileError {
    /// On-disk lockfile does not match the freshly computed plan.
    #[error("plan mismatch: {0}")]
    PlanMismatch(String),

    /// An artifact named by the lockfile is absent on disk.
    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    /// An artifact hash does not match the lockfile entry.
    #[error("artifact hash mismatch for {0}")]
    ArtifactHashMismatch(String),

    /// `--frozen-lockfile` was requested but a non-deterministic marker exists.
    #[error("frozen determinism violation: {0}")]
    FrozenDeterminismViolation(String),

    /// The lockfile JSON could not be parsed.
    #[error("unreadable lockfile: {0}")]
    Unreadable(String),
}

/// Convenient Result type using CpmError
pub type Result<T> = std::result::Result<T, CpmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CpmError::Config("missing registry".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("missing registry"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let cpm_err: CpmError = io_err.into();
        assert!(matches!(cpm_err, CpmError::Io(_)));
    }

    #[test]
    fn test_build_error_wraps() {
        let err: CpmError = BuildError::NoInputs.into();
        assert!(matches!(err, CpmError::Build(BuildError::NoInputs)));
        assert!(err.to_string().contains("no acceptable input files"));
    }

    #[test]
    fn test_oci_retryable() {
        assert!(OciError::RateLimited.is_retryable());
        assert!(OciError::UpstreamUnavailable("503".into()).is_retryable());
        assert!(!OciError::NotFound("demo".into()).is_retryable());
        assert!(!OciError::DigestMismatch {
            expected: "sha256:aa".into(),
            actual: "sha256:bb".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_frozen_violation_display() {
        let err: CpmError =
            LockfileError::FrozenDeterminismViolation("models[0] is non-deterministic".into())
                .into();
        assert!(err.to_string().contains("frozen determinism violation"));
    }
}
