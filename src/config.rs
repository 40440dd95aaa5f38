use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
///
/// Every section has serde defaults so CPM runs without a config file; the
/// file refines defaults and environment variables override the file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cpm: CpmConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub trust: TrustConfig,
}

/// Workspace-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CpmConfig {
    /// Root of the local cache layout (cas/, index/, meta/, cache/).
    #[serde(default = "default_cpm_root")]
    pub root: PathBuf,
    /// On-disk lockfile name inside a packet directory.
    #[serde(default = "default_lockfile_name")]
    pub lockfile_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Embedding provider configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingsConfig {
    /// OpenAI-compatible embeddings endpoint.
    #[serde(default = "default_embedding_url")]
    pub url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Expected output dimension.
    #[serde(default = "default_dim")]
    pub dim: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
    /// `server`, `client`, or `auto`.
    #[serde(default = "default_normalize_mode")]
    pub normalize_mode: String,
    #[serde(default)]
    pub max_seq_length: Option<u32>,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

/// OCI registry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Default registry base for refs that are not fully qualified,
    /// e.g. `oci://registry.example.com/packets`.
    #[serde(default)]
    pub default: Option<String>,
    /// Hosts CPM may talk to. Empty list means any https host.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Hosts where plain http is tolerated (local registries, tests).
    #[serde(default = "default_http_hosts")]
    pub allow_http_hosts: Vec<String>,
    #[serde(default = "default_oci_timeout")]
    pub timeout_secs: u64,
    /// TTL for alias → digest cache entries, seconds. 0 disables caching.
    #[serde(default = "default_alias_ttl")]
    pub alias_ttl_secs: u64,
}

/// Builder configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_chunk_tokens")]
    pub chunk_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    #[serde(default = "default_max_symbol_blocks")]
    pub max_symbol_blocks_per_chunk: usize,
    #[serde(default = "default_hard_cap_tokens")]
    pub hard_cap_tokens: usize,
    /// Child-chunk token budget; 0 disables hierarchical expansion.
    #[serde(default)]
    pub micro_chunk_tokens: usize,
    /// `none`, `tar.gz`, or `zip`.
    #[serde(default = "default_archive")]
    pub archive: String,
}

/// Retrieval configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    /// Evidence digest truncation budget.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

/// Trust policy for remote artifacts
#[derive(Debug, Clone, Deserialize)]
pub struct TrustConfig {
    /// Fail closed when a required attestation is absent.
    #[serde(default = "default_strict")]
    pub strict: bool,
    /// Media types that must be present in a fetched manifest.
    #[serde(default)]
    pub require_attestations: Vec<String>,
}

fn default_cpm_root() -> PathBuf {
    PathBuf::from(".cpm")
}

fn default_lockfile_name() -> String {
    "cpm.lock.json".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_embedding_url() -> String {
    "http://localhost:8080/v1/embeddings".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dim() -> u32 {
    1536
}

fn default_batch_size() -> usize {
    64
}

fn default_max_retries() -> usize {
    2
}

fn default_embed_timeout() -> u64 {
    10
}

fn default_normalize_mode() -> String {
    "auto".to_string()
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_http_hosts() -> Vec<String> {
    vec!["localhost".to_string(), "127.0.0.1".to_string()]
}

fn default_oci_timeout() -> u64 {
    30
}

fn default_alias_ttl() -> u64 {
    900
}

fn default_chunk_tokens() -> usize {
    200
}

fn default_overlap_tokens() -> usize {
    20
}

fn default_max_symbol_blocks() -> usize {
    8
}

fn default_hard_cap_tokens() -> usize {
    600
}

fn default_archive() -> String {
    "none".to_string()
}

fn default_k() -> usize {
    5
}

fn default_max_chars() -> usize {
    1200
}

impl Default for CpmConfig {
    fn default() -> Self {
        Self {
            root: default_cpm_root(),
            lockfile_name: default_lockfile_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            model: default_embedding_model(),
            dim: default_dim(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout(),
            normalize_mode: default_normalize_mode(),
            max_seq_length: None,
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default: None,
            allowed_hosts: Vec::new(),
            allow_http_hosts: default_http_hosts(),
            timeout_secs: default_oci_timeout(),
            alias_ttl_secs: default_alias_ttl(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            chunk_tokens: default_chunk_tokens(),
            overlap_tokens: default_overlap_tokens(),
            max_symbol_blocks_per_chunk: default_max_symbol_blocks(),
            hard_cap_tokens: default_hard_cap_tokens(),
            micro_chunk_tokens: 0,
            archive: default_archive(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_chars: default_max_chars(),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            strict: default_strict(),
            require_attestations: Vec::new(),
        }
    }
}

fn default_strict() -> bool {
    true
}

impl Config {
    /// Load configuration.
    ///
    /// Loads environment variables from .env (if present), then the config
    /// file, then applies environment overrides. Lookup order for the file:
    /// 1. Path in the CPM_CONFIG environment variable
    /// 2. ./config.toml in the current directory (optional)
    pub fn load() -> Result<Self> {
        // Load .env file if it exists (ignore errors - file is optional)
        let _ = dotenv::dotenv();

        let explicit = std::env::var("CPM_CONFIG").ok().map(PathBuf::from);
        let config_path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from("config.toml"));

        let mut config = if config_path.exists() {
            let config_str = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
            toml::from_str::<Config>(&config_str).context("Failed to parse config.toml")?
        } else if explicit.is_some() {
            // A path named in CPM_CONFIG must exist; the ./config.toml
            // fallback is optional.
            anyhow::bail!("Config file not found: {}", config_path.display());
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply the environment-variable override table.
    ///
    /// `CPM_ROOT`, `REGISTRY`, `EMBEDDING_URL`, `EMBEDDING_MODEL`, with
    /// legacy fallbacks `RAG_CPM_DIR`, `RAG_EMBED_URL`, `RAG_EMBED_MODE`.
    fn apply_env_overrides(&mut self) {
        if let Some(root) = env_first(&["CPM_ROOT", "RAG_CPM_DIR"]) {
            self.cpm.root = PathBuf::from(root);
        }
        if let Some(registry) = env_first(&["REGISTRY"]) {
            self.registry.default = Some(registry);
        }
        if let Some(url) = env_first(&["EMBEDDING_URL", "RAG_EMBED_URL"]) {
            self.embeddings.url = url;
        }
        if let Some(model) = env_first(&["EMBEDDING_MODEL"]) {
            self.embeddings.model = model;
        }
        if let Some(mode) = env_first(&["RAG_EMBED_MODE"]) {
            self.embeddings.normalize_mode = mode;
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.embeddings.dim == 0 {
            anyhow::bail!("embeddings.dim must be greater than 0");
        }

        if self.embeddings.batch_size == 0 {
            anyhow::bail!("embeddings.batch_size must be greater than 0");
        }

        if !matches!(self.embeddings.normalize_mode.as_str(), "server" | "client" | "auto") {
            anyhow::bail!(
                "embeddings.normalize_mode must be one of server, client, auto (got {})",
                self.embeddings.normalize_mode
            );
        }

        if self.build.chunk_tokens == 0 {
            anyhow::bail!("build.chunk_tokens must be greater than 0");
        }

        if self.build.overlap_tokens >= self.build.chunk_tokens {
            anyhow::bail!("build.overlap_tokens must be less than chunk_tokens");
        }

        if self.build.hard_cap_tokens < self.build.chunk_tokens {
            anyhow::bail!("build.hard_cap_tokens must be at least chunk_tokens");
        }

        if !matches!(self.build.archive.as_str(), "none" | "tar.gz" | "zip") {
            anyhow::bail!(
                "build.archive must be one of none, tar.gz, zip (got {})",
                self.build.archive
            );
        }

        if self.retrieval.default_k == 0 {
            anyhow::bail!("retrieval.default_k must be greater than 0");
        }

        Ok(())
    }

    /// Workspace/cache root (CPM_ROOT)
    pub fn cpm_root(&self) -> &Path {
        &self.cpm.root
    }
}

/// First non-empty value among the named environment variables.
fn env_first(names: &[&str]) -> Option<String> {
    for name in names {
        if let Ok(value) = std::env::var(name) {
            if !value.trim().is_empty() {
                return Some(value);
            }
        }
    }
    None
}
