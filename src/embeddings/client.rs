use crate::config::EmbeddingsConfig;
use crate::embeddings::cache::EmbeddingCache;
use crate::error::{CpmError, EmbedError, Result};
use crate::packet::vectors;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// The embedding contract consumed by the builder and the retrieval engine.
///
/// Implementations return one f32 row per input text, row-aligned to the
/// input order. The wire format behind `embed` is deliberately out of
/// scope; tests substitute deterministic in-process embedders.
pub trait Embedder {
    fn model(&self) -> &str;
    fn dim(&self) -> u32;
    /// Whether returned rows are L2-normalized.
    fn normalized(&self) -> bool;
    fn max_seq_length(&self) -> Option<u32>;
    fn embed(
        &self,
        texts: &[String],
    ) -> impl std::future::Future<Output = Result<Vec<Vec<f32>>>> + Send;
}

/// Post-processing applied to provider output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeMode {
    /// Trust the server's output as-is.
    Server,
    /// Always L2-normalize locally.
    Client,
    /// Normalize locally iff norms deviate from 1.0 by more than 1e-3.
    Auto,
}

impl NormalizeMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "server" => Ok(NormalizeMode::Server),
            "client" => Ok(NormalizeMode::Client),
            "auto" => Ok(NormalizeMode::Auto),
            other => Err(CpmError::Config(format!(
                "unknown normalize mode: {}",
                other
            ))),
        }
    }
}

/// Semantic hints that ride as `X-Embedding-*` headers; the request body
/// stays OpenAI-shaped (`input`, `model`, optional `dimensions`).
#[derive(Debug, Clone, Default)]
pub struct EmbedHints {
    pub task: Option<String>,
    pub normalize: Option<bool>,
}

/// Request structure for the OpenAI-compatible embeddings ingress
#[derive(Serialize)]
struct EmbeddingRequest {
    input: Vec<String>,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<u32>,
}

/// Response structure from the embeddings API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// HTTP embedding client
///
/// Handles batch embedding generation with retry logic and local
/// normalization. Optionally caches query embeddings to reduce API calls.
pub struct HttpEmbedder {
    client: Client,
    url: String,
    model: String,
    dim: u32,
    batch_size: usize,
    max_retries: usize,
    normalize_mode: NormalizeMode,
    max_seq_length: Option<u32>,
    hints: EmbedHints,
    cache: Option<Arc<EmbeddingCache>>,
}

impl HttpEmbedder {
    /// Create an embedder from configuration.
    ///
    /// Fails if the endpoint URL scheme is not http or https.
    pub fn from_config(config: &EmbeddingsConfig, cache: Option<Arc<EmbeddingCache>>) -> Result<Self> {
        validate_url(&config.url)?;
        let normalize_mode = NormalizeMode::parse(&config.normalize_mode)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CpmError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            model: config.model.clone(),
            dim: config.dim,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
            normalize_mode,
            max_seq_length: config.max_seq_length,
            hints: EmbedHints::default(),
            cache,
        })
    }

    /// Replace the semantic hints sent with every request.
    pub fn with_hints(mut self, hints: EmbedHints) -> Self {
        self.hints = hints;
        self
    }

    /// Embed a batch of texts, splitting into `batch_size` requests.
    /// The final matrix is row-aligned to the input.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all_rows = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let rows = self.embed_batch_with_retry(batch).await?;
            all_rows.extend(rows);
        }

        self.postprocess(all_rows)
    }

    /// Embed a single query text, consulting the LRU cache first.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(text) {
                log::debug!("embedding cache hit for query");
                return Ok(cached);
            }
        }

        let mut rows = self.embed_batch(&[text.to_string()]).await?;
        let row = rows
            .pop()
            .ok_or_else(|| CpmError::Embed(EmbedError::Malformed("empty response".to_string())))?;

        if let Some(cache) = &self.cache {
            cache.put(text.to_string(), row.clone());
        }

        Ok(row)
    }

    /// One logical request with exponential backoff on retryable failures.
    async fn embed_batch_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);

        loop {
            match self.embed_batch_once(texts).await {
                Ok(rows) => return Ok(rows),
                Err(CpmError::Embed(EmbedError::Upstream(reason))) if attempt < self.max_retries => {
                    log::warn!(
                        "embedding retry {}/{} after upstream failure: {}",
                        attempt + 1,
                        self.max_retries,
                        reason
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single HTTP round trip. 4xx maps to BadRequest (never retried),
    /// 5xx and transport errors map to Upstream (retryable).
    async fn embed_batch_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest {
            input: texts.to_vec(),
            model: self.model.clone(),
            dimensions: Some(self.dim),
        };

        let mut builder = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(task) = &self.hints.task {
            builder = builder.header("X-Embedding-Task", task);
        }
        if let Some(normalize) = self.hints.normalize {
            builder = builder.header("X-Embedding-Normalize", normalize.to_string());
        }
        if let Some(max_len) = self.max_seq_length {
            builder = builder.header("X-Embedding-Max-Seq-Length", max_len.to_string());
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .map_err(|e| CpmError::Embed(EmbedError::Upstream(redact(&e.to_string()))))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(CpmError::Embed(EmbedError::BadRequest(format!(
                "provider returned {}",
                status
            ))));
        }
        if !status.is_success() {
            return Err(CpmError::Embed(EmbedError::Upstream(format!(
                "provider returned {}",
                status
            ))));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| CpmError::Embed(EmbedError::Malformed(redact(&e.to_string()))))?;

        if result.data.len() != texts.len() {
            return Err(CpmError::Embed(EmbedError::Malformed(format!(
                "expected {} rows, got {}",
                texts.len(),
                result.data.len()
            ))));
        }

        Ok(result.data.into_iter().map(|d| d.embedding).collect())
    }

    /// Apply the configured normalization mode and validate dimensions.
    fn postprocess(&self, mut rows: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        for row in &rows {
            if row.len() != self.dim as usize {
                return Err(CpmError::Embed(EmbedError::Malformed(format!(
                    "row dimension {} does not match configured dim {}",
                    row.len(),
                    self.dim
                ))));
            }
        }

        let needs_normalize = match self.normalize_mode {
            NormalizeMode::Server => false,
            NormalizeMode::Client => true,
            NormalizeMode::Auto => !vectors::norms_within(&rows, 1e-3),
        };
        if needs_normalize {
            vectors::l2_normalize_rows(&mut rows);
        }
        Ok(rows)
    }
}

impl Embedder for HttpEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dim(&self) -> u32 {
        self.dim
    }

    fn normalized(&self) -> bool {
        // Server mode passes rows through untouched; the other modes
        // guarantee unit norms locally.
        self.normalize_mode != NormalizeMode::Server
    }

    fn max_seq_length(&self) -> Option<u32> {
        self.max_seq_length
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_batch(texts).await
    }
}

/// Reject endpoint URLs that are not plain http(s).
fn validate_url(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(CpmError::Config(format!(
            "embedding endpoint must be http or https: {}",
            url
        )))
    }
}

/// Strip anything that looks like a credential from transport error text.
/// `Bearer <token>` collapses to a single `[redacted]`.
fn redact(message: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut skip_next = false;
    for token in message.split_whitespace() {
        if skip_next {
            skip_next = false;
            continue;
        }
        let lower = token.to_ascii_lowercase();
        if lower.starts_with("bearer") {
            out.push("[redacted]".to_string());
            skip_next = true;
        } else if lower.contains("api_key") || lower.contains("apikey") || lower.starts_with("sk-") {
            out.push("[redacted]".to_string());
        } else {
            out.push(token.to_string());
        }
    }
    out.join(" ")
}
