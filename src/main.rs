use anyhow::Result;
use std::sync::Arc;

use cpm::cas::CpmRoot;
use cpm::embeddings::{EmbeddingCache, HttpEmbedder};
use cpm::mcp::McpServer;
use cpm::oci::{HttpRegistryClient, Resolver};
use cpm::retrieval::RetrievalEngine;
use cpm::Config;

/// Build the configured embedder with an optional LRU query cache.
fn build_embedder(config: &Config) -> Result<HttpEmbedder> {
    let cache = if config.embeddings.cache_capacity > 0 {
        Some(Arc::new(EmbeddingCache::new(config.embeddings.cache_capacity)))
    } else {
        None
    };
    Ok(HttpEmbedder::from_config(&config.embeddings, cache)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // MCP servers log to stderr; stdout carries the protocol.
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "info")).init();

    let config = Config::load()?;
    log::info!("CPM_ROOT: {}", config.cpm_root().display());
    log::info!("embedding model: {}", config.embeddings.model);

    let root = CpmRoot::new(config.cpm_root());
    let client = HttpRegistryClient::new(config.registry.clone())?;
    let resolver = Resolver::new(client, root, config.registry.clone(), config.trust.clone());
    let embedder = build_embedder(&config)?;
    let engine = RetrievalEngine::new(resolver, embedder);

    let mut server = McpServer::new(engine, config);
    server.run().await?;

    Ok(())
}
