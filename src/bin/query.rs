//! `cpm-query`: query a packet from the command line.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Instant;

use cpm::cas::CpmRoot;
use cpm::embeddings::{EmbeddingCache, HttpEmbedder};
use cpm::oci::{HttpRegistryClient, PacketRef, Resolver};
use cpm::retrieval::RetrievalEngine;
use cpm::Config;

#[derive(Parser)]
#[command(name = "cpm-query", about = "Semantic search over a packet")]
struct Args {
    /// Packet reference (oci://... or name@version against the default registry)
    reference: String,
    /// Query text
    query: String,
    /// Number of results
    #[arg(short, long, default_value_t = 5)]
    k: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load()?;

    let packet_ref = PacketRef::resolve_input(&args.reference, config.registry.default.as_deref())?;
    let client = HttpRegistryClient::new(config.registry.clone())?;
    let resolver = Resolver::new(
        client,
        CpmRoot::new(config.cpm_root()),
        config.registry.clone(),
        config.trust.clone(),
    );
    let cache = Some(Arc::new(EmbeddingCache::new(config.embeddings.cache_capacity.max(1))));
    let embedder = HttpEmbedder::from_config(&config.embeddings, cache)?;
    let engine = RetrievalEngine::new(resolver, embedder);

    let start = Instant::now();
    let result = engine.query(&packet_ref, &args.query, args.k.clamp(1, 20)).await?;
    let elapsed = start.elapsed();

    println!("packet: {}", result.pinned_uri);
    println!("cache_hit: {}", result.cache_hit);
    if result.results.is_empty() {
        println!("no results");
    }
    for (rank, hit) in result.results.iter().enumerate() {
        println!(
            "#{} {:.3} {}:{}-{}",
            rank + 1,
            hit.score,
            hit.path,
            hit.start,
            hit.end
        );
        println!("   {}", hit.snippet.replace('\n', " "));
    }
    println!("latency: {:?}", elapsed);

    Ok(())
}
