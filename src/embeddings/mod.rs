pub mod cache;
pub mod client;

pub use cache::EmbeddingCache;
pub use client::{Embedder, EmbedHints, HttpEmbedder, NormalizeMode};
