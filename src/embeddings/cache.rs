use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Thread-safe LRU cache for query embeddings.
///
/// Retrieval traffic repeats queries often (same question against several
/// packets); caching the query vector avoids one provider round trip per
/// repeat. Bounded by LRU eviction.
pub struct EmbeddingCache {
    cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingCache {
    /// Create a cache holding at most `capacity` query vectors.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self {
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, query: &str) -> Option<Vec<f32>> {
        self.cache.lock().unwrap().get(query).cloned()
    }

    pub fn put(&self, query: String, embedding: Vec<f32>) {
        self.cache.lock().unwrap().put(query, embedding);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }
}
