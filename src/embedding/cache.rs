//! Deduplicating embedding cache.
//!
//! Wraps any [`EmbeddingProvider`] in a bounded LRU+TTL cache keyed by the
//! normalized text. On a model runtime failure the wrapper degrades to the
//! deterministic fallback embedding instead of failing the request; the
//! degradation is logged at WARN and surfaced on the result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use moka::sync::Cache;
use serde::Serialize;
use tracing::warn;

use super::{fallback::fallback_embedding, validate_embedding, EmbeddingProvider};
use crate::config::EmbeddingConfig;

/// Cache keys are the lowercased, trimmed text, truncated to this many chars.
const KEY_MAX_CHARS: usize = 200;

/// An embedding plus the backend that produced it.
#[derive(Debug, Clone)]
pub struct Embedded {
    pub vector: Arc<Vec<f32>>,
    /// `true` when the deterministic fallback produced this vector.
    pub fallback: bool,
}

/// Cache hit/miss counters, exposed through `CacheStats`.
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    total_requests: AtomicU64,
}

/// Snapshot of the cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub total_requests: u64,
    pub entries: u64,
    pub capacity: u64,
}

/// Embedding provider wrapper with deduplicating cache and fallback degrade.
pub struct CachedEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Cache<String, Embedded>,
    counters: Counters,
    capacity: u64,
}

impl CachedEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_size)
            .time_to_live(Duration::from_millis(config.cache_ttl_ms))
            .build();
        Self {
            provider,
            cache,
            counters: Counters::default(),
            capacity: config.cache_size,
        }
    }

    /// Embed one text, hitting the cache first. Empty input is an error; a
    /// model runtime failure degrades to the deterministic fallback.
    pub fn embed(&self, text: &str) -> Result<Embedded> {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        let trimmed = text.trim();
        anyhow::ensure!(!trimmed.is_empty(), "cannot embed empty text");

        let key = cache_key(trimmed);
        if let Some(hit) = self.cache.get(&key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let embedded = match self.provider.embed(trimmed) {
            Ok(vector) => {
                validate_embedding(&vector)?;
                Embedded {
                    vector: Arc::new(vector),
                    fallback: false,
                }
            }
            Err(e) => {
                warn!(error = %e, "embedding model failed, using deterministic fallback");
                let vector = fallback_embedding(trimmed);
                validate_embedding(&vector)?;
                Embedded {
                    vector: Arc::new(vector),
                    fallback: true,
                }
            }
        };

        self.cache.insert(key, embedded.clone());
        Ok(embedded)
    }

    /// Embed several texts, preserving input order.
    pub fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedded>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    pub fn stats(&self) -> CacheStats {
        // run_pending_tasks makes entry_count reflect recent inserts
        self.cache.run_pending_tasks();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            entries: self.cache.entry_count(),
            capacity: self.capacity,
        }
    }
}

/// Normalize a text into its cache key: `lower(trim(text))[:200]`.
fn cache_key(trimmed: &str) -> String {
    trimmed.to_lowercase().chars().take(KEY_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EMBEDDING_DIM;

    /// Provider that counts invocations and optionally fails.
    struct CountingProvider {
        calls: AtomicU64,
        fail: bool,
    }

    impl EmbeddingProvider for CountingProvider {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                anyhow::bail!("model exploded");
            }
            let mut v = vec![0.0f32; EMBEDDING_DIM];
            v[text.len() % EMBEDDING_DIM] = 1.0;
            Ok(v)
        }
    }

    fn embedder(fail: bool) -> (Arc<CountingProvider>, CachedEmbedder) {
        let provider = Arc::new(CountingProvider {
            calls: AtomicU64::new(0),
            fail,
        });
        let cached = CachedEmbedder::new(provider.clone(), &EmbeddingConfig::default());
        (provider, cached)
    }

    #[test]
    fn repeated_text_hits_cache() {
        let (provider, cached) = embedder(false);

        let first = cached.embed("hello world").unwrap();
        let second = cached.embed("hello world").unwrap();
        assert_eq!(first.vector, second.vector);
        assert_eq!(provider.calls.load(Ordering::Relaxed), 1);

        let stats = cached.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_requests, 2);
    }

    #[test]
    fn key_normalization_merges_variants() {
        let (provider, cached) = embedder(false);
        cached.embed("  Hello World  ").unwrap();
        cached.embed("hello world").unwrap();
        assert_eq!(provider.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn empty_text_is_rejected() {
        let (_, cached) = embedder(false);
        assert!(cached.embed("").is_err());
        assert!(cached.embed("   ").is_err());
    }

    #[test]
    fn model_failure_degrades_to_fallback() {
        let (_, cached) = embedder(true);
        let result = cached.embed("some text").unwrap();
        assert!(result.fallback);
        assert_eq!(result.vector.len(), EMBEDDING_DIM);
        let norm: f32 = result.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);

        // The fallback vector is cached like any other
        let again = cached.embed("some text").unwrap();
        assert_eq!(result.vector, again.vector);
    }

    #[test]
    fn batch_preserves_order() {
        let (_, cached) = embedder(false);
        let results = cached.embed_batch(&["aa", "bbbb", "cc"]).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].vector, cached.embed("aa").unwrap().vector);
        assert_eq!(results[2].vector, cached.embed("cc").unwrap().vector);
    }
}
