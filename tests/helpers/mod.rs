#![allow(dead_code)]

use std::sync::Arc;
use std::time::Instant;

use thinkdrop_memory::auxiliary::{ContextRuleStore, SkillPromptStore, SkillRegistry};
use thinkdrop_memory::config::ServiceConfig;
use thinkdrop_memory::embedding::cache::CachedEmbedder;
use thinkdrop_memory::embedding::fallback::fallback_embedding;
use thinkdrop_memory::embedding::EmbeddingProvider;
use thinkdrop_memory::memory::service::MemoryService;
use thinkdrop_memory::memory::store::MemoryStore;
use thinkdrop_memory::server::routes::AppState;

/// Deterministic provider: the pure hash embedding, so semantically
/// overlapping texts score above unrelated ones without model files.
pub struct DeterministicProvider;

impl EmbeddingProvider for DeterministicProvider {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(fallback_embedding(text))
    }
}

/// Generate a deterministic 384-dim embedding with a spike at position `seed`.
pub fn test_embedding(seed: u8) -> Vec<f32> {
    let mut v = vec![0.0f32; 384];
    v[seed as usize % 384] = 1.0;
    v
}

/// Fresh in-memory store.
pub fn test_store() -> MemoryStore {
    MemoryStore::open_in_memory().unwrap()
}

/// Cached embedder over the deterministic provider.
pub fn test_embedder() -> Arc<CachedEmbedder> {
    let config = ServiceConfig::default();
    Arc::new(CachedEmbedder::new(
        Arc::new(DeterministicProvider),
        &config.embedding,
    ))
}

/// Memory service over a fresh in-memory store.
pub fn test_service() -> MemoryService {
    let config = ServiceConfig::default();
    MemoryService::new(test_store(), test_embedder(), config.search.clone())
}

/// Full application state for router tests. `api_keys` empty disables auth.
pub fn test_state(api_keys: &[&str]) -> Arc<AppState> {
    let mut config = ServiceConfig::default();
    config.server.api_keys = api_keys.iter().map(|k| k.to_string()).collect();

    let store = test_store();
    let conn = store.connection();
    let embedder = test_embedder();
    let service = MemoryService::new(store, embedder, config.search.clone());

    Arc::new(AppState {
        skill_prompts: SkillPromptStore::new(conn.clone()),
        context_rules: ContextRuleStore::new(conn.clone()),
        skills: SkillRegistry::new(conn, std::env::temp_dir().join("thinkdrop-test-skills")),
        retention_counters: None,
        monitor_counters: None,
        started_at: Instant::now(),
        config,
        service,
    })
}
