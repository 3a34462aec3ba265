//! Request-facing orchestration for user memories.
//!
//! [`MemoryService`] owns the write path (validate → embed → insert record +
//! entity rows) and the read paths (semantic search, retrieve, update, delete,
//! list). Embedding runs on the blocking pool before any database work begins,
//! so no lock is ever held across a model call.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::store::{ListQuery, MemoryStore, SearchFilters, SortKey};
use super::types::{
    Entity, EntityInput, Record, RecordType, DEFAULT_USER_ID, MAX_ENTITIES, MAX_TEXT_LEN,
};
use crate::config::SearchConfig;
use crate::embedding::cache::CachedEmbedder;
use crate::embedding::EMBEDDING_DIM;

/// Error taxonomy surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable error code for the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::EmbeddingFailed(_) => "EMBEDDING_FAILED",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Request-scoped caller context, resolved from the envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestContext {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(rename = "messageCount")]
    pub message_count: Option<u64>,
    #[serde(rename = "hasHistory")]
    pub has_history: Option<bool>,
}

impl RequestContext {
    fn resolve_user(&self, payload_user: Option<&str>) -> String {
        self.user_id
            .as_deref()
            .or(payload_user)
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(DEFAULT_USER_ID)
            .to_string()
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct StorePayload {
    pub text: String,
    #[serde(rename = "type")]
    pub record_type: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub entities: Vec<EntityInput>,
    pub metadata: Option<serde_json::Value>,
    pub screenshot: Option<String>,
    #[serde(rename = "extractedText")]
    pub extracted_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchPayload {
    pub query: String,
    pub limit: Option<usize>,
    #[serde(rename = "type")]
    pub record_type: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(rename = "maxAgeDays")]
    pub max_age_days: Option<i64>,
    #[serde(rename = "minSimilarity")]
    pub min_similarity: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievePayload {
    #[serde(rename = "memoryId")]
    pub memory_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdatePayload {
    #[serde(rename = "memoryId")]
    pub memory_id: String,
    pub text: Option<String>,
    #[serde(rename = "type")]
    pub record_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub screenshot: Option<String>,
    #[serde(rename = "extractedText")]
    pub extracted_text: Option<String>,
    pub entities: Option<Vec<EntityInput>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListPayload {
    #[serde(rename = "type")]
    pub record_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(rename = "sortBy")]
    pub sort_by: Option<String>,
    pub order: Option<String>,
}

// ── Responses ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StoreTimings {
    #[serde(rename = "embedding")]
    pub embedding_ms: u64,
    #[serde(rename = "dbInsert")]
    pub db_insert_ms: u64,
    #[serde(rename = "total")]
    pub total_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct StoreResult {
    #[serde(rename = "memoryId")]
    pub memory_id: String,
    pub stored: bool,
    pub entities: usize,
    #[serde(rename = "embeddingDimensions")]
    pub embedding_dimensions: usize,
    #[serde(rename = "embeddingFallback")]
    pub embedding_fallback: bool,
    pub timings: StoreTimings,
}

#[derive(Debug, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub record: Record,
    pub similarity: f64,
    pub entities: Vec<Entity>,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub results: Vec<SearchHit>,
    pub total: usize,
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct RetrieveResult {
    #[serde(flatten)]
    pub record: Record,
    pub entities: Vec<Entity>,
}

#[derive(Debug, Serialize)]
pub struct UpdateResult {
    #[serde(rename = "memoryId")]
    pub memory_id: String,
    pub updated: bool,
    #[serde(rename = "reEmbedded")]
    pub re_embedded: bool,
}

#[derive(Debug, Serialize)]
pub struct DeleteResult {
    #[serde(rename = "memoryId")]
    pub memory_id: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct ListResult {
    pub items: Vec<RetrieveResult>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct DebugEmbeddingResult {
    pub dimensions: usize,
    pub norm: f64,
    pub fallback: bool,
    pub sample: Vec<f32>,
    #[serde(rename = "cacheStats")]
    pub cache_stats: crate::embedding::cache::CacheStats,
}

// ── Service ──────────────────────────────────────────────────────────────────

/// Orchestrates store/search/update/delete/list/retrieve for user memories.
#[derive(Clone)]
pub struct MemoryService {
    store: MemoryStore,
    embedder: Arc<CachedEmbedder>,
    search_defaults: SearchConfig,
}

impl MemoryService {
    pub fn new(
        store: MemoryStore,
        embedder: Arc<CachedEmbedder>,
        search_defaults: SearchConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            search_defaults,
        }
    }

    pub fn store_handle(&self) -> &MemoryStore {
        &self.store
    }

    pub fn embedder(&self) -> Arc<CachedEmbedder> {
        self.embedder.clone()
    }

    /// Write path: validate → embed → insert record + entity rows.
    pub async fn store(
        &self,
        payload: StorePayload,
        ctx: &RequestContext,
    ) -> ServiceResult<StoreResult> {
        let total_start = Instant::now();

        let text = validate_text(&payload.text)?;
        let user_id = ctx.resolve_user(payload.user_id.as_deref());
        let memory_id = super::mint_record_id();

        let entities = normalize_entities(&memory_id, payload.entities);

        let embed_start = Instant::now();
        let embedded = self.embed_blocking(text.clone()).await?;
        let embedding_ms = embed_start.elapsed().as_millis() as u64;

        let now = super::now_rfc3339();
        let record = Record {
            id: memory_id.clone(),
            user_id: user_id.clone(),
            record_type: payload
                .record_type
                .as_deref()
                .map(RecordType::from)
                .unwrap_or(RecordType::UserMemory),
            source_text: text,
            metadata: payload.metadata,
            screenshot: payload.screenshot,
            extracted_text: payload.extracted_text,
            embedding: Some(embedded.vector.as_ref().clone()),
            created_at: now.clone(),
            updated_at: now,
        };

        let insert_start = Instant::now();
        let store = self.store.clone();
        let inserted = run_db(move || store.insert(&record, &entities)).await?;
        let db_insert_ms = insert_start.elapsed().as_millis() as u64;

        info!(id = %memory_id, user = %user_id, entities = inserted, "memory stored");

        Ok(StoreResult {
            memory_id,
            stored: true,
            entities: inserted,
            embedding_dimensions: EMBEDDING_DIM,
            embedding_fallback: embedded.fallback,
            timings: StoreTimings {
                embedding_ms,
                db_insert_ms,
                total_ms: total_start.elapsed().as_millis() as u64,
            },
        })
    }

    /// Semantic search: embed the query, ANN search with overshoot, then drop
    /// results below the similarity floor.
    pub async fn search(
        &self,
        payload: SearchPayload,
        ctx: &RequestContext,
    ) -> ServiceResult<SearchResult> {
        let query = validate_text(&payload.query)?;
        let user_id = ctx.resolve_user(None);
        let limit = payload.limit.unwrap_or(10).clamp(1, 100);
        let min_similarity = payload
            .min_similarity
            .unwrap_or(self.search_defaults.min_similarity);

        let filters = SearchFilters {
            record_type: payload.record_type,
            session_id: payload.session_id,
            max_age_days: payload
                .max_age_days
                .unwrap_or(self.search_defaults.max_age_days),
        };

        let embedded = self.embed_blocking(query.clone()).await?;

        // Overshoot so the similarity floor doesn't starve the page.
        let k = limit * 2 + 10;
        let store = self.store.clone();
        let query_vec = embedded.vector.clone();
        let scored = run_db(move || store.vector_search(&user_id, &query_vec, k, &filters)).await?;

        let mut hits = Vec::new();
        for scored_record in scored {
            if scored_record.similarity < min_similarity {
                continue;
            }
            if hits.len() >= limit {
                break;
            }
            let store = self.store.clone();
            let id = scored_record.record.id.clone();
            let entities = run_db(move || store.list_entities(&id)).await?;
            hits.push(SearchHit {
                record: scored_record.record,
                similarity: scored_record.similarity,
                entities,
            });
        }

        Ok(SearchResult {
            total: hits.len(),
            results: hits,
            query,
        })
    }

    pub async fn retrieve(
        &self,
        payload: RetrievePayload,
        ctx: &RequestContext,
    ) -> ServiceResult<RetrieveResult> {
        let user_id = ctx.resolve_user(None);
        let store = self.store.clone();
        let id = payload.memory_id.clone();
        let record = run_db(move || store.get_by_id(&id, &user_id))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("memory not found: {}", payload.memory_id)))?;

        let store = self.store.clone();
        let id = payload.memory_id.clone();
        let entities = run_db(move || store.list_entities(&id)).await?;

        Ok(RetrieveResult { record, entities })
    }

    /// Update a record in place. The embedding is regenerated only when the
    /// text actually changed; `created_at` is always preserved.
    pub async fn update(
        &self,
        payload: UpdatePayload,
        ctx: &RequestContext,
    ) -> ServiceResult<UpdateResult> {
        let user_id = ctx.resolve_user(None);
        let store = self.store.clone();
        let id = payload.memory_id.clone();
        let uid = user_id.clone();
        let existing = run_db(move || store.get_by_id(&id, &uid))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("memory not found: {}", payload.memory_id)))?;

        let mut record = existing.clone();
        let mut re_embedded = false;

        if let Some(text) = payload.text {
            let text = validate_text(&text)?;
            if text != existing.source_text {
                let embedded = self.embed_blocking(text.clone()).await?;
                record.embedding = Some(embedded.vector.as_ref().clone());
                re_embedded = true;
            }
            record.source_text = text;
        }
        if let Some(t) = payload.record_type.as_deref() {
            record.record_type = RecordType::from(t);
        }
        if payload.metadata.is_some() {
            record.metadata = payload.metadata;
        }
        if payload.screenshot.is_some() {
            record.screenshot = payload.screenshot;
        }
        if payload.extracted_text.is_some() {
            record.extracted_text = payload.extracted_text;
        }
        record.updated_at = super::now_rfc3339();

        let entities = match payload.entities {
            Some(inputs) => normalize_entities(&record.id, inputs),
            None => {
                let store = self.store.clone();
                let id = record.id.clone();
                run_db(move || store.list_entities(&id)).await?
            }
        };

        let store = self.store.clone();
        let record_for_db = record.clone();
        run_db(move || store.replace(&record_for_db, &entities)).await?;

        info!(id = %record.id, re_embedded, "memory updated");

        Ok(UpdateResult {
            memory_id: record.id,
            updated: true,
            re_embedded,
        })
    }

    /// Delete a record. Idempotent: succeeds whether or not the id exists.
    pub async fn delete(
        &self,
        payload: RetrievePayload,
        ctx: &RequestContext,
    ) -> ServiceResult<DeleteResult> {
        let user_id = ctx.resolve_user(None);
        let store = self.store.clone();
        let id = payload.memory_id.clone();
        let deleted = run_db(move || store.delete(&id, &user_id)).await?;
        Ok(DeleteResult {
            memory_id: payload.memory_id,
            deleted,
        })
    }

    pub async fn list(
        &self,
        payload: ListPayload,
        ctx: &RequestContext,
    ) -> ServiceResult<ListResult> {
        let user_id = ctx.resolve_user(None);
        let limit = payload.limit.unwrap_or(50).clamp(1, 500);
        let offset = payload.offset.unwrap_or(0);

        let sort_key = match payload.sort_by.as_deref() {
            None | Some("createdAt") => SortKey::CreatedAt,
            Some("updatedAt") => SortKey::UpdatedAt,
            Some(other) => {
                return Err(ServiceError::InvalidRequest(format!(
                    "unsupported sort key: {other}"
                )))
            }
        };
        let descending = match payload.order.as_deref() {
            None | Some("DESC") | Some("desc") => true,
            Some("ASC") | Some("asc") => false,
            Some(other) => {
                return Err(ServiceError::InvalidRequest(format!(
                    "unsupported sort order: {other}"
                )))
            }
        };

        let query = ListQuery {
            record_type: payload.record_type,
            sort_key,
            descending,
            limit,
            offset,
        };

        let store = self.store.clone();
        let uid = user_id.clone();
        let (records, total) = run_db(move || store.metadata_query(&uid, &query)).await?;

        let mut items = Vec::with_capacity(records.len());
        for record in records {
            let store = self.store.clone();
            let id = record.id.clone();
            let entities = run_db(move || store.list_entities(&id)).await?;
            items.push(RetrieveResult { record, entities });
        }

        Ok(ListResult {
            items,
            total,
            limit,
            offset,
        })
    }

    /// Newest screen-capture rows for a user.
    pub async fn recent_ocr(
        &self,
        limit: usize,
        ctx: &RequestContext,
    ) -> ServiceResult<ListResult> {
        let user_id = ctx.resolve_user(None);
        let limit = limit.clamp(1, 100);
        let store = self.store.clone();
        let records =
            run_db(move || store.recent_by_type(&user_id, "screen_capture", limit)).await?;

        let total = records.len() as u64;
        let mut items = Vec::with_capacity(records.len());
        for record in records {
            let store = self.store.clone();
            let id = record.id.clone();
            let entities = run_db(move || store.list_entities(&id)).await?;
            items.push(RetrieveResult { record, entities });
        }
        Ok(ListResult {
            items,
            total,
            limit,
            offset: 0,
        })
    }

    /// Embed a text and report the vector's shape, for diagnostics.
    pub async fn debug_embedding(&self, text: String) -> ServiceResult<DebugEmbeddingResult> {
        let text = validate_text(&text)?;
        let embedded = self.embed_blocking(text).await?;
        let norm: f64 = embedded
            .vector
            .iter()
            .map(|x| (*x as f64) * (*x as f64))
            .sum::<f64>()
            .sqrt();
        Ok(DebugEmbeddingResult {
            dimensions: embedded.vector.len(),
            norm,
            fallback: embedded.fallback,
            sample: embedded.vector.iter().take(8).copied().collect(),
            cache_stats: self.embedder.stats(),
        })
    }

    async fn embed_blocking(
        &self,
        text: String,
    ) -> ServiceResult<crate::embedding::cache::Embedded> {
        let embedder = self.embedder.clone();
        tokio::task::spawn_blocking(move || embedder.embed(&text))
            .await
            .map_err(|e| ServiceError::Internal(format!("embedding task failed: {e}")))?
            .map_err(|e| ServiceError::EmbeddingFailed(e.to_string()))
    }
}

/// Run a blocking store operation on the blocking pool, mapping failures into
/// the service error taxonomy.
async fn run_db<T, F>(f: F) -> ServiceResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServiceError::Internal(format!("db task failed: {e}")))?
        .map_err(|e| ServiceError::Database(e.to_string()))
}

/// Trim and bound-check caller text.
fn validate_text(text: &str) -> ServiceResult<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::InvalidRequest("text must not be empty".into()));
    }
    if trimmed.chars().count() > MAX_TEXT_LEN {
        return Err(ServiceError::InvalidRequest(format!(
            "text exceeds {MAX_TEXT_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Drop incomplete entity inputs and cap the set at [`MAX_ENTITIES`].
fn normalize_entities(memory_id: &str, inputs: Vec<EntityInput>) -> Vec<Entity> {
    inputs
        .into_iter()
        .filter_map(|input| {
            let kind = input.kind?.trim().to_string();
            let value = input.value?.trim().to_string();
            if kind.is_empty() || value.is_empty() {
                return None;
            }
            Some(Entity::new(memory_id, &kind, &value))
        })
        .take(MAX_ENTITIES)
        .collect()
}
