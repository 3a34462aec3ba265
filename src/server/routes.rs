//! Action dispatch.
//!
//! Every action is a POST carrying the request envelope; the handler applies
//! the size gate, envelope validation, a 30 s soft deadline, and then
//! dispatches on `action`. Responses always use the uniform envelope.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::envelope::{status_for_code, RequestEnvelope, ResponseEnvelope, ValidEnvelope};
use crate::auxiliary::{ContextRuleStore, SkillPromptStore, SkillRegistry};
use crate::classify::{classify_query, ConversationContext};
use crate::config::ServiceConfig;
use crate::memory::retention::RetentionCounters;
use crate::memory::service::{
    ListPayload, MemoryService, RequestContext, RetrievePayload, SearchPayload, ServiceError,
    ServiceResult, StorePayload, UpdatePayload,
};
use crate::monitor::MonitorCounters;

/// Request bodies above this size are rejected.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Soft deadline for one request.
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Everything the handlers need, owned by the application for its lifetime.
pub struct AppState {
    pub config: ServiceConfig,
    pub service: MemoryService,
    pub skill_prompts: SkillPromptStore,
    pub context_rules: ContextRuleStore,
    pub skills: SkillRegistry,
    pub retention_counters: Option<Arc<RetentionCounters>>,
    pub monitor_counters: Option<Arc<MonitorCounters>>,
    pub started_at: Instant,
}

/// The actions this service exposes.
pub const ACTIONS: &[&str] = &[
    "memory.store",
    "memory.search",
    "memory.retrieve",
    "memory.update",
    "memory.delete",
    "memory.list",
    "memory.classify-conversational-query",
    "memory.debug-embedding",
    "memory.health-check",
    "memory.getRecentOcr",
    "skill-prompts.save",
    "skill-prompts.search",
    "context-rules.save",
    "context-rules.get",
    "skills.register",
    "skills.list",
    "skills.unregister",
];

/// POST handler shared by every action path.
pub async fn handle_action(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let start = Instant::now();

    if body.len() > MAX_BODY_BYTES {
        return error_response(
            "",
            "",
            "PAYLOAD_TOO_LARGE",
            &format!("request body exceeds {MAX_BODY_BYTES} bytes"),
            start,
        );
    }

    let envelope: RequestEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            return error_response("", "", "INVALID_REQUEST", &format!("malformed body: {e}"), start)
        }
    };

    let valid = match envelope.validate() {
        Ok(valid) => valid,
        Err(e) => return error_response("", "", e.code(), &e.to_string(), start),
    };
    let action = valid.action.clone();
    let request_id = valid.request_id.clone();

    let result = tokio::time::timeout(REQUEST_DEADLINE, dispatch(&state, valid)).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(data)) => {
            let envelope = ResponseEnvelope::ok(&action, &request_id, data, elapsed_ms);
            (StatusCode::OK, Json(envelope)).into_response()
        }
        Ok(Err(e)) => {
            let envelope =
                ResponseEnvelope::error(&action, &request_id, e.code(), &e.to_string(), elapsed_ms);
            (status_for_code(e.code()), Json(envelope)).into_response()
        }
        Err(_) => {
            let envelope = ResponseEnvelope::error(
                &action,
                &request_id,
                "INTERNAL_ERROR",
                "request deadline exceeded",
                elapsed_ms,
            );
            (StatusCode::INTERNAL_SERVER_ERROR, Json(envelope)).into_response()
        }
    }
}

fn error_response(
    action: &str,
    request_id: &str,
    code: &str,
    message: &str,
    start: Instant,
) -> Response {
    let envelope = ResponseEnvelope::error(
        action,
        request_id,
        code,
        message,
        start.elapsed().as_millis() as u64,
    );
    (status_for_code(code), Json(envelope)).into_response()
}

async fn dispatch(state: &AppState, envelope: ValidEnvelope) -> ServiceResult<Value> {
    let ValidEnvelope {
        action,
        context,
        payload,
        ..
    } = envelope;

    match action.as_str() {
        "memory.store" => {
            let payload: StorePayload = parse(&payload)?;
            to_value(state.service.store(payload, &context).await?)
        }
        "memory.search" => {
            let payload: SearchPayload = parse(&payload)?;
            to_value(state.service.search(payload, &context).await?)
        }
        "memory.retrieve" => {
            let payload: RetrievePayload = parse(&payload)?;
            to_value(state.service.retrieve(payload, &context).await?)
        }
        "memory.update" => {
            let payload: UpdatePayload = parse(&payload)?;
            to_value(state.service.update(payload, &context).await?)
        }
        "memory.delete" => {
            let payload: RetrievePayload = parse(&payload)?;
            to_value(state.service.delete(payload, &context).await?)
        }
        "memory.list" => {
            let payload: ListPayload = parse(&payload)?;
            to_value(state.service.list(payload, &context).await?)
        }
        "memory.classify-conversational-query" => {
            let payload: ClassifyPayload = parse(&payload)?;
            let conversation = conversation_context(&context);
            to_value(classify_query(&payload.query, &conversation))
        }
        "memory.debug-embedding" => {
            let payload: DebugEmbeddingPayload = parse(&payload)?;
            to_value(state.service.debug_embedding(payload.text).await?)
        }
        "memory.health-check" => health_check(state).await,
        "memory.getRecentOcr" => {
            let payload: RecentOcrPayload = parse(&payload)?;
            to_value(
                state
                    .service
                    .recent_ocr(payload.limit.unwrap_or(10), &context)
                    .await?,
            )
        }
        "skill-prompts.save" => {
            let payload: SkillPromptSavePayload = parse(&payload)?;
            let embedded = embed_text(state, payload.prompt_text.clone()).await?;
            let store = state.skill_prompts.clone();
            let saved = run_aux(move || {
                store.save(&payload.tags, &payload.prompt_text, &embedded)
            })
            .await?;
            to_value(saved)
        }
        "skill-prompts.search" => {
            let payload: SkillPromptSearchPayload = parse(&payload)?;
            let embedded = embed_text(state, payload.query).await?;
            let store = state.skill_prompts.clone();
            let limit = payload.limit.unwrap_or(5).clamp(1, 50);
            let hits = run_aux(move || store.search(&embedded, limit)).await?;
            to_value(json!({ "results": hits }))
        }
        "context-rules.save" => {
            let payload: ContextRuleSavePayload = parse(&payload)?;
            let store = state.context_rules.clone();
            let rule = run_aux(move || {
                store.save(
                    &payload.context_type,
                    &payload.context_key,
                    &payload.rule_text,
                    payload.category.as_deref(),
                    payload.source.as_deref(),
                )
            })
            .await?;
            to_value(rule)
        }
        "context-rules.get" => {
            let payload: ContextRuleGetPayload = parse(&payload)?;
            let store = state.context_rules.clone();
            let rules =
                run_aux(move || store.get(&payload.context_type, &payload.context_key)).await?;
            to_value(json!({ "rules": rules }))
        }
        "skills.register" => {
            let registration = parse(&payload)?;
            let registry = state.skills.clone();
            let skill = run_aux(move || registry.register(registration)).await?;
            to_value(skill)
        }
        "skills.list" => {
            let registry = state.skills.clone();
            let skills = run_aux(move || registry.list()).await?;
            to_value(json!({ "skills": skills }))
        }
        "skills.unregister" => {
            let payload: UnregisterPayload = parse(&payload)?;
            let registry = state.skills.clone();
            let name = payload.name.clone();
            let removed = run_aux(move || registry.unregister(&name)).await?;
            to_value(json!({ "name": payload.name, "removed": removed }))
        }
        other => Err(ServiceError::InvalidRequest(format!(
            "unknown action: {other}"
        ))),
    }
}

async fn health_check(state: &AppState) -> ServiceResult<Value> {
    let store = state.service.store_handle().clone();
    let stats = tokio::task::spawn_blocking(move || store.stats())
        .await
        .map_err(|e| ServiceError::Internal(format!("health task failed: {e}")))?
        .map_err(|e| ServiceError::Database(e.to_string()))?;

    let mut health = json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "store": stats,
        "embeddingCache": state.service.embedder().stats(),
    });
    if let Some(counters) = &state.retention_counters {
        health["retention"] = serde_json::to_value(counters.snapshot())
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
    }
    if let Some(counters) = &state.monitor_counters {
        health["monitor"] = serde_json::to_value(counters.snapshot())
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
    }
    Ok(health)
}

/// Unauthenticated liveness probe.
pub async fn service_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": super::envelope::SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Unauthenticated capability listing.
pub async fn service_capabilities() -> Json<Value> {
    Json(json!({
        "service": super::envelope::SERVICE_NAME,
        "version": super::envelope::PROTOCOL_VERSION,
        "actions": ACTIONS,
    }))
}

// ── Action payloads without a service-level home ─────────────────────────────

#[derive(Debug, Deserialize)]
struct ClassifyPayload {
    query: String,
}

#[derive(Debug, Deserialize)]
struct DebugEmbeddingPayload {
    text: String,
}

#[derive(Debug, Deserialize)]
struct RecentOcrPayload {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SkillPromptSavePayload {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(rename = "promptText")]
    prompt_text: String,
}

#[derive(Debug, Deserialize)]
struct SkillPromptSearchPayload {
    query: String,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ContextRuleSavePayload {
    #[serde(rename = "contextType")]
    context_type: String,
    #[serde(rename = "contextKey")]
    context_key: String,
    #[serde(rename = "ruleText")]
    rule_text: String,
    category: Option<String>,
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContextRuleGetPayload {
    #[serde(rename = "contextType")]
    context_type: String,
    #[serde(rename = "contextKey")]
    context_key: String,
}

#[derive(Debug, Deserialize)]
struct UnregisterPayload {
    name: String,
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn parse<T: DeserializeOwned>(payload: &Value) -> ServiceResult<T> {
    let source = if payload.is_null() {
        json!({})
    } else {
        payload.clone()
    };
    serde_json::from_value(source)
        .map_err(|e| ServiceError::InvalidRequest(format!("invalid payload: {e}")))
}

fn to_value<T: serde::Serialize>(value: T) -> ServiceResult<Value> {
    serde_json::to_value(value).map_err(|e| ServiceError::Internal(e.to_string()))
}

fn conversation_context(context: &RequestContext) -> ConversationContext {
    ConversationContext {
        session_id: context.session_id.clone(),
        message_count: context.message_count,
        has_history: context.has_history,
    }
}

async fn run_aux<T, F>(f: F) -> ServiceResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServiceError::Internal(format!("task failed: {e}")))?
}

async fn embed_text(state: &AppState, text: String) -> ServiceResult<Vec<f32>> {
    let embedder = state.service.embedder();
    let embedded = tokio::task::spawn_blocking(move || embedder.embed(&text))
        .await
        .map_err(|e| ServiceError::Internal(format!("embedding task failed: {e}")))?
        .map_err(|e| ServiceError::EmbeddingFailed(e.to_string()))?;
    Ok(embedded.vector.as_ref().clone())
}
