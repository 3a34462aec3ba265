//! HTTP server and application lifecycle.
//!
//! [`Application`] owns every process-wide handle — store, embedder, monitor,
//! retention — constructs them in dependency order at startup, and disposes of
//! them in reverse order during graceful shutdown (monitor → retention →
//! checkpoint → close).

pub mod auth;
pub mod envelope;
pub mod routes;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auxiliary::{ContextRuleStore, SkillPromptStore, SkillRegistry};
use crate::config::ServiceConfig;
use crate::embedding::cache::CachedEmbedder;
use crate::embedding::local::LocalEmbeddingProvider;
use crate::memory::retention::RetentionController;
use crate::memory::service::MemoryService;
use crate::memory::store::MemoryStore;
use crate::monitor::{ScreenMonitor, SystemProbe};
use crate::ocr::{OcrPipeline, TesseractEngine};
use auth::{bearer_auth, BearerKeys};
use routes::AppState;

/// How long shutdown waits for an in-flight monitor tick.
const MONITOR_STOP_DEADLINE: Duration = Duration::from_secs(10);

/// The running application: shared state plus background task handles.
pub struct Application {
    state: Arc<AppState>,
    shutdown_tx: watch::Sender<bool>,
    monitor_task: Option<JoinHandle<()>>,
    retention_task: Option<JoinHandle<()>>,
}

impl Application {
    /// Construct every component and start the background loops.
    ///
    /// Fatal here (bubbles out, process exits non-zero): the database cannot
    /// be opened after all retries, or the embedding model cannot load.
    pub async fn start(config: ServiceConfig) -> Result<Self> {
        let db_path = config.resolved_db_path();
        let open_path = db_path.clone();
        let conn = tokio::task::spawn_blocking(move || crate::db::open_database(&open_path))
            .await
            .context("database open task failed")??;

        if let Ok(Some(stored_model)) = crate::db::migrations::get_embedding_model(&conn) {
            if stored_model != config.embedding.model {
                warn!(
                    stored = %stored_model,
                    configured = %config.embedding.model,
                    "embedding model changed since the database was written"
                );
            }
        }

        let conn = Arc::new(Mutex::new(conn));
        let store = MemoryStore::new(conn.clone(), Some(db_path));

        // Startup rebuild guarantees a clean index state.
        let rebuild_store = store.clone();
        tokio::task::spawn_blocking(move || rebuild_store.rebuild_index())
            .await
            .context("index rebuild task failed")??;

        let provider =
            LocalEmbeddingProvider::new(&config.embedding).context("embedding model failed to load")?;
        let embedder = Arc::new(CachedEmbedder::new(Arc::new(provider), &config.embedding));
        info!("embedding provider ready");

        let service = MemoryService::new(store.clone(), embedder.clone(), config.search.clone());
        let skill_prompts = SkillPromptStore::new(conn.clone());
        let context_rules = ContextRuleStore::new(conn.clone());
        let skills = SkillRegistry::new(conn, crate::config::skill_sandbox_dir());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (monitor_task, monitor_counters) = if config.monitor.enabled {
            match TesseractEngine::new() {
                Ok(engine) => {
                    let monitor = Arc::new(ScreenMonitor::new(
                        Arc::new(SystemProbe),
                        Arc::new(OcrPipeline::new(Box::new(engine))),
                        embedder.clone(),
                        store.clone(),
                        config.monitor.clone(),
                    ));
                    let counters = monitor.counters();
                    let task = tokio::spawn(monitor.run(shutdown_rx.clone()));
                    (Some(task), Some(counters))
                }
                Err(e) => {
                    warn!(error = %e, "OCR engine unavailable, screen monitor disabled");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let (retention_task, retention_counters) = if config.retention.enabled {
            let controller = RetentionController::new(store, config.retention.clone());
            let counters = controller.counters();
            let task = tokio::spawn(controller.run(shutdown_rx));
            (Some(task), Some(counters))
        } else {
            (None, None)
        };

        let state = Arc::new(AppState {
            config,
            service,
            skill_prompts,
            context_rules,
            skills,
            retention_counters,
            monitor_counters,
            started_at: Instant::now(),
        });

        Ok(Self {
            state,
            shutdown_tx,
            monitor_task,
            retention_task,
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Bind and serve until ctrl-c, then shut down gracefully.
    pub async fn serve(self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.state.config.server.host, self.state.config.server.port
        );
        let router = build_router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        info!(addr = %bind_addr, "memory service listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                tokio::signal::ctrl_c()
                    .await
                    .expect("failed to listen for ctrl-c");
                info!("shutdown signal received");
            })
            .await?;

        self.shutdown().await;
        Ok(())
    }

    /// Stop background loops and flush storage, in reverse start order.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        if let Some(mut task) = self.monitor_task {
            if tokio::time::timeout(MONITOR_STOP_DEADLINE, &mut task)
                .await
                .is_err()
            {
                warn!("screen monitor did not stop in time, aborting");
                task.abort();
            }
        }
        if let Some(mut task) = self.retention_task {
            // the retention loop runs a final check before exiting
            if tokio::time::timeout(Duration::from_secs(60), &mut task)
                .await
                .is_err()
            {
                warn!("retention controller did not stop in time, aborting");
                task.abort();
            }
        }

        let store = self.state.service.store_handle().clone();
        let checkpoint = tokio::task::spawn_blocking(move || store.checkpoint()).await;
        match checkpoint {
            Ok(Ok(())) => info!("storage checkpointed"),
            Ok(Err(e)) => warn!(error = %e, "checkpoint failed"),
            Err(e) => warn!(error = %e, "checkpoint task failed"),
        }
        info!("shutdown complete");
    }
}

/// Build the router: one POST route per action, unauthenticated health and
/// capabilities, bearer middleware, tracing, CORS, body limit.
pub fn build_router(state: Arc<AppState>) -> Router {
    let keys = BearerKeys::new(&state.config.server.api_keys);
    if !keys.is_enabled() {
        warn!("no API keys configured, authentication disabled");
    }

    let cors = if state.config.server.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .server
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(tower_http::cors::AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/service.health", get(routes::service_health))
        .route("/service.capabilities", get(routes::service_capabilities))
        .route("/{action}", post(routes::handle_action))
        .layer(middleware::from_fn(
            move |request: axum::extract::Request, next: middleware::Next| {
                let keys = keys.clone();
                async move { bearer_auth(keys, request, next).await }
            },
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // the handler applies the protocol limit itself so the reply keeps
        // the envelope shape; this is just the transport backstop
        .layer(DefaultBodyLimit::max(routes::MAX_BODY_BYTES * 2))
        .with_state(state)
}
