//! Per-user long-term memory service.
//!
//! ThinkDrop Memory ingests short text records, embeds them into 384-dim
//! vectors with a local sentence-embedding model, persists them to SQLite
//! augmented with a cosine vector index, and exposes a narrow JSON
//! request/response protocol for semantic search, retrieval, update,
//! deletion, listing, and conversational-query classification. A desktop
//! observer captures the screen when context changes, extracts text via OCR,
//! and writes the result into the same store; a retention loop bounds the
//! stored history to a configurable time window.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with [sqlite-vec](https://github.com/asg017/sqlite-vec)
//!   for approximate nearest-neighbor search; the embedding column on the row
//!   stays authoritative
//! - **Embeddings**: Local ONNX Runtime with all-MiniLM-L6-v2 (384
//!   dimensions), behind a deduplicating LRU+TTL cache with a deterministic
//!   fallback for model failures
//! - **Transport**: HTTP/1.1 with a versioned JSON envelope and bearer auth
//! - **Observer**: idle gate → active window → pixel diff → Tesseract OCR →
//!   text-hash dedup → embed → store
//!
//! # Modules
//!
//! - [`config`] — Configuration from TOML files and environment variables
//! - [`db`] — SQLite initialization, schema, migrations, and health checks
//! - [`embedding`] — Text-to-vector pipeline: ONNX provider, fallback, cache
//! - [`memory`] — Store, vector search, service orchestration, retention
//! - [`auxiliary`] — Skill prompts, context rules, installed skills
//! - [`monitor`] — Screen observation loop and pixel diffing
//! - [`ocr`] — Tesseract pipeline and text post-processing
//! - [`classify`] — Conversational-query classification
//! - [`server`] — HTTP envelope protocol and application lifecycle

pub mod auxiliary;
pub mod classify;
pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod memory;
pub mod monitor;
pub mod ocr;
pub mod server;
