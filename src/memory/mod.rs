//! Core memory engine — storage, search, orchestration, and retention.
//!
//! This module contains the column store with its vector index ([`store`]),
//! the request-facing orchestration layer ([`service`]), and the age-based
//! retention controller ([`retention`]). Type definitions live in [`types`].

pub mod retention;
pub mod service;
pub mod store;
pub mod types;

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Convert raw bytes back to an f32 embedding.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

/// Cosine similarity of two L2-normalized vectors (their dot product).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x * y) as f64).sum()
}

/// Convert a vec0 L2 distance to cosine similarity.
///
/// For L2-normalized vectors: `d² = 2·(1 − cos)`, so `cos = 1 − d²/2`.
pub fn l2_distance_to_similarity(distance: f64) -> f64 {
    1.0 - distance * distance / 2.0
}

/// Mint a record id of the shape `mem_<ms-epoch>_<8-hex>`.
pub fn mint_record_id() -> String {
    let ms = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("mem_{ms}_{}", &suffix[..8])
}

/// Mint an opaque id for entity and auxiliary rows.
pub fn mint_row_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current UTC timestamp as RFC 3339.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
