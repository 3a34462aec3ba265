//! The memory column store and its cosine vector index.
//!
//! [`MemoryStore`] owns the SQLite handle and exposes the storage operations:
//! insert, delete, vector search, metadata queries, entity listing, stats, and
//! index housekeeping. The embedding BLOB on the `memory` row is authoritative;
//! the `memory_vec` vec0 table only accelerates candidate selection, and every
//! similarity returned to callers is recomputed from the stored vector so KNN
//! and full-scan paths produce identical results.

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

use super::types::{Entity, Record, RecordType};
use super::{bytes_to_embedding, cosine_similarity, embedding_to_bytes};

/// Filters applied to a vector search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Restrict to one record type.
    pub record_type: Option<String>,
    /// Substring match against the serialized metadata JSON.
    pub session_id: Option<String>,
    /// Only records newer than `now − max_age_days`. `0` disables the filter.
    pub max_age_days: i64,
}

/// A record with the similarity score that matched it.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    pub record: Record,
    pub similarity: f64,
}

/// Sort key accepted by [`MemoryStore::metadata_query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    CreatedAt,
    UpdatedAt,
}

impl SortKey {
    fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
        }
    }
}

/// Parameters for a structured metadata listing.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub record_type: Option<String>,
    pub sort_key: SortKey,
    pub descending: bool,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            record_type: None,
            sort_key: SortKey::CreatedAt,
            descending: true,
            limit: 50,
            offset: 0,
        }
    }
}

/// Store-wide statistics.
#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub total_records: u64,
    pub embedded_records: u64,
    pub by_type: HashMap<String, u64>,
    pub entity_count: u64,
    pub user_count: u64,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_record: Option<String>,
}

/// The persistent store. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct MemoryStore {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new(conn: Arc<Mutex<Connection>>, db_path: Option<PathBuf>) -> Self {
        Self { conn, db_path }
    }

    /// Open an in-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = crate::db::open_memory_database()?;
        Ok(Self::new(Arc::new(Mutex::new(conn)), None))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))
    }

    // ── Write path ───────────────────────────────────────────────────────────

    /// Insert a record with its entity rows.
    ///
    /// The record insert and the vec-index add are atomic. An individual
    /// entity insert failure is logged and skipped; the record is still
    /// considered stored. Returns the number of entity rows written.
    pub fn insert(&self, record: &Record, entities: &[Entity]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let metadata_json = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        tx.execute(
            "INSERT INTO memory \
             (id, user_id, type, source_text, metadata, screenshot, extracted_text, \
              embedding, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.user_id,
                record.record_type.as_str(),
                record.source_text,
                metadata_json,
                record.screenshot,
                record.extracted_text,
                record.embedding.as_deref().map(embedding_to_bytes),
                record.created_at,
                record.updated_at,
            ],
        )
        .context("failed to insert memory row")?;

        if let Some(embedding) = &record.embedding {
            tx.execute(
                "INSERT INTO memory_vec (id, embedding) VALUES (?1, ?2)",
                params![record.id, embedding_to_bytes(embedding)],
            )
            .context("failed to add embedding to vector index")?;
        }

        let mut inserted = 0usize;
        for entity in entities {
            let result = tx.execute(
                "INSERT INTO memory_entities \
                 (id, memory_id, entity, type, entity_type, normalized_value, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entity.id,
                    entity.memory_id,
                    entity.entity,
                    entity.kind,
                    entity.entity_type,
                    entity.normalized_value,
                    entity.created_at,
                ],
            );
            match result {
                Ok(_) => inserted += 1,
                Err(e) => {
                    warn!(memory_id = %record.id, entity = %entity.entity, error = %e,
                          "entity insert failed, skipping");
                }
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// Replace a record in place: same id, fresh fields, atomic swap.
    ///
    /// The underlying store has no reliable in-place UPDATE for vector
    /// columns, so replacement is delete + re-insert within one transaction.
    pub fn replace(&self, record: &Record, entities: &[Entity]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM memory_entities WHERE memory_id = ?1",
            params![record.id],
        )?;
        tx.execute("DELETE FROM memory_vec WHERE id = ?1", params![record.id])?;
        tx.execute("DELETE FROM memory WHERE id = ?1", params![record.id])?;

        let metadata_json = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        tx.execute(
            "INSERT INTO memory \
             (id, user_id, type, source_text, metadata, screenshot, extracted_text, \
              embedding, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                record.user_id,
                record.record_type.as_str(),
                record.source_text,
                metadata_json,
                record.screenshot,
                record.extracted_text,
                record.embedding.as_deref().map(embedding_to_bytes),
                record.created_at,
                record.updated_at,
            ],
        )?;

        if let Some(embedding) = &record.embedding {
            tx.execute(
                "INSERT INTO memory_vec (id, embedding) VALUES (?1, ?2)",
                params![record.id, embedding_to_bytes(embedding)],
            )?;
        }

        let mut inserted = 0usize;
        for entity in entities {
            let result = tx.execute(
                "INSERT INTO memory_entities \
                 (id, memory_id, entity, type, entity_type, normalized_value, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entity.id,
                    entity.memory_id,
                    entity.entity,
                    entity.kind,
                    entity.entity_type,
                    entity.normalized_value,
                    entity.created_at,
                ],
            );
            match result {
                Ok(_) => inserted += 1,
                Err(e) => {
                    warn!(memory_id = %record.id, entity = %entity.entity, error = %e,
                          "entity insert failed, skipping");
                }
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    /// Delete a record and its entities atomically.
    ///
    /// Idempotent: deleting an absent id succeeds and returns `false`.
    pub fn delete(&self, id: &str, user_id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM memory WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(false);
        }

        tx.execute("DELETE FROM memory_vec WHERE id = ?1", params![id])?;
        // entity rows cascade via the FK
        tx.execute(
            "DELETE FROM memory WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    // ── Read path ────────────────────────────────────────────────────────────

    pub fn get_by_id(&self, id: &str, user_id: &str) -> Result<Option<Record>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM memory WHERE id = ?1 AND user_id = ?2"),
            params![id, user_id],
            row_to_record,
        )
        .optional()
        .context("failed to fetch record")
    }

    /// Return up to `k` records ordered by descending cosine similarity.
    ///
    /// Uses the vec0 KNN index to pre-select candidates and falls back to a
    /// full scan whenever the index cannot guarantee coverage (filtered-out
    /// candidates, stale index). Rows with no embedding are never returned.
    pub fn vector_search(
        &self,
        user_id: &str,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredRecord>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;

        let knn_limit = (k * 4).max(64);
        let candidate_ids = knn_candidates(&conn, query, knn_limit)?;

        let mut results = if candidate_ids.is_empty() {
            Vec::new()
        } else {
            let rows = fetch_filtered(&conn, user_id, filters, Some(&candidate_ids))?;
            score_and_rank(rows, query, k)
        };

        // The index is an optimization, never authoritative: if the narrowed
        // candidate set under-fills (filters ate ranked rows, or the index is
        // stale relative to the table), redo the search as a full scan.
        if results.len() < k && !index_covers_table(&conn, candidate_ids.len(), knn_limit)? {
            let rows = fetch_filtered(&conn, user_id, filters, None)?;
            results = score_and_rank(rows, query, k);
        }

        Ok(results)
    }

    /// Full-scan variant of [`Self::vector_search`]; used to cross-check the
    /// index path.
    pub fn vector_search_scan(
        &self,
        user_id: &str,
        query: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredRecord>> {
        let conn = self.lock()?;
        let rows = fetch_filtered(&conn, user_id, filters, None)?;
        Ok(score_and_rank(rows, query, k))
    }

    /// Structured listing with sort and pagination. Returns the page and the
    /// total matching row count.
    pub fn metadata_query(&self, user_id: &str, query: &ListQuery) -> Result<(Vec<Record>, u64)> {
        let conn = self.lock()?;

        let mut where_sql = String::from("WHERE user_id = ?1");
        let mut sql_params: Vec<SqlValue> = vec![SqlValue::from(user_id.to_string())];
        if let Some(t) = &query.record_type {
            sql_params.push(SqlValue::from(t.clone()));
            where_sql.push_str(&format!(" AND type = ?{}", sql_params.len()));
        }

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM memory {where_sql}"),
            params_from_iter(sql_params.iter()),
            |row| row.get(0),
        )?;

        let order = if query.descending { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM memory {where_sql} \
             ORDER BY {} {order} LIMIT ?{} OFFSET ?{}",
            query.sort_key.column(),
            sql_params.len() + 1,
            sql_params.len() + 2,
        );
        sql_params.push(SqlValue::from(query.limit as i64));
        sql_params.push(SqlValue::from(query.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(sql_params.iter()), row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total as u64))
    }

    /// Newest records of one type, for the observer read-back surface.
    pub fn recent_by_type(
        &self,
        user_id: &str,
        record_type: &str,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM memory \
             WHERE user_id = ?1 AND type = ?2 \
             ORDER BY created_at DESC LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(params![user_id, record_type, limit as i64], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_entities(&self, memory_id: &str) -> Result<Vec<Entity>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, memory_id, entity, type, entity_type, normalized_value, created_at \
             FROM memory_entities WHERE memory_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![memory_id], |row| {
                Ok(Entity {
                    id: row.get(0)?,
                    memory_id: row.get(1)?,
                    entity: row.get(2)?,
                    kind: row.get(3)?,
                    entity_type: row.get(4)?,
                    normalized_value: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock()?;

        let total_records: i64 =
            conn.query_row("SELECT COUNT(*) FROM memory", [], |row| row.get(0))?;
        let embedded_records: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory WHERE embedding IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        let entity_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM memory_entities", [], |row| row.get(0))?;
        let user_count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT user_id) FROM memory",
            [],
            |row| row.get(0),
        )?;

        let mut by_type = HashMap::new();
        let mut stmt = conn.prepare("SELECT type, COUNT(*) FROM memory GROUP BY type")?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (t, count) in rows {
            by_type.insert(t, count as u64);
        }

        let (oldest_record, newest_record) = time_range(&conn)?;

        let db_size_bytes = self
            .db_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StoreStats {
            total_records: total_records as u64,
            embedded_records: embedded_records as u64,
            by_type,
            entity_count: entity_count as u64,
            user_count: user_count as u64,
            db_size_bytes,
            oldest_record,
            newest_record,
        })
    }

    // ── Retention support ────────────────────────────────────────────────────

    /// Oldest and newest `created_at` across all records.
    pub fn created_at_range(&self) -> Result<Option<(String, String)>> {
        let conn = self.lock()?;
        let (oldest, newest) = time_range(&conn)?;
        Ok(oldest.zip(newest))
    }

    /// Delete every record (and its entities and index rows) created before
    /// `cutoff`. Returns the number of records removed.
    pub fn purge_created_before(&self, cutoff: &str) -> Result<u64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM memory_entities WHERE memory_id IN \
             (SELECT id FROM memory WHERE created_at < ?1)",
            params![cutoff],
        )?;
        tx.execute(
            "DELETE FROM memory_vec WHERE id IN \
             (SELECT id FROM memory WHERE created_at < ?1)",
            params![cutoff],
        )?;
        let purged = tx.execute("DELETE FROM memory WHERE created_at < ?1", params![cutoff])?;

        tx.commit()?;
        Ok(purged as u64)
    }

    // ── Index housekeeping ───────────────────────────────────────────────────

    /// Drop and rebuild the vector index from the authoritative embedding
    /// column. Skipped (returns 0) when no embedded rows exist.
    pub fn rebuild_index(&self) -> Result<u64> {
        let mut conn = self.lock()?;

        let embedded: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memory WHERE embedding IS NOT NULL",
            [],
            |row| row.get(0),
        )?;

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM memory_vec", [])?;

        if embedded == 0 {
            tx.commit()?;
            tracing::debug!("no embedded rows, vector index rebuild skipped");
            return Ok(0);
        }

        let mut rebuilt = 0u64;
        {
            let mut select =
                tx.prepare("SELECT id, embedding FROM memory WHERE embedding IS NOT NULL")?;
            let mut insert =
                tx.prepare("INSERT INTO memory_vec (id, embedding) VALUES (?1, ?2)")?;
            let rows: Vec<(String, Vec<u8>)> = select
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (id, blob) in rows {
                insert.execute(params![id, blob])?;
                rebuilt += 1;
            }
        }

        tx.commit()?;
        tracing::info!(rows = rebuilt, "vector index rebuilt");
        Ok(rebuilt)
    }

    /// Remove index rows whose record no longer exists. Returns the number of
    /// orphans removed.
    pub fn compact_index(&self) -> Result<u64> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM memory_vec WHERE id NOT IN (SELECT id FROM memory)",
            [],
        )?;
        Ok(removed as u64)
    }

    /// Flush the WAL into the main database file.
    pub fn checkpoint(&self) -> Result<()> {
        let conn = self.lock()?;
        crate::db::checkpoint(&conn)
    }

    /// Shared connection handle, for components layered on the same database.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

// ── Row mapping and query helpers ────────────────────────────────────────────

const RECORD_COLUMNS: &str = "id, user_id, type, source_text, metadata, screenshot, \
                              extracted_text, embedding, created_at, updated_at";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let type_str: String = row.get(2)?;
    let metadata_str: Option<String> = row.get(4)?;
    let embedding_blob: Option<Vec<u8>> = row.get(7)?;
    Ok(Record {
        id: row.get(0)?,
        user_id: row.get(1)?,
        record_type: RecordType::from(type_str.as_str()),
        source_text: row.get(3)?,
        metadata: metadata_str.and_then(|s| serde_json::from_str(&s).ok()),
        screenshot: row.get(5)?,
        extracted_text: row.get(6)?,
        embedding: embedding_blob.map(|b| bytes_to_embedding(&b)),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

/// KNN candidate ids from the vec0 index, nearest first.
fn knn_candidates(conn: &Connection, query: &[f32], limit: usize) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM memory_vec WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![embedding_to_bytes(query), limit as i64], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// True when the KNN pass already saw every indexed row, and the index holds
/// every embedded record — in that case a full scan cannot add anything.
fn index_covers_table(conn: &Connection, knn_returned: usize, knn_limit: usize) -> Result<bool> {
    if knn_returned >= knn_limit {
        return Ok(false);
    }
    let indexed: i64 = conn.query_row("SELECT COUNT(*) FROM memory_vec", [], |row| row.get(0))?;
    let embedded: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memory WHERE embedding IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(indexed == embedded)
}

/// Fetch embedded records matching the filters, optionally restricted to a
/// candidate id set.
fn fetch_filtered(
    conn: &Connection,
    user_id: &str,
    filters: &SearchFilters,
    ids: Option<&[String]>,
) -> Result<Vec<Record>> {
    let mut sql = format!(
        "SELECT {RECORD_COLUMNS} FROM memory \
         WHERE user_id = ?1 AND embedding IS NOT NULL"
    );
    let mut sql_params: Vec<SqlValue> = vec![SqlValue::from(user_id.to_string())];

    if let Some(t) = &filters.record_type {
        sql_params.push(SqlValue::from(t.clone()));
        sql.push_str(&format!(" AND type = ?{}", sql_params.len()));
    }
    if let Some(session) = &filters.session_id {
        sql_params.push(SqlValue::from(format!("%{session}%")));
        sql.push_str(&format!(" AND metadata LIKE ?{}", sql_params.len()));
    }
    if filters.max_age_days > 0 {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(filters.max_age_days);
        sql_params.push(SqlValue::from(cutoff.to_rfc3339()));
        sql.push_str(&format!(" AND created_at >= ?{}", sql_params.len()));
    }
    if let Some(ids) = ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = ids
            .iter()
            .map(|id| {
                sql_params.push(SqlValue::from(id.clone()));
                format!("?{}", sql_params.len())
            })
            .collect();
        sql.push_str(&format!(" AND id IN ({})", placeholders.join(", ")));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(sql_params.iter()), row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Score records against the query vector, sort by descending similarity, and
/// keep the top `k`.
fn score_and_rank(rows: Vec<Record>, query: &[f32], k: usize) -> Vec<ScoredRecord> {
    let mut scored: Vec<ScoredRecord> = rows
        .into_iter()
        .filter_map(|record| {
            let similarity = record
                .embedding
                .as_ref()
                .map(|e| cosine_similarity(e, query))?;
            Some(ScoredRecord { record, similarity })
        })
        .collect();
    scored.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(k);
    scored
}

fn time_range(conn: &Connection) -> Result<(Option<String>, Option<String>)> {
    let range = conn.query_row(
        "SELECT MIN(created_at), MAX(created_at) FROM memory",
        [],
        |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
    )?;
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::DEFAULT_USER_ID;
    use crate::memory::{mint_record_id, now_rfc3339};

    fn test_store() -> MemoryStore {
        MemoryStore::open_in_memory().unwrap()
    }

    /// Unit vector with a spike at `seed`.
    fn spike(seed: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 384];
        v[seed % 384] = 1.0;
        v
    }

    fn make_record(user_id: &str, text: &str, embedding: Option<Vec<f32>>) -> Record {
        let now = now_rfc3339();
        Record {
            id: mint_record_id(),
            user_id: user_id.to_string(),
            record_type: RecordType::UserMemory,
            source_text: text.to_string(),
            metadata: None,
            screenshot: None,
            extracted_text: None,
            embedding,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn insert_simple(store: &MemoryStore, user_id: &str, text: &str, seed: usize) -> String {
        let record = make_record(user_id, text, Some(spike(seed)));
        let id = record.id.clone();
        store.insert(&record, &[]).unwrap();
        id
    }

    #[test]
    fn insert_and_get_round_trip() {
        let store = test_store();
        let record = make_record("u1", "hello there", Some(spike(3)));
        let entities = vec![Entity::new(&record.id, "person", "Dr. Smith")];
        let inserted = store.insert(&record, &entities).unwrap();
        assert_eq!(inserted, 1);

        let fetched = store.get_by_id(&record.id, "u1").unwrap().unwrap();
        assert_eq!(fetched.source_text, "hello there");
        assert_eq!(fetched.embedding.as_ref().unwrap().len(), 384);

        let fetched_entities = store.list_entities(&record.id).unwrap();
        assert_eq!(fetched_entities.len(), 1);
        assert_eq!(fetched_entities[0].normalized_value, "dr. smith");
    }

    #[test]
    fn get_is_scoped_by_user() {
        let store = test_store();
        let id = insert_simple(&store, "u1", "private", 0);
        assert!(store.get_by_id(&id, "u2").unwrap().is_none());
        assert!(store.get_by_id(&id, "u1").unwrap().is_some());
    }

    #[test]
    fn delete_is_idempotent_and_cascades() {
        let store = test_store();
        let record = make_record("u1", "to delete", Some(spike(1)));
        let id = record.id.clone();
        store
            .insert(&record, &[Entity::new(&id, "app", "editor")])
            .unwrap();

        assert!(store.delete(&id, "u1").unwrap());
        assert!(!store.delete(&id, "u1").unwrap()); // second call still succeeds
        assert!(store.get_by_id(&id, "u1").unwrap().is_none());
        assert!(store.list_entities(&id).unwrap().is_empty());

        // the index row is gone too
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_records, 0);
    }

    #[test]
    fn vector_search_ranks_by_similarity() {
        let store = test_store();
        let near = insert_simple(&store, DEFAULT_USER_ID, "near", 0);
        let _far = insert_simple(&store, DEFAULT_USER_ID, "far", 100);

        let results = store
            .vector_search(DEFAULT_USER_ID, &spike(0), 5, &SearchFilters::default())
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].record.id, near);
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
        for pair in results.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }

    #[test]
    fn vector_search_excludes_other_users_and_null_embeddings() {
        let store = test_store();
        insert_simple(&store, "other", "not mine", 0);
        let legacy = make_record(DEFAULT_USER_ID, "legacy row", None);
        store.insert(&legacy, &[]).unwrap();

        let results = store
            .vector_search(DEFAULT_USER_ID, &spike(0), 5, &SearchFilters::default())
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn vector_search_filters_by_type_and_session() {
        let store = test_store();
        let mut screen = make_record(DEFAULT_USER_ID, "screen text", Some(spike(0)));
        screen.record_type = RecordType::ScreenCapture;
        screen.metadata = Some(serde_json::json!({"sessionId": "sess-42"}));
        let screen_id = screen.id.clone();
        store.insert(&screen, &[]).unwrap();
        insert_simple(&store, DEFAULT_USER_ID, "plain memory", 1);

        let filters = SearchFilters {
            record_type: Some("screen_capture".into()),
            ..Default::default()
        };
        let results = store
            .vector_search(DEFAULT_USER_ID, &spike(0), 5, &filters)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.id, screen_id);

        let filters = SearchFilters {
            session_id: Some("sess-42".into()),
            ..Default::default()
        };
        let results = store
            .vector_search(DEFAULT_USER_ID, &spike(0), 5, &filters)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.id, screen_id);

        let filters = SearchFilters {
            session_id: Some("sess-missing".into()),
            ..Default::default()
        };
        let results = store
            .vector_search(DEFAULT_USER_ID, &spike(0), 5, &filters)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn index_and_scan_paths_agree() {
        let store = test_store();
        for i in 0..20 {
            insert_simple(&store, DEFAULT_USER_ID, &format!("memory {i}"), i * 7);
        }

        let query = spike(14);
        let via_index = store
            .vector_search(DEFAULT_USER_ID, &query, 5, &SearchFilters::default())
            .unwrap();
        let via_scan = store
            .vector_search_scan(DEFAULT_USER_ID, &query, 5, &SearchFilters::default())
            .unwrap();

        let index_ids: Vec<&str> = via_index.iter().map(|r| r.record.id.as_str()).collect();
        let scan_ids: Vec<&str> = via_scan.iter().map(|r| r.record.id.as_str()).collect();
        assert_eq!(index_ids[0], scan_ids[0]);
        assert_eq!(via_index.len(), via_scan.len());
        for (a, b) in via_index.iter().zip(via_scan.iter()) {
            assert!((a.similarity - b.similarity).abs() < 1e-9);
        }
    }

    #[test]
    fn metadata_query_sorts_and_pages() {
        let store = test_store();
        for i in 0..5 {
            let mut record = make_record(DEFAULT_USER_ID, &format!("item {i}"), Some(spike(i)));
            record.created_at = format!("2026-01-0{}T00:00:00+00:00", i + 1);
            record.updated_at = record.created_at.clone();
            store.insert(&record, &[]).unwrap();
        }

        let (page, total) = store
            .metadata_query(
                DEFAULT_USER_ID,
                &ListQuery {
                    limit: 2,
                    offset: 0,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].source_text, "item 4"); // newest first

        let (page, _) = store
            .metadata_query(
                DEFAULT_USER_ID,
                &ListQuery {
                    limit: 2,
                    offset: 4,
                    descending: false,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].source_text, "item 4");
    }

    #[test]
    fn rebuild_index_restores_search() {
        let store = test_store();
        let id = insert_simple(&store, DEFAULT_USER_ID, "survivor", 9);

        // Simulate a stale index
        {
            let conn = store.connection();
            let conn = conn.lock().unwrap();
            conn.execute("DELETE FROM memory_vec", []).unwrap();
        }

        let rebuilt = store.rebuild_index().unwrap();
        assert_eq!(rebuilt, 1);

        let results = store
            .vector_search(DEFAULT_USER_ID, &spike(9), 1, &SearchFilters::default())
            .unwrap();
        assert_eq!(results[0].record.id, id);
    }

    #[test]
    fn rebuild_index_skips_when_nothing_embedded() {
        let store = test_store();
        let legacy = make_record(DEFAULT_USER_ID, "legacy", None);
        store.insert(&legacy, &[]).unwrap();
        assert_eq!(store.rebuild_index().unwrap(), 0);
    }

    #[test]
    fn search_survives_stale_index() {
        let store = test_store();
        let id = insert_simple(&store, DEFAULT_USER_ID, "findable", 3);

        {
            let conn = store.connection();
            let conn = conn.lock().unwrap();
            conn.execute("DELETE FROM memory_vec", []).unwrap();
        }

        // Index lost the row, but the scan fallback still finds it
        let results = store
            .vector_search(DEFAULT_USER_ID, &spike(3), 1, &SearchFilters::default())
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].record.id, id);
    }

    #[test]
    fn purge_removes_old_rows_and_entities() {
        let store = test_store();
        let mut old = make_record(DEFAULT_USER_ID, "ancient", Some(spike(0)));
        old.created_at = "2020-01-01T00:00:00+00:00".into();
        let old_id = old.id.clone();
        store
            .insert(&old, &[Entity::new(&old_id, "person", "Old Friend")])
            .unwrap();
        let new_id = insert_simple(&store, DEFAULT_USER_ID, "recent", 1);

        let purged = store.purge_created_before("2021-01-01T00:00:00+00:00").unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_by_id(&old_id, DEFAULT_USER_ID).unwrap().is_none());
        assert!(store.list_entities(&old_id).unwrap().is_empty());
        assert!(store.get_by_id(&new_id, DEFAULT_USER_ID).unwrap().is_some());
    }

    #[test]
    fn replace_preserves_id() {
        let store = test_store();
        let record = make_record("u1", "before", Some(spike(0)));
        let id = record.id.clone();
        store.insert(&record, &[]).unwrap();

        let mut updated = record.clone();
        updated.source_text = "after".into();
        updated.embedding = Some(spike(5));
        store
            .replace(&updated, &[Entity::new(&id, "topic", "edits")])
            .unwrap();

        let fetched = store.get_by_id(&id, "u1").unwrap().unwrap();
        assert_eq!(fetched.source_text, "after");
        assert_eq!(store.list_entities(&id).unwrap().len(), 1);

        let results = store
            .vector_search("u1", &spike(5), 1, &SearchFilters::default())
            .unwrap();
        assert_eq!(results[0].record.id, id);
    }

    #[test]
    fn stats_counts_everything() {
        let store = test_store();
        let record = make_record("u1", "stat me", Some(spike(0)));
        store
            .insert(&record, &[Entity::new(&record.id, "person", "A")])
            .unwrap();
        insert_simple(&store, "u2", "other user", 1);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.embedded_records, 2);
        assert_eq!(stats.entity_count, 1);
        assert_eq!(stats.user_count, 2);
        assert_eq!(stats.by_type["user_memory"], 2);
        assert!(stats.oldest_record.is_some());
    }
}
