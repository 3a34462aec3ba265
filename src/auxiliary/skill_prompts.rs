//! Semantic-searchable skill prompt snippets.
//!
//! Each snippet carries a comma-joined tag list and a 384-dim embedding. The
//! table stays small, so search scores every stored vector directly.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::memory::service::{ServiceError, ServiceResult};
use crate::memory::{cosine_similarity, embedding_to_bytes, bytes_to_embedding, mint_row_id, now_rfc3339};

#[derive(Debug, Clone, Serialize)]
pub struct SkillPrompt {
    pub id: String,
    pub tags: Vec<String>,
    #[serde(rename = "promptText")]
    pub prompt_text: String,
    #[serde(rename = "hitCount")]
    pub hit_count: u64,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
pub struct SkillPromptHit {
    #[serde(flatten)]
    pub prompt: SkillPrompt,
    pub similarity: f64,
}

#[derive(Clone)]
pub struct SkillPromptStore {
    conn: Arc<Mutex<Connection>>,
}

impl SkillPromptStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> ServiceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ServiceError::Internal(format!("db lock poisoned: {e}")))
    }

    /// Insert a prompt snippet with its embedding.
    pub fn save(
        &self,
        tags: &[String],
        prompt_text: &str,
        embedding: &[f32],
    ) -> ServiceResult<SkillPrompt> {
        let prompt_text = prompt_text.trim();
        if prompt_text.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "promptText must not be empty".into(),
            ));
        }

        let prompt = SkillPrompt {
            id: mint_row_id(),
            tags: tags.iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect(),
            prompt_text: prompt_text.to_string(),
            hit_count: 0,
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO skill_prompts (id, tags, prompt_text, embedding, hit_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
            params![
                prompt.id,
                prompt.tags.join(","),
                prompt.prompt_text,
                embedding_to_bytes(embedding),
                prompt.created_at,
                prompt.updated_at,
            ],
        )
        .map_err(db_err)?;

        Ok(prompt)
    }

    /// Semantic search over prompt snippets; bumps `hit_count` on each result.
    pub fn search(&self, query: &[f32], limit: usize) -> ServiceResult<Vec<SkillPromptHit>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, tags, prompt_text, embedding, hit_count, created_at, updated_at \
                 FROM skill_prompts WHERE embedding IS NOT NULL",
            )
            .map_err(db_err)?;
        let rows: Vec<(SkillPrompt, Vec<u8>)> = stmt
            .query_map([], |row| {
                let tags: String = row.get(1)?;
                Ok((
                    SkillPrompt {
                        id: row.get(0)?,
                        tags: tags
                            .split(',')
                            .filter(|t| !t.is_empty())
                            .map(str::to_string)
                            .collect(),
                        prompt_text: row.get(2)?,
                        hit_count: row.get::<_, i64>(4)? as u64,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    },
                    row.get(3)?,
                ))
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut hits: Vec<SkillPromptHit> = rows
            .into_iter()
            .map(|(prompt, blob)| {
                let similarity = cosine_similarity(&bytes_to_embedding(&blob), query);
                SkillPromptHit { prompt, similarity }
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);

        let mut bump = conn
            .prepare("UPDATE skill_prompts SET hit_count = hit_count + 1 WHERE id = ?1")
            .map_err(db_err)?;
        for hit in &mut hits {
            bump.execute(params![hit.prompt.id]).map_err(db_err)?;
            hit.prompt.hit_count += 1;
        }

        Ok(hits)
    }
}

fn db_err(e: rusqlite::Error) -> ServiceError {
    ServiceError::Database(e.to_string())
}
