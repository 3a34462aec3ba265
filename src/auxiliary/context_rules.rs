//! Per-site and per-app context rules, exact-match keyed.
//!
//! A rule is addressed by `(context_type, context_key)` where the key is a
//! lowercased hostname or application name. The `(type, key, text)` triple is
//! unique; saving an existing triple refreshes it instead of duplicating.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::memory::service::{ServiceError, ServiceResult};
use crate::memory::{mint_row_id, now_rfc3339};

#[derive(Debug, Clone, Serialize)]
pub struct ContextRule {
    pub id: String,
    #[serde(rename = "contextType")]
    pub context_type: String,
    #[serde(rename = "contextKey")]
    pub context_key: String,
    #[serde(rename = "ruleText")]
    pub rule_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(rename = "hitCount")]
    pub hit_count: u64,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

#[derive(Clone)]
pub struct ContextRuleStore {
    conn: Arc<Mutex<Connection>>,
}

impl ContextRuleStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> ServiceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ServiceError::Internal(format!("db lock poisoned: {e}")))
    }

    /// Save a rule. The `(type, key, text)` triple is unique after trim; an
    /// existing triple only gets its `updated_at` refreshed.
    pub fn save(
        &self,
        context_type: &str,
        context_key: &str,
        rule_text: &str,
        category: Option<&str>,
        source: Option<&str>,
    ) -> ServiceResult<ContextRule> {
        if context_type != "site" && context_type != "app" {
            return Err(ServiceError::InvalidRequest(format!(
                "contextType must be 'site' or 'app', got {context_type:?}"
            )));
        }
        let context_key = context_key.trim().to_lowercase();
        let rule_text = rule_text.trim().to_string();
        if context_key.is_empty() || rule_text.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "contextKey and ruleText must not be empty".into(),
            ));
        }

        let now = now_rfc3339();
        let id = mint_row_id();

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO context_rules \
             (id, context_type, context_key, rule_text, category, source, hit_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7) \
             ON CONFLICT(context_type, context_key, rule_text) \
             DO UPDATE SET updated_at = excluded.updated_at, \
                           category = COALESCE(excluded.category, category), \
                           source = COALESCE(excluded.source, source)",
            params![id, context_type, context_key, rule_text, category, source, now],
        )
        .map_err(db_err)?;

        conn.query_row(
            "SELECT id, context_type, context_key, rule_text, category, source, \
                    hit_count, created_at, updated_at \
             FROM context_rules \
             WHERE context_type = ?1 AND context_key = ?2 AND rule_text = ?3",
            params![context_type, context_key, rule_text],
            row_to_rule,
        )
        .map_err(db_err)
    }

    /// All rules for an exact `(type, lowercased key)` pair; bumps hit counts.
    pub fn get(&self, context_type: &str, context_key: &str) -> ServiceResult<Vec<ContextRule>> {
        let context_key = context_key.trim().to_lowercase();
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, context_type, context_key, rule_text, category, source, \
                        hit_count, created_at, updated_at \
                 FROM context_rules \
                 WHERE context_type = ?1 AND context_key = ?2 \
                 ORDER BY created_at",
            )
            .map_err(db_err)?;
        let mut rules: Vec<ContextRule> = stmt
            .query_map(params![context_type, context_key], row_to_rule)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        let mut bump = conn
            .prepare("UPDATE context_rules SET hit_count = hit_count + 1 WHERE id = ?1")
            .map_err(db_err)?;
        for rule in &mut rules {
            bump.execute(params![rule.id]).map_err(db_err)?;
            rule.hit_count += 1;
        }

        Ok(rules)
    }
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextRule> {
    Ok(ContextRule {
        id: row.get(0)?,
        context_type: row.get(1)?,
        context_key: row.get(2)?,
        rule_text: row.get(3)?,
        category: row.get(4)?,
        source: row.get(5)?,
        hit_count: row.get::<_, i64>(6)? as u64,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn db_err(e: rusqlite::Error) -> ServiceError {
    ServiceError::Database(e.to_string())
}
