//! SQL DDL for all service tables.
//!
//! Defines the `memory`, `memory_entities`, `skill_prompts`, `context_rules`,
//! `installed_skills`, and `schema_meta` tables, plus the `vec0` virtual tables
//! backing cosine search. All DDL uses `IF NOT EXISTS` for idempotent
//! initialization.

use rusqlite::Connection;

/// All schema DDL statements for the core tables.
const SCHEMA_SQL: &str = r#"
-- Primary memory storage
CREATE TABLE IF NOT EXISTS memory (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL DEFAULT 'default_user',
    type TEXT NOT NULL,
    source_text TEXT NOT NULL,
    metadata TEXT,
    screenshot TEXT,
    extracted_text TEXT,
    embedding BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memory_user ON memory(user_id);
CREATE INDEX IF NOT EXISTS idx_memory_type ON memory(type);
CREATE INDEX IF NOT EXISTS idx_memory_created ON memory(created_at);
CREATE INDEX IF NOT EXISTS idx_memory_user_created ON memory(user_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_memory_user_type ON memory(user_id, type);
CREATE INDEX IF NOT EXISTS idx_memory_user_type_created ON memory(user_id, type, created_at DESC);

-- Caller-tagged entities, many per record
CREATE TABLE IF NOT EXISTS memory_entities (
    id TEXT PRIMARY KEY,
    memory_id TEXT NOT NULL REFERENCES memory(id) ON DELETE CASCADE,
    entity TEXT NOT NULL,
    type TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    normalized_value TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_memory ON memory_entities(memory_id);
CREATE INDEX IF NOT EXISTS idx_entities_entity ON memory_entities(entity);
CREATE INDEX IF NOT EXISTS idx_entities_type ON memory_entities(type);
CREATE INDEX IF NOT EXISTS idx_entities_entity_type ON memory_entities(entity_type);

-- Semantic-searchable skill prompt snippets
CREATE TABLE IF NOT EXISTS skill_prompts (
    id TEXT PRIMARY KEY,
    tags TEXT NOT NULL,
    prompt_text TEXT NOT NULL,
    embedding BLOB,
    hit_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Per-site / per-app context rules, exact-match keyed
CREATE TABLE IF NOT EXISTS context_rules (
    id TEXT PRIMARY KEY,
    context_type TEXT NOT NULL CHECK(context_type IN ('site','app')),
    context_key TEXT NOT NULL,
    rule_text TEXT NOT NULL,
    category TEXT,
    source TEXT,
    hit_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(context_type, context_key, rule_text)
);

CREATE INDEX IF NOT EXISTS idx_rules_key ON context_rules(context_type, context_key);

-- Installed skill registry
CREATE TABLE IF NOT EXISTS installed_skills (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    contract_md TEXT,
    exec_path TEXT NOT NULL,
    exec_type TEXT NOT NULL CHECK(exec_type IN ('node','shell')),
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// The vec0 virtual table must be created separately (sqlite-vec syntax).
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS memory_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"memory".to_string()));
        assert!(tables.contains(&"memory_entities".to_string()));
        assert!(tables.contains(&"skill_prompts".to_string()));
        assert!(tables.contains(&"context_rules".to_string()));
        assert!(tables.contains(&"installed_skills".to_string()));
        assert!(tables.contains(&"schema_meta".to_string()));

        // Verify the vec extension is live
        let version: String = conn
            .query_row("SELECT vec_version()", [], |r| r.get(0))
            .unwrap();
        assert!(!version.is_empty());
    }

    #[test]
    fn schema_is_idempotent() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap(); // second call should not error
    }

    #[test]
    fn context_rule_triples_are_unique() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let insert = "INSERT INTO context_rules \
                      (id, context_type, context_key, rule_text, created_at, updated_at) \
                      VALUES (?1, 'site', 'github.com', 'prefer squash merges', ?2, ?2)";
        conn.execute(insert, ["r1", "2026-01-01T00:00:00Z"]).unwrap();
        let dup = conn.execute(insert, ["r2", "2026-01-01T00:00:00Z"]);
        assert!(dup.is_err());
    }

    #[test]
    fn entity_rows_cascade_on_record_delete() {
        crate::db::load_sqlite_vec();
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        init_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO memory (id, user_id, type, source_text, created_at, updated_at) \
             VALUES ('m1', 'u1', 'user_memory', 'hello', ?1, ?1)",
            ["2026-01-01T00:00:00Z"],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO memory_entities \
             (id, memory_id, entity, type, entity_type, normalized_value, created_at) \
             VALUES ('e1', 'm1', 'Smith', 'person', 'person', 'smith', ?1)",
            ["2026-01-01T00:00:00Z"],
        )
        .unwrap();

        conn.execute("DELETE FROM memory WHERE id = 'm1'", []).unwrap();
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_entities", [], |r| r.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }
}
