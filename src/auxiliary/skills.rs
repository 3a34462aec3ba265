//! Installed-skill registry.
//!
//! Skills are name-keyed capabilities with a contract document and an
//! executable inside the per-user sandbox directory. Names follow the dotted
//! lowercase pattern (`vendor.skill`), and any executable path that escapes
//! the sandbox is rejected.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::memory::service::{ServiceError, ServiceResult};
use crate::memory::{mint_row_id, now_rfc3339};

static SKILL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9]*(\.[a-z][a-z0-9]*)+$").expect("valid regex"));

#[derive(Debug, Clone, Serialize)]
pub struct InstalledSkill {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "contractMd", skip_serializing_if = "Option::is_none")]
    pub contract_md: Option<String>,
    #[serde(rename = "execPath")]
    pub exec_path: String,
    #[serde(rename = "execType")]
    pub exec_type: String,
    pub enabled: bool,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillRegistration {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "contractMd")]
    pub contract_md: Option<String>,
    #[serde(rename = "execPath")]
    pub exec_path: String,
    #[serde(rename = "execType")]
    pub exec_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone)]
pub struct SkillRegistry {
    conn: Arc<Mutex<Connection>>,
    sandbox_dir: PathBuf,
}

impl SkillRegistry {
    pub fn new(conn: Arc<Mutex<Connection>>, sandbox_dir: PathBuf) -> Self {
        Self { conn, sandbox_dir }
    }

    fn lock(&self) -> ServiceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ServiceError::Internal(format!("db lock poisoned: {e}")))
    }

    /// Register (or re-register) a skill. Name must match the dotted lowercase
    /// pattern and the executable must resolve inside the sandbox directory.
    pub fn register(&self, registration: SkillRegistration) -> ServiceResult<InstalledSkill> {
        let name = registration.name.trim();
        if !SKILL_NAME.is_match(name) {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid skill name {name:?}: expected dotted lowercase like 'vendor.skill'"
            )));
        }
        if registration.exec_type != "node" && registration.exec_type != "shell" {
            return Err(ServiceError::InvalidRequest(format!(
                "execType must be 'node' or 'shell', got {:?}",
                registration.exec_type
            )));
        }
        let exec_path = self.validate_exec_path(&registration.exec_path)?;

        let now = now_rfc3339();
        let id = mint_row_id();

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO installed_skills \
             (id, name, description, contract_md, exec_path, exec_type, enabled, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
             ON CONFLICT(name) DO UPDATE SET \
                description = excluded.description, \
                contract_md = excluded.contract_md, \
                exec_path = excluded.exec_path, \
                exec_type = excluded.exec_type, \
                enabled = excluded.enabled, \
                updated_at = excluded.updated_at",
            params![
                id,
                name,
                registration.description,
                registration.contract_md,
                exec_path.to_string_lossy(),
                registration.exec_type,
                registration.enabled,
                now,
            ],
        )
        .map_err(db_err)?;

        conn.query_row(
            &format!("SELECT {COLUMNS} FROM installed_skills WHERE name = ?1"),
            params![name],
            row_to_skill,
        )
        .map_err(db_err)
    }

    pub fn get(&self, name: &str) -> ServiceResult<Option<InstalledSkill>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM installed_skills WHERE name = ?1"),
            params![name],
            row_to_skill,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn list(&self) -> ServiceResult<Vec<InstalledSkill>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM installed_skills ORDER BY name"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], row_to_skill)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err);
        rows
    }

    /// Remove a skill. Idempotent; returns whether a row was removed.
    pub fn unregister(&self, name: &str) -> ServiceResult<bool> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM installed_skills WHERE name = ?1", params![name])
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    /// Reject executables outside the sandbox. The path is normalized
    /// lexically (the file may not exist yet), so `..` escapes are refused
    /// outright.
    fn validate_exec_path(&self, raw: &str) -> ServiceResult<PathBuf> {
        let path = crate::config::expand_tilde(raw);
        let path = if path.is_absolute() {
            path
        } else {
            self.sandbox_dir.join(path)
        };

        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ServiceError::InvalidRequest(format!(
                "execPath must not contain '..': {raw:?}"
            )));
        }
        if !path.starts_with(&self.sandbox_dir) {
            return Err(ServiceError::InvalidRequest(format!(
                "execPath must live inside {}",
                self.sandbox_dir.display()
            )));
        }
        Ok(path)
    }

    pub fn sandbox_dir(&self) -> &Path {
        &self.sandbox_dir
    }
}

const COLUMNS: &str =
    "id, name, description, contract_md, exec_path, exec_type, enabled, created_at, updated_at";

fn row_to_skill(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstalledSkill> {
    Ok(InstalledSkill {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        contract_md: row.get(3)?,
        exec_path: row.get(4)?,
        exec_type: row.get(5)?,
        enabled: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn db_err(e: rusqlite::Error) -> ServiceError {
    ServiceError::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SkillRegistry {
        let conn = crate::db::open_memory_database().unwrap();
        SkillRegistry::new(
            Arc::new(Mutex::new(conn)),
            PathBuf::from("/home/tester/.thinkdrop/skills"),
        )
    }

    fn registration(name: &str, exec_path: &str) -> SkillRegistration {
        SkillRegistration {
            name: name.into(),
            description: Some("test skill".into()),
            contract_md: None,
            exec_path: exec_path.into(),
            exec_type: "node".into(),
            enabled: true,
        }
    }

    #[test]
    fn register_list_unregister() {
        let registry = registry();
        let skill = registry
            .register(registration("acme.summarize", "acme/run.js"))
            .unwrap();
        assert_eq!(skill.name, "acme.summarize");
        assert!(skill.exec_path.starts_with("/home/tester/.thinkdrop/skills"));
        assert!(skill.enabled);

        assert_eq!(registry.list().unwrap().len(), 1);
        assert!(registry.unregister("acme.summarize").unwrap());
        assert!(!registry.unregister("acme.summarize").unwrap());
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn re_register_updates_in_place() {
        let registry = registry();
        registry
            .register(registration("acme.summarize", "acme/v1.js"))
            .unwrap();
        let updated = registry
            .register(registration("acme.summarize", "acme/v2.js"))
            .unwrap();
        assert!(updated.exec_path.ends_with("acme/v2.js"));
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn bad_names_are_rejected() {
        let registry = registry();
        for name in ["plain", "Caps.skill", "1st.skill", "dots..double", "trailing."] {
            let err = registry
                .register(registration(name, "x/run.js"))
                .unwrap_err();
            assert_eq!(err.code(), "INVALID_REQUEST", "name {name:?}");
        }
        assert!(registry
            .register(registration("a.b2.c", "x/run.js"))
            .is_ok());
    }

    #[test]
    fn sandbox_escape_is_rejected() {
        let registry = registry();
        for path in ["../outside.js", "/usr/bin/evil", "sub/../../../etc/passwd"] {
            let err = registry
                .register(registration("acme.skill", path))
                .unwrap_err();
            assert_eq!(err.code(), "INVALID_REQUEST", "path {path:?}");
        }
        // absolute path inside the sandbox is fine
        assert!(registry
            .register(registration(
                "acme.skill",
                "/home/tester/.thinkdrop/skills/acme/run.js"
            ))
            .is_ok());
    }

    #[test]
    fn invalid_exec_type_is_rejected() {
        let registry = registry();
        let mut reg = registration("acme.skill", "run.js");
        reg.exec_type = "python".into();
        assert_eq!(registry.register(reg).unwrap_err().code(), "INVALID_REQUEST");
    }
}
