pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;
use std::time::Duration;

static SQLITE_VEC_INIT: Once = Once::new();

/// How many times to retry opening a database whose file lock is held
/// elsewhere, and the backoff base applied per attempt.
const OPEN_RETRIES: u32 = 5;
const OPEN_BACKOFF_BASE: Duration = Duration::from_secs(3);

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the service database at the given path, with the vec
/// extension loaded and schema initialized.
///
/// A database locked by another process is retried up to [`OPEN_RETRIES`]
/// times with `3s × attempt` backoff before surfacing the error.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let mut last_err = None;
    for attempt in 1..=OPEN_RETRIES {
        match try_open(path) {
            Ok(conn) => {
                tracing::info!(path = %path.display(), "database initialized");
                return Ok(conn);
            }
            Err(e) if is_locked(&e) && attempt < OPEN_RETRIES => {
                let wait = OPEN_BACKOFF_BASE * attempt;
                tracing::warn!(
                    attempt,
                    wait_secs = wait.as_secs(),
                    "database file locked by another process, retrying"
                );
                std::thread::sleep(wait);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("database open retries exhausted")))
}

fn try_open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| {
        format!(
            "failed to open database at {}. If the file is corrupt, \
             restore from a backup or delete it to start fresh.",
            path.display()
        )
    })?;

    // WAL for concurrent readers, FK cascades for entity rows
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // Wait up to 5 seconds for statement-level locks instead of failing immediately
    conn.pragma_update(None, "busy_timeout", "5000")?;

    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;

    let integrity: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if integrity != "ok" {
        anyhow::bail!("database integrity check failed: {integrity}");
    }

    Ok(conn)
}

/// Classify an open failure as lock contention (retryable).
fn is_locked(err: &anyhow::Error) -> bool {
    err.downcast_ref::<rusqlite::Error>()
        .map(|e| {
            matches!(
                e.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy)
                    | Some(rusqlite::ErrorCode::DatabaseLocked)
            )
        })
        .unwrap_or(false)
}

/// Flush the WAL into the main database file.
pub fn checkpoint(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        .context("failed to checkpoint WAL")?;
    Ok(())
}

/// Result of a full database health check.
pub struct HealthReport {
    pub schema_version: u32,
    pub embedding_model: Option<String>,
    pub integrity_ok: bool,
    pub sqlite_vec_version: String,
    pub memory_count: i64,
    pub entity_count: i64,
}

/// Run a comprehensive health check on the database.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let schema_version =
        migrations::get_schema_version(conn).context("failed to read schema version")?;

    let embedding_model =
        migrations::get_embedding_model(conn).context("failed to read embedding model")?;

    let integrity: String = conn
        .pragma_query_value(None, "integrity_check", |row| row.get(0))
        .context("failed to run integrity check")?;

    let sqlite_vec_version: String = conn
        .query_row("SELECT vec_version()", [], |row| row.get(0))
        .context("failed to get sqlite-vec version")?;

    let memory_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memory", [], |row| row.get(0))
        .unwrap_or(0);

    let entity_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memory_entities", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(HealthReport {
        schema_version,
        embedding_model,
        integrity_ok: integrity == "ok",
        sqlite_vec_version,
        memory_count,
        entity_count,
    })
}

/// Open an in-memory database for testing.
pub fn open_memory_database() -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&conn).context("failed to run migrations")?;
    Ok(conn)
}
