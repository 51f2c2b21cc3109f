//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode so a second process opening the same file
//! (another terminal window, a CLI tool) serializes on SQLite's own locks.
//! Provides schema migrations and the small `local_settings` key/value store.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Shared database handle.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::DatabaseState(format!("connection lock poisoned: {e}")))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `db_path`.
///
/// Creates the parent directory if needed, opens the connection, sets
/// pragmas, and runs any pending migrations. A file SQLite reports as
/// corrupt or not a database is moved aside and a fresh one created; any
/// other failure (a lock held by another process, permissions) is returned
/// and the file is left alone.
pub fn init(db_path: &Path) -> Result<DbState> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::DatabaseState(format!("Failed to create data dir: {e}")))?;
    }

    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(db_path) {
        Ok(c) => c,
        Err(first_err) if is_corruption(&first_err) => {
            let moved = quarantine(db_path)?;
            warn!(
                "Database unreadable ({first_err}); moved to {} and starting fresh",
                moved.display()
            );
            open_and_configure(db_path)?
        }
        Err(e) => return Err(e),
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: db_path.to_path_buf(),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA busy_timeout = 5000;
         PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

fn is_corruption(err: &Error) -> bool {
    matches!(
        err,
        Error::Database(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
    )
}

/// Rename the database and its WAL/SHM side files out of the way. The
/// queued rows stay recoverable by hand.
fn quarantine(db_path: &Path) -> Result<PathBuf> {
    let suffix = format!("corrupt-{}", Utc::now().timestamp_millis());
    let moved = db_path.with_extension(format!("db.{suffix}"));
    fs::rename(db_path, &moved)
        .map_err(|e| Error::DatabaseState(format!("Failed to move unreadable database: {e}")))?;
    for side in ["db-wal", "db-shm"] {
        let path = db_path.with_extension(side);
        if path.exists() {
            if let Err(e) = fs::rename(&path, db_path.with_extension(format!("{side}.{suffix}"))) {
                error!("Failed to move {}: {e}", path.display());
            }
        }
    }
    Ok(moved)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: offline queue and settings.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        -- offline_queue (deferred mutating API calls)
        CREATE TABLE IF NOT EXISTS offline_queue (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            request_type TEXT NOT NULL,
            url TEXT NOT NULL,
            method TEXT NOT NULL DEFAULT 'POST',
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            created_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            updated_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_offline_queue_status ON offline_queue(status);
        CREATE INDEX IF NOT EXISTS idx_offline_queue_created_at ON offline_queue(created_at);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        Error::Database(e)
    })?;

    info!("Applied migration v1 (offline queue + local settings)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Migration v2: retry scheduling and claim tracking.
///
/// Adds:
/// - `next_retry_at` for exponential backoff
/// - `claimed_at` so a crashed pass's `sent` rows can be recovered
fn migrate_v2(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "offline_queue", "next_retry_at")? {
        conn.execute_batch("ALTER TABLE offline_queue ADD COLUMN next_retry_at INTEGER;")?;
    }
    if !column_exists(conn, "offline_queue", "claimed_at")? {
        conn.execute_batch("ALTER TABLE offline_queue ADD COLUMN claimed_at INTEGER;")?;
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_offline_queue_status_next_retry
            ON offline_queue(status, next_retry_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        Error::Database(e)
    })?;

    info!("Applied migration v2 (retry scheduling + claim tracking)");
    Ok(())
}

// ---------------------------------------------------------------------------
// local_settings helpers
// ---------------------------------------------------------------------------

pub fn get_setting(db: &DbState, category: &str, key: &str) -> Result<Option<String>> {
    let conn = db.lock()?;
    let value = conn
        .query_row(
            "SELECT setting_value FROM local_settings
             WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

pub fn set_setting(db: &DbState, category: &str, key: &str, value: &str) -> Result<()> {
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// In-memory database with all migrations applied.
#[cfg(test)]
pub fn open_in_memory_for_test() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations(&conn).expect("run_migrations should succeed in test");
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
