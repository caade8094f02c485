//! Local SQLite database layer for the offline queue.
//!
//! Uses rusqlite with WAL mode so the foreground context and the background
//! worker can each hold their own connection to the same file. Provides schema
//! migrations, settings helpers, and the connection state shared by the store.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::QueueError;

/// File name of the queue database inside the data directory.
pub const DB_FILE_NAME: &str = "offline-queue.db";

/// An open connection plus the path it was opened from.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/offline-queue.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas, and
/// runs any pending migrations. Opening an existing database never resets it.
pub fn init(data_dir: &Path) -> Result<DbState, QueueError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| QueueError::Migration(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    open_path(&db_path)
}

/// Open (or create) a database at an explicit file path.
pub fn open_path(db_path: &Path) -> Result<DbState, QueueError> {
    info!("Opening queue database at {}", db_path.display());

    let conn = open_and_configure(db_path)?;
    run_migrations(&conn)?;

    info!("Queue database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: db_path.to_path_buf(),
    })
}

/// Open a private in-memory database with the full schema applied.
pub fn open_in_memory() -> Result<DbState, QueueError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, QueueError> {
    let conn = Connection::open(path)?;

    // WAL lets a reader and a writer from different contexts proceed together;
    // busy_timeout absorbs short write contention between them.
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| QueueError::Migration(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Queue schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating queue database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings store and the mutation collection keyed by id.
fn migrate_v1(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- mutations (one row per replayable write; rowid keeps insertion order)
        CREATE TABLE IF NOT EXISTS mutations (
            id TEXT PRIMARY KEY NOT NULL,
            table_name TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('insert', 'upsert', 'delete')),
            payload TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_mutations_synced ON mutations(synced);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        QueueError::Migration(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, QueueError> {
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

/// Migration v2: per-record failure diagnostics.
///
/// Adds:
/// - `attempts` counting failed apply attempts
/// - `last_error` with the most recent failure text
/// - `synced_at` stamped when the record is confirmed remotely
fn migrate_v2(conn: &Connection) -> Result<(), QueueError> {
    if !column_exists(conn, "mutations", "attempts")? {
        conn.execute_batch("ALTER TABLE mutations ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;")
            .map_err(|e| QueueError::Migration(format!("migration v2 add attempts: {e}")))?;
    }

    if !column_exists(conn, "mutations", "last_error")? {
        conn.execute_batch("ALTER TABLE mutations ADD COLUMN last_error TEXT;")
            .map_err(|e| QueueError::Migration(format!("migration v2 add last_error: {e}")))?;
    }

    if !column_exists(conn, "mutations", "synced_at")? {
        conn.execute_batch("ALTER TABLE mutations ADD COLUMN synced_at TEXT;")
            .map_err(|e| QueueError::Migration(format!("migration v2 add synced_at: {e}")))?;
    }

    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_mutations_synced_at ON mutations(synced, synced_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        QueueError::Migration(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (mutation failure diagnostics)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), QueueError> {
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

/// Insert a setting only when the key is absent; returns the stored value.
///
/// Two connections racing to create the same key both read back the winner.
pub fn get_or_insert_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<String, QueueError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(setting_category, setting_key) DO NOTHING",
        params![category, key, value],
    )?;
    let stored = conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )?;
    Ok(stored)
}

/// Remove a database file and its WAL/SHM companions. Missing files are fine.
pub fn remove_db_files(db_path: &Path) {
    for path in [
        db_path.to_path_buf(),
        db_path.with_extension("db-wal"),
        db_path.with_extension("db-shm"),
    ] {
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove {}: {e}", path.display());
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
