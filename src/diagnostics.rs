//! Diagnostics for the sync engine.
//!
//! - **Logging**: console plus daily rolling file under `<data_dir>/logs`.
//! - **Log rotation helpers**: keep the newest `MAX_LOG_FILES` files.
//! - **Queue health**: backlog and failure counts for a status screen or a
//!   support bundle.

use rusqlite::params;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::QueueError;
use crate::store::MutationStore;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Rolling log file prefix (`sync.2026-10-19`, ...).
pub const LOG_FILE_PREFIX: &str = "sync";

const DEFAULT_FILTER: &str = "info,pos_offline_sync=debug";

pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let prefix = format!("{LOG_FILE_PREFIX}.");
    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(&prefix));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

/// Install the global subscriber: `RUST_LOG` (or the default filter), a
/// console layer and a daily rolling file in `log_dir`.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the file writer.
pub fn init_logging(log_dir: &Path) -> Result<WorkerGuard, TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    prune_old_logs(log_dir);
    if let Err(e) = fs::create_dir_all(log_dir) {
        eprintln!("cannot create log dir {}: {e}", log_dir.display());
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(guard)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub schema_version: i32,
    pub total: usize,
    pub pending: usize,
    /// Pending records that have failed at least once.
    pub failing: usize,
    pub oldest_pending: Option<String>,
    pub last_error: Option<String>,
}

/// Snapshot of the queue for a status screen.
pub async fn queue_health(store: &MutationStore) -> Result<QueueHealth, QueueError> {
    store
        .with_conn(|conn| {
            let schema_version: i32 = conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )?;
            let (total, pending, failing, oldest_pending): (i64, i64, i64, Option<String>) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(CASE WHEN synced = 0 THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN synced = 0 AND attempts > 0 THEN 1 ELSE 0 END), 0),
                            MIN(CASE WHEN synced = 0 THEN timestamp END)
                     FROM mutations",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;
            let last_error: Option<String> = conn
                .query_row(
                    "SELECT last_error FROM mutations
                     WHERE synced = 0 AND last_error IS NOT NULL
                     ORDER BY updated_at DESC LIMIT 1",
                    params![],
                    |row| row.get(0),
                )
                .ok();

            Ok(QueueHealth {
                schema_version,
                total: total as usize,
                pending: pending as usize,
                failing: failing as usize,
                oldest_pending,
                last_error,
            })
        })
        .await
}
