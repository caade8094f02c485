//! Durable record store for mutation records.
//!
//! Every operation runs on tokio's blocking pool against a SQLite connection,
//! so callers on the async side never stall on local I/O. Each statement is
//! atomic at single-record granularity; nothing holds a lock across an await
//! point, which lets the foreground context and the background worker write to
//! the same file concurrently.

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::db::{self, DbState};
use crate::error::QueueError;
use crate::identity;
use crate::mutation::{now_timestamp, MutationAction, MutationRecord};

const SELECT_COLUMNS: &str = "id, table_name, action, payload, timestamp, synced";

/// Failure bookkeeping kept next to a record. Never used for ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDiagnostics {
    pub attempts: i64,
    pub last_error: Option<String>,
    pub synced_at: Option<String>,
}

/// Handle to the `mutations` collection. Cheap to clone; clones share one
/// connection. Open a second store on the same path for an independent
/// execution context.
#[derive(Clone)]
pub struct MutationStore {
    db: Arc<DbState>,
}

impl MutationStore {
    /// Open `{data_dir}/offline-queue.db`, creating the schema on first use.
    pub fn open(data_dir: &Path) -> Result<Self, QueueError> {
        Ok(Self::from_state(Arc::new(db::init(data_dir)?)))
    }

    pub fn open_path(db_path: &Path) -> Result<Self, QueueError> {
        Ok(Self::from_state(Arc::new(db::open_path(db_path)?)))
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        Ok(Self::from_state(Arc::new(db::open_in_memory()?)))
    }

    pub fn from_state(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db.db_path.clone()
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&Connection) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db.conn.lock().map_err(|_| QueueError::LockPoisoned)?;
            f(&conn)
        })
        .await?
    }

    /// Insert or overwrite a record by id. An overwrite keeps the record's
    /// original position in iteration order. A record that is already synced
    /// is left untouched, so it can never be re-armed for another drain.
    pub async fn put(&self, record: MutationRecord) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&record.payload)?;
        let synced_at = record.synced.then(now_timestamp);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO mutations (id, table_name, action, payload, timestamp, synced, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    table_name = excluded.table_name,
                    action = excluded.action,
                    payload = excluded.payload,
                    timestamp = excluded.timestamp,
                    synced = excluded.synced,
                    synced_at = CASE WHEN excluded.synced = 1
                        THEN COALESCE(mutations.synced_at, excluded.synced_at)
                        ELSE NULL END,
                    updated_at = datetime('now')
                 WHERE mutations.synced = 0",
                params![
                    record.id,
                    record.table,
                    record.action.as_str(),
                    payload,
                    record.timestamp,
                    record.synced,
                    synced_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<MutationRecord>, QueueError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM mutations WHERE id = ?1"),
                    params![id],
                    row_to_record,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    /// Every stored record, synced or not, in insertion order.
    pub async fn get_all(&self) -> Result<Vec<MutationRecord>, QueueError> {
        self.with_conn(load_all).await
    }

    pub async fn count_unsynced(&self) -> Result<usize, QueueError> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM mutations WHERE synced = 0", [], |row| {
                    row.get(0)
                })?;
            Ok(count.max(0) as usize)
        })
        .await
    }

    /// Flip `synced` on one record. Returns `false` when the id is unknown;
    /// no row is created in that case.
    pub async fn set_synced(&self, id: &str) -> Result<bool, QueueError> {
        let id = id.to_string();
        let now = now_timestamp();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE mutations
                 SET synced = 1,
                     synced_at = COALESCE(synced_at, ?2),
                     last_error = NULL,
                     updated_at = datetime('now')
                 WHERE id = ?1",
                params![id, now],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Count a failed apply attempt and keep its error text.
    pub async fn record_failure(&self, id: &str, error: &str) -> Result<(), QueueError> {
        let id = id.to_string();
        let error = error.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE mutations
                 SET attempts = attempts + 1,
                     last_error = ?2,
                     updated_at = datetime('now')
                 WHERE id = ?1 AND synced = 0",
                params![id, error],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn diagnostics(&self, id: &str) -> Result<Option<RecordDiagnostics>, QueueError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let diag = conn
                .query_row(
                    "SELECT attempts, last_error, synced_at FROM mutations WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(RecordDiagnostics {
                            attempts: row.get(0)?,
                            last_error: row.get(1)?,
                            synced_at: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(diag)
        })
        .await
    }

    /// Delete synced records confirmed before `cutoff` (RFC 3339, UTC).
    /// Un-synced records are never touched.
    pub async fn delete_synced_before(&self, cutoff: String) -> Result<usize, QueueError> {
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM mutations
                 WHERE synced = 1 AND synced_at IS NOT NULL AND synced_at < ?1",
                params![cutoff],
            )?;
            Ok(removed)
        })
        .await
    }

    /// The persisted install identity, created on first call.
    pub async fn install_id(&self) -> Result<String, QueueError> {
        self.with_conn(identity::get_or_create_install_id).await
    }

    /// Start a read-all/mutate/write-back pass.
    ///
    /// The snapshot is taken once; records enqueued afterwards are picked up
    /// by the next pass.
    pub async fn begin_pass(&self) -> Result<DrainPass, QueueError> {
        let records = self.get_all().await?;
        debug!(records = records.len(), "drain pass opened");
        Ok(DrainPass {
            store: self.clone(),
            records,
        })
    }
}

/// A snapshot of the store plus per-record write-back.
///
/// Each `mark_synced` is persisted before it returns, so progress survives a
/// crash part-way through the pass.
pub struct DrainPass {
    store: MutationStore,
    records: Vec<MutationRecord>,
}

impl DrainPass {
    pub fn records(&self) -> &[MutationRecord] {
        &self.records
    }

    pub async fn mark_synced(&self, id: &str) -> Result<bool, QueueError> {
        self.store.set_synced(id).await
    }

    pub async fn record_failure(&self, id: &str, error: &str) -> Result<(), QueueError> {
        self.store.record_failure(id, error).await
    }

    pub fn commit(self) {
        debug!(records = self.records.len(), "drain pass committed");
    }
}

fn load_all(conn: &Connection) -> Result<Vec<MutationRecord>, QueueError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM mutations ORDER BY rowid ASC"
    ))?;
    let rows = stmt.query_map([], row_to_record)?;
    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MutationRecord> {
    let action_raw: String = row.get(2)?;
    let action = action_raw
        .parse::<MutationAction>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let payload_raw: String = row.get(3)?;
    let payload = serde_json::from_str(&payload_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(MutationRecord {
        id: row.get(0)?,
        table: row.get(1)?,
        action,
        payload,
        timestamp: row.get(4)?,
        synced: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationAction;
    use serde_json::json;

    fn record(id: &str, table: &str) -> MutationRecord {
        MutationRecord::new(id, table, MutationAction::Insert, json!({ "ref": id }))
    }

    fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("pos_sync_store_{label}_{}", uuid::Uuid::new_v4()))
            .join(db::DB_FILE_NAME)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = MutationStore::open_in_memory().unwrap();
        let original = record("m-1", "quotations");
        store.put(original.clone()).await.unwrap();

        let loaded = store.get("m-1").await.unwrap().expect("record present");
        assert_eq!(loaded, original);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_all_keeps_insertion_order_across_overwrites() {
        let store = MutationStore::open_in_memory().unwrap();
        for id in ["z", "a", "m"] {
            store.put(record(id, "sales_transactions")).await.unwrap();
        }
        let mut overwritten = record("z", "sales_transactions");
        overwritten.payload = json!({ "ref": "z", "rev": 2 });
        store.put(overwritten).await.unwrap();

        let ids: Vec<String> = store
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["z", "a", "m"]);
        assert_eq!(store.get("z").await.unwrap().unwrap().payload["rev"], 2);
    }

    #[tokio::test]
    async fn test_set_synced_unknown_id_creates_nothing() {
        let store = MutationStore::open_in_memory().unwrap();
        assert!(!store.set_synced("ghost").await.unwrap());
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_bookkeeping_cleared_on_sync() {
        let store = MutationStore::open_in_memory().unwrap();
        store.put(record("m-1", "quotations")).await.unwrap();
        store.record_failure("m-1", "HTTP 503").await.unwrap();
        store.record_failure("m-1", "HTTP 502").await.unwrap();

        let diag = store.diagnostics("m-1").await.unwrap().unwrap();
        assert_eq!(diag.attempts, 2);
        assert_eq!(diag.last_error.as_deref(), Some("HTTP 502"));
        assert!(diag.synced_at.is_none());

        assert!(store.set_synced("m-1").await.unwrap());
        let diag = store.diagnostics("m-1").await.unwrap().unwrap();
        assert_eq!(diag.attempts, 2);
        assert!(diag.last_error.is_none());
        assert!(diag.synced_at.is_some());
    }

    #[tokio::test]
    async fn test_two_connections_share_one_file() {
        let path = temp_db_path("shared");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let foreground = MutationStore::open_path(&path).unwrap();
        let background = MutationStore::open_path(&path).unwrap();

        foreground.put(record("fg-1", "quotations")).await.unwrap();
        assert!(background.set_synced("fg-1").await.unwrap());
        assert!(foreground.get("fg-1").await.unwrap().unwrap().synced);
        assert_eq!(foreground.count_unsynced().await.unwrap(), 0);

        drop(foreground);
        drop(background);
        db::remove_db_files(&path);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn test_pass_snapshot_ignores_later_writers() {
        let store = MutationStore::open_in_memory().unwrap();
        store.put(record("before", "quotations")).await.unwrap();

        let pass = store.begin_pass().await.unwrap();
        store.put(record("after", "quotations")).await.unwrap();
        assert_eq!(pass.records().len(), 1);
        assert!(pass.mark_synced("before").await.unwrap());
        pass.commit();

        assert_eq!(store.count_unsynced().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_synced_before_spares_pending() {
        let store = MutationStore::open_in_memory().unwrap();
        store.put(record("old-synced", "quotations")).await.unwrap();
        store.put(record("pending", "quotations")).await.unwrap();
        store.set_synced("old-synced").await.unwrap();

        let removed = store
            .delete_synced_before("9999-12-31T23:59:59.999Z".into())
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let remaining = store.get_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "pending");
    }

    #[tokio::test]
    async fn test_put_never_rearms_synced_record() {
        let store = MutationStore::open_in_memory().unwrap();
        store.put(record("m-1", "quotations")).await.unwrap();
        assert!(store.set_synced("m-1").await.unwrap());
        let synced_at = store.diagnostics("m-1").await.unwrap().unwrap().synced_at;

        let mut again = record("m-1", "quotations");
        again.payload = json!({ "ref": "m-1", "rev": 2 });
        store.put(again).await.unwrap();

        let loaded = store.get("m-1").await.unwrap().unwrap();
        assert!(loaded.synced);
        assert_ne!(loaded.payload["rev"], 2);
        assert_eq!(store.count_unsynced().await.unwrap(), 0);
        assert_eq!(
            store.diagnostics("m-1").await.unwrap().unwrap().synced_at,
            synced_at
        );
    }
}
