//! Queue API over the durable store.
//!
//! Naming note: `get_pending_mutations` returns every stored record, synced or
//! not. It is the raw view. `get_unsynced_mutations` and `get_pending_count`
//! are the filtered views.

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info};

use crate::error::QueueError;
use crate::mutation::MutationRecord;
use crate::store::MutationStore;

#[derive(Clone)]
pub struct MutationQueue {
    store: MutationStore,
}

impl MutationQueue {
    pub fn new(store: MutationStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MutationStore {
        &self.store
    }

    /// Persist a mutation so the next drain can replay it.
    ///
    /// Storage faults are returned to the caller; a mutation is never dropped
    /// silently.
    pub async fn enqueue_mutation(&self, record: MutationRecord) -> Result<(), QueueError> {
        record.validate()?;
        debug!(
            id = %record.id,
            table = %record.table,
            action = %record.action,
            "enqueue mutation"
        );
        self.store.put(record).await
    }

    /// Every stored record regardless of `synced`.
    pub async fn get_pending_mutations(&self) -> Result<Vec<MutationRecord>, QueueError> {
        self.store.get_all().await
    }

    /// Only records still waiting for a successful remote apply.
    pub async fn get_unsynced_mutations(&self) -> Result<Vec<MutationRecord>, QueueError> {
        let all = self.store.get_all().await?;
        Ok(all.into_iter().filter(|m| !m.synced).collect())
    }

    /// Number of unsynced records. Advisory (badge) value only.
    pub async fn get_pending_count(&self) -> Result<usize, QueueError> {
        self.store.count_unsynced().await
    }

    /// Mark one record synced. Unknown ids are ignored.
    pub async fn mark_synced(&self, id: &str) -> Result<(), QueueError> {
        if !self.store.set_synced(id).await? {
            debug!(id, "mark_synced: no such mutation");
        }
        Ok(())
    }

    /// Delete synced records confirmed before `older_than`. Pending records
    /// are kept. Retention is the caller's call; nothing prunes on its own.
    pub async fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<usize, QueueError> {
        let cutoff = older_than.to_rfc3339_opts(SecondsFormat::Millis, true);
        let removed = self.store.delete_synced_before(cutoff).await?;
        if removed > 0 {
            info!(removed, "Pruned synced mutations");
        }
        Ok(removed)
    }
}
