//! Write-through with an offline fallback.
//!
//! Callers try the remote right away when online. Anything that does not
//! confirm (a decline, an error, or being offline) goes into the queue so the
//! next drain replays it.

use tracing::{debug, warn};

use crate::apply::ApplyMutation;
use crate::error::QueueError;
use crate::mutation::MutationRecord;
use crate::queue::MutationQueue;

#[derive(Debug)]
pub enum SaveOutcome {
    /// Confirmed by the remote; nothing was queued.
    AppliedRemotely,
    /// Durably queued for a later drain.
    QueuedLocally,
    /// Neither applied nor queued. The change is not persisted anywhere.
    Failed(QueueError),
}

impl SaveOutcome {
    /// Whether the change is safe: applied or queued.
    pub fn is_persisted(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

pub async fn save_with_fallback(
    queue: &MutationQueue,
    applier: &dyn ApplyMutation,
    online: bool,
    record: MutationRecord,
) -> SaveOutcome {
    if let Err(e) = record.validate() {
        return SaveOutcome::Failed(e);
    }

    if online {
        match applier.apply(&record).await {
            Ok(true) => {
                debug!(id = %record.id, table = %record.table, "applied remotely");
                return SaveOutcome::AppliedRemotely;
            }
            Ok(false) => {
                debug!(id = %record.id, table = %record.table, "remote declined; queueing");
            }
            Err(e) => {
                warn!(id = %record.id, table = %record.table, "remote write failed, queueing: {e:#}");
            }
        }
    }

    let id = record.id.clone();
    match queue.enqueue_mutation(record).await {
        Ok(()) => SaveOutcome::QueuedLocally,
        Err(e) => {
            warn!(id = %id, "could not queue mutation: {e}");
            SaveOutcome::Failed(e)
        }
    }
}
