//! Drain processor: sequential replay of pending mutations.
//!
//! One pass loads every record, skips the synced ones, and applies the rest
//! one at a time. Success is persisted immediately. The first failure (an
//! `Err` or an `Ok(false)`) ends the pass: a failing backend is treated as
//! unavailable rather than hammered with every remaining record. Skipped
//! records stay pending for the next trigger.

use serde::Serialize;
use std::future::Future;
use tracing::{debug, info, warn};

use crate::apply::ApplyMutation;
use crate::error::QueueError;
use crate::mutation::MutationRecord;
use crate::store::{DrainPass, MutationStore};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Records handed to `apply` in this pass.
    pub attempted: usize,
    /// Records confirmed and marked synced.
    pub synced: usize,
    /// Already-synced records passed over.
    pub skipped: usize,
    /// Id of the record whose failure ended the pass.
    pub stopped_at: Option<String>,
}

impl DrainReport {
    pub fn completed(&self) -> bool {
        self.stopped_at.is_none()
    }
}

/// Replay pending records through a caller-supplied apply closure.
///
/// Store faults propagate; apply faults only stop the pass.
pub async fn drain_queue<F, Fut>(
    store: &MutationStore,
    mut apply: F,
) -> Result<DrainReport, QueueError>
where
    F: FnMut(&MutationRecord) -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let pass = store.begin_pass().await?;
    let mut report = DrainReport::default();

    for record in pass.records() {
        if record.synced {
            report.skipped += 1;
            continue;
        }
        report.attempted += 1;
        let outcome = apply(record).await;
        if !settle(&pass, record, outcome, &mut report).await? {
            break;
        }
    }

    finish(pass, report)
}

/// Same pass, driven by an [`ApplyMutation`] implementation.
pub async fn drain_with(
    store: &MutationStore,
    applier: &dyn ApplyMutation,
) -> Result<DrainReport, QueueError> {
    drain_queue(store, |record| {
        let record = record.clone();
        async move { applier.apply(&record).await }
    })
    .await
}

/// Persist one apply outcome. Returns whether the pass should continue.
async fn settle(
    pass: &DrainPass,
    record: &MutationRecord,
    outcome: anyhow::Result<bool>,
    report: &mut DrainReport,
) -> Result<bool, QueueError> {
    let error = match outcome {
        Ok(true) => {
            pass.mark_synced(&record.id).await?;
            report.synced += 1;
            debug!(id = %record.id, table = %record.table, "mutation synced");
            return Ok(true);
        }
        Ok(false) => "apply declined".to_string(),
        Err(e) => format!("{e:#}"),
    };

    warn!(
        id = %record.id,
        table = %record.table,
        action = %record.action,
        error = %error,
        "drain stopped on failed mutation; remaining records stay pending"
    );
    pass.record_failure(&record.id, &error).await?;
    report.stopped_at = Some(record.id.clone());
    Ok(false)
}

fn finish(pass: DrainPass, report: DrainReport) -> Result<DrainReport, QueueError> {
    pass.commit();
    if report.attempted > 0 {
        info!(
            attempted = report.attempted,
            synced = report.synced,
            stopped = report.stopped_at.is_some(),
            "Drain pass complete"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::ApplyDispatch;
    use crate::mutation::{
        MutationAction, TABLE_APP_SETTINGS, TABLE_QUOTATIONS, TABLE_SALES_TRANSACTIONS,
    };
    use crate::queue::MutationQueue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn queue_with(ids: &[&str]) -> MutationQueue {
        let queue = MutationQueue::new(MutationStore::open_in_memory().unwrap());
        for id in ids {
            queue
                .enqueue_mutation(MutationRecord::sales_transaction_insert(
                    *id,
                    json!({ "trans_id": id }),
                ))
                .await
                .unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn test_always_succeeding_apply_syncs_everything() {
        let queue = queue_with(&["t1", "t2", "t3"]).await;

        let report = drain_queue(queue.store(), |_m| async { anyhow::Ok(true) })
            .await
            .unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.synced, 3);
        assert!(report.completed());

        assert_eq!(queue.get_pending_count().await.unwrap(), 0);
        assert!(queue
            .get_pending_mutations()
            .await
            .unwrap()
            .iter()
            .all(|m| m.synced));
    }

    #[tokio::test]
    async fn test_failure_on_nth_record_stops_pass_then_resumes() {
        let queue = queue_with(&["t1", "t2", "t3", "t4"]).await;

        // Fails on the 3rd record processed.
        let mut calls = 0;
        let report = drain_queue(queue.store(), |_m| {
            calls += 1;
            let ok = calls != 3;
            async move { anyhow::Ok(ok) }
        })
        .await
        .unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.synced, 2);
        assert_eq!(report.stopped_at.as_deref(), Some("t3"));

        let all = queue.get_pending_mutations().await.unwrap();
        let synced: Vec<bool> = all.iter().map(|m| m.synced).collect();
        assert_eq!(synced, vec![true, true, false, false]);

        let diag = queue.store().diagnostics("t3").await.unwrap().unwrap();
        assert_eq!(diag.attempts, 1);
        assert_eq!(diag.last_error.as_deref(), Some("apply declined"));

        let report = drain_queue(queue.store(), |_m| async { anyhow::Ok(true) })
            .await
            .unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(queue.get_pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_apply_error_stops_pass_without_escalating() {
        let queue = queue_with(&["t1", "t2"]).await;

        let report = drain_queue(queue.store(), |_m| async {
            Err::<bool, _>(anyhow::anyhow!("backend unreachable"))
        })
        .await
        .expect("apply errors are not store errors");
        assert_eq!(report.attempted, 1);
        assert_eq!(report.synced, 0);
        assert_eq!(report.stopped_at.as_deref(), Some("t1"));
        assert_eq!(queue.get_pending_count().await.unwrap(), 2);

        let diag = queue.store().diagnostics("t1").await.unwrap().unwrap();
        assert!(diag.last_error.unwrap().contains("backend unreachable"));
    }

    #[tokio::test]
    async fn test_second_drain_after_full_success_applies_nothing() {
        let queue = queue_with(&["t1", "t2"]).await;
        let calls = AtomicUsize::new(0);

        drain_queue(queue.store(), |_m| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::Ok(true) }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let report = drain_queue(queue.store(), |_m| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::Ok(true) }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2, "second pass must not apply");
        assert_eq!(report.attempted, 0);
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn test_reenqueued_synced_record_is_not_replayed() {
        let queue = queue_with(&["t1"]).await;
        let calls = AtomicUsize::new(0);

        drain_queue(queue.store(), |_m| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::Ok(true) }
        })
        .await
        .unwrap();

        queue
            .enqueue_mutation(MutationRecord::sales_transaction_insert(
                "t1",
                json!({ "trans_id": "t1" }),
            ))
            .await
            .unwrap();
        assert_eq!(queue.get_pending_count().await.unwrap(), 0);

        let report = drain_queue(queue.store(), |_m| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::Ok(true) }
        })
        .await
        .unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_table_specific_failure_leaves_only_that_record_pending() {
        let queue = MutationQueue::new(MutationStore::open_in_memory().unwrap());
        queue
            .enqueue_mutation(MutationRecord::new(
                "a",
                TABLE_APP_SETTINGS,
                MutationAction::Upsert,
                json!({ "install_id": "inst-1", "settings": { "currency": "KES" } }),
            ))
            .await
            .unwrap();
        queue
            .enqueue_mutation(MutationRecord::new(
                "b",
                TABLE_SALES_TRANSACTIONS,
                MutationAction::Insert,
                json!({ "trans_id": "T-1", "total_amount": 116.0 }),
            ))
            .await
            .unwrap();

        drain_queue(queue.store(), |m| {
            let ok = m.table != TABLE_SALES_TRANSACTIONS;
            async move { anyhow::Ok(ok) }
        })
        .await
        .unwrap();

        assert!(queue.store().get("a").await.unwrap().unwrap().synced);
        assert!(!queue.store().get("b").await.unwrap().unwrap().synced);
        assert_eq!(queue.get_pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_with_dispatch() {
        let queue = queue_with(&["t1"]).await;
        queue
            .enqueue_mutation(MutationRecord::quotation_insert("q1", json!({})))
            .await
            .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let dispatch = ApplyDispatch::new().route(
            TABLE_SALES_TRANSACTIONS,
            MutationAction::Insert,
            move |_payload| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { anyhow::Ok(true) }
            },
        );

        // Quotations have no route, so the pass stops there.
        let report = drain_with(queue.store(), &dispatch).await.unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(report.stopped_at.as_deref(), Some("q1"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!queue.store().get("q1").await.unwrap().unwrap().synced);
        assert!(!dispatch.has_route(TABLE_QUOTATIONS, MutationAction::Insert));
    }
}
