//! Per-(table, action) apply dispatch used by the drain.
//!
//! An apply function reports `Ok(true)` when the remote store confirmed the
//! write, `Ok(false)` when it declined or is unavailable, and `Err` for
//! transport failures. Apply functions must be idempotent: a record can be
//! applied twice if the local `synced` write loses a race with termination.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::warn;

use crate::mutation::{MutationAction, MutationRecord};

pub type ApplyFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + 'a>>;

/// Replays one record against the remote store.
pub trait ApplyMutation: Send + Sync {
    fn apply<'a>(&'a self, record: &'a MutationRecord) -> ApplyFuture<'a>;
}

impl<T: ApplyMutation + ?Sized> ApplyMutation for Arc<T> {
    fn apply<'a>(&'a self, record: &'a MutationRecord) -> ApplyFuture<'a> {
        (**self).apply(record)
    }
}

type Handler = Arc<dyn Fn(Value) -> ApplyFuture<'static> + Send + Sync>;

/// Routes records to handlers keyed by `(table, action)`.
///
/// Records with no registered route are declined (`Ok(false)`), which stops
/// the current drain pass the same way a remote failure would.
#[derive(Clone, Default)]
pub struct ApplyDispatch {
    routes: HashMap<(String, MutationAction), Handler>,
}

impl ApplyDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. The handler receives the record payload.
    pub fn route<F, Fut>(mut self, table: &str, action: MutationAction, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |payload: Value| -> ApplyFuture<'static> { Box::pin(handler(payload)) });
        self.routes.insert((table.to_string(), action), handler);
        self
    }

    pub fn has_route(&self, table: &str, action: MutationAction) -> bool {
        self.routes.contains_key(&(table.to_string(), action))
    }
}

impl ApplyMutation for ApplyDispatch {
    fn apply<'a>(&'a self, record: &'a MutationRecord) -> ApplyFuture<'a> {
        match self.routes.get(&(record.table.clone(), record.action)) {
            Some(handler) => handler(record.payload.clone()),
            None => {
                warn!(
                    id = %record.id,
                    table = %record.table,
                    action = %record.action,
                    "No apply route registered; leaving mutation pending"
                );
                Box::pin(async { Ok::<bool, anyhow::Error>(false) })
            }
        }
    }
}

/// Test applier that counts calls and fails selected tables.
#[cfg(test)]
pub(crate) struct CountingApplier {
    pub calls: std::sync::atomic::AtomicUsize,
    pub failing_tables: Vec<String>,
}

#[cfg(test)]
impl CountingApplier {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: std::sync::atomic::AtomicUsize::new(0),
            failing_tables: Vec::new(),
        })
    }

    pub fn failing_on(table: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: std::sync::atomic::AtomicUsize::new(0),
            failing_tables: vec![table.to_string()],
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl ApplyMutation for CountingApplier {
    fn apply<'a>(&'a self, record: &'a MutationRecord) -> ApplyFuture<'a> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let ok = !self.failing_tables.contains(&record.table);
        Box::pin(async move { Ok::<bool, anyhow::Error>(ok) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{TABLE_APP_SETTINGS, TABLE_QUOTATIONS};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_dispatch_routes_by_table_and_action() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let dispatch = ApplyDispatch::new().route(
            TABLE_APP_SETTINGS,
            MutationAction::Upsert,
            move |payload| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(payload["install_id"] == "inst-1")
                }
            },
        );

        let settings = MutationRecord::settings_upsert("s1", "inst-1", json!({}));
        assert!(dispatch.apply(&settings).await.unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Same table, different action: no route.
        let mut insert = settings.clone();
        insert.action = MutationAction::Insert;
        assert!(!dispatch.apply(&insert).await.unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unrouted_table_is_declined() {
        let dispatch = ApplyDispatch::new();
        let record = MutationRecord::quotation_insert("q1", json!({}));
        assert!(!dispatch.has_route(TABLE_QUOTATIONS, MutationAction::Insert));
        assert!(!dispatch.apply(&record).await.unwrap());
    }

    #[tokio::test]
    async fn test_handler_errors_propagate() {
        let dispatch = ApplyDispatch::new().route(
            TABLE_QUOTATIONS,
            MutationAction::Insert,
            |_payload| async { Err::<bool, _>(anyhow::anyhow!("connection reset")) },
        );
        let record = MutationRecord::quotation_insert("q1", json!({}));
        let err = dispatch.apply(&record).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }
}
