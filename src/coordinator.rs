//! Sync trigger coordinator.
//!
//! Decides when the queue is drained. Drain triggers are: an offline→online
//! transition, an explicit request, and a `SYNC_MUTATIONS` message from the
//! bridge. Each trigger first tries a deferred background registration and
//! falls back to a direct in-process drain when the capability is missing or
//! refuses. A periodic tick refreshes the published pending count and never
//! drains.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::apply::ApplyMutation;
use crate::bridge::{BackgroundRegistrar, BridgeMessage};
use crate::config::{DEFAULT_BACKGROUND_SYNC_TAG, DEFAULT_COUNT_REFRESH_SECS};
use crate::drain::{self, DrainReport};
use crate::error::QueueError;
use crate::store::MutationStore;

const COMMAND_QUEUE_BOUND: usize = 64;

/// Advisory state for UI indicators. Never used for correctness decisions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub pending: usize,
    pub online: bool,
    pub syncing: bool,
    pub last_sync: Option<String>,
}

enum Command {
    Request { reason: String },
    Bridge(BridgeMessage),
    ForceSync {
        resp: oneshot::Sender<Result<DrainReport, QueueError>>,
    },
}

/// Foreground-side handle to the coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    // Unbounded: a connectivity change is never dropped, even while a slow
    // drain keeps the command queue full.
    connectivity: mpsc::UnboundedSender<bool>,
    online: Arc<watch::Sender<bool>>,
    status: watch::Receiver<SyncStatus>,
}

impl CoordinatorHandle {
    /// Feed a platform connectivity signal. Going from offline to online
    /// triggers a drain.
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
        if self.connectivity.send(online).is_err() {
            debug!("coordinator stopped; connectivity change ignored");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Ask for a drain (user action, settings save, ...).
    pub fn request_sync(&self, reason: &str) {
        self.send(Command::Request {
            reason: reason.to_string(),
        });
    }

    /// Hand the coordinator a message from the other execution context.
    pub fn deliver(&self, message: BridgeMessage) {
        self.send(Command::Bridge(message));
    }

    /// Run a direct drain now and return its report.
    pub async fn force_sync(&self) -> Result<DrainReport, QueueError> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(Command::ForceSync { resp })
            .await
            .map_err(|_| QueueError::ChannelClosed)?;
        rx.await.map_err(|_| QueueError::ChannelClosed)?
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Last published unsynced count.
    pub fn pending_count(&self) -> usize {
        self.status.borrow().pending
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    fn send(&self, command: Command) {
        // Triggers are advisory; a full or closed queue only loses a nudge.
        if let Err(e) = self.commands.try_send(command) {
            debug!("coordinator trigger dropped: {e}");
        }
    }
}

/// Builder and task state for the coordinator.
pub struct SyncCoordinator {
    store: MutationStore,
    applier: Arc<dyn ApplyMutation>,
    online_tx: Arc<watch::Sender<bool>>,
    registrar: Option<Arc<dyn BackgroundRegistrar>>,
    bridge_events: Option<broadcast::Receiver<BridgeMessage>>,
    tag: String,
    count_refresh: Duration,
}

impl SyncCoordinator {
    pub fn new(
        store: MutationStore,
        applier: Arc<dyn ApplyMutation>,
        online: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            store,
            applier,
            online_tx: online,
            registrar: None,
            bridge_events: None,
            tag: DEFAULT_BACKGROUND_SYNC_TAG.to_string(),
            count_refresh: Duration::from_secs(DEFAULT_COUNT_REFRESH_SECS),
        }
    }

    /// Use a background registration capability, and listen to its
    /// notifications when it has any.
    pub fn with_registrar(
        mut self,
        registrar: Arc<dyn BackgroundRegistrar>,
        events: Option<broadcast::Receiver<BridgeMessage>>,
    ) -> Self {
        self.registrar = Some(registrar);
        self.bridge_events = events;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_count_refresh(mut self, every: Duration) -> Self {
        self.count_refresh = every;
        self
    }

    pub fn spawn(self, cancel: CancellationToken, tracker: &TaskTracker) -> CoordinatorHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_BOUND);
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let online = *self.online_tx.borrow();
        let (status_tx, status_rx) = watch::channel(SyncStatus {
            online,
            ..SyncStatus::default()
        });

        let handle = CoordinatorHandle {
            commands: cmd_tx,
            connectivity: net_tx,
            online: Arc::clone(&self.online_tx),
            status: status_rx,
        };

        let task = CoordinatorTask {
            store: self.store,
            applier: self.applier,
            registrar: self.registrar,
            tag: self.tag,
            online,
            status: status_tx,
        };
        tracker.spawn(task.run(
            cmd_rx,
            net_rx,
            self.bridge_events,
            self.count_refresh,
            cancel,
        ));

        handle
    }
}

struct CoordinatorTask {
    store: MutationStore,
    applier: Arc<dyn ApplyMutation>,
    registrar: Option<Arc<dyn BackgroundRegistrar>>,
    tag: String,
    online: bool,
    status: watch::Sender<SyncStatus>,
}

impl CoordinatorTask {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut connectivity: mpsc::UnboundedReceiver<bool>,
        mut bridge_events: Option<broadcast::Receiver<BridgeMessage>>,
        count_refresh: Duration,
        cancel: CancellationToken,
    ) {
        info!(
            online = self.online,
            background = self.registrar.is_some(),
            "Sync coordinator started"
        );

        let mut ticker = tokio::time::interval(count_refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(online) = connectivity.recv() => self.on_connectivity(online).await,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                event = recv_bridge(&mut bridge_events) => match event {
                    Ok(message) => self.on_bridge_message(message).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "bridge notifications lagged; refreshing count");
                        self.refresh_count().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("bridge notification channel closed");
                        bridge_events = None;
                    }
                },
                _ = ticker.tick() => self.refresh_count().await,
            }
        }

        info!("Sync coordinator stopped");
    }

    async fn on_connectivity(&mut self, online: bool) {
        let was_online = self.online;
        self.online = online;
        self.status.send_modify(|s| s.online = online);
        if online && !was_online {
            info!("Network restored; resuming queued sync");
            self.trigger("came online").await;
        } else if !online && was_online {
            info!("Network offline; keeping queue pending");
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Request { reason } => self.trigger(&reason).await,
            Command::Bridge(message) => self.on_bridge_message(message).await,
            Command::ForceSync { resp } => {
                let result = self.direct_drain().await;
                let _ = resp.send(result);
            }
        }
    }

    async fn on_bridge_message(&mut self, message: BridgeMessage) {
        match message {
            BridgeMessage::SyncMutations => {
                // The other context asked this one to drain.
                if self.online {
                    let _ = self.direct_drain().await;
                } else {
                    debug!("SYNC_MUTATIONS while offline; deferred");
                }
            }
            BridgeMessage::SyncStarted => {
                self.status.send_modify(|s| s.syncing = true);
            }
            BridgeMessage::SyncComplete => {
                let now = Utc::now().to_rfc3339();
                self.status.send_modify(|s| {
                    s.syncing = false;
                    s.last_sync = Some(now);
                });
                self.refresh_count().await;
            }
        }
    }

    /// Prefer a deferred registration; fall back to a direct drain.
    async fn trigger(&mut self, reason: &str) {
        if let Some(registrar) = &self.registrar {
            match registrar.register_sync(&self.tag) {
                Ok(()) => {
                    debug!(reason, tag = %self.tag, "background sync registered");
                    return;
                }
                Err(e) => {
                    warn!(reason, "background sync registration failed ({e}); draining directly");
                }
            }
        }

        if !self.online {
            debug!(reason, "offline; drain deferred until connectivity returns");
            return;
        }

        if let Err(e) = self.direct_drain().await {
            warn!(reason, "direct drain failed: {e}");
        }
    }

    async fn direct_drain(&mut self) -> Result<DrainReport, QueueError> {
        self.status.send_modify(|s| s.syncing = true);
        let result = drain::drain_with(&self.store, &*self.applier).await;
        let finished = result.is_ok().then(|| Utc::now().to_rfc3339());
        self.status.send_modify(|s| {
            s.syncing = false;
            if finished.is_some() {
                s.last_sync = finished;
            }
        });
        self.refresh_count().await;
        result
    }

    /// Read-only: publishes the unsynced count.
    async fn refresh_count(&mut self) {
        match self.store.count_unsynced().await {
            Ok(pending) => {
                self.status.send_if_modified(|s| {
                    let changed = s.pending != pending;
                    s.pending = pending;
                    changed
                });
            }
            Err(e) => warn!("pending count refresh failed: {e}"),
        }
    }
}

/// Pending forever when there is no bridge to listen to.
async fn recv_bridge(
    events: &mut Option<broadcast::Receiver<BridgeMessage>>,
) -> Result<BridgeMessage, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{ApplyFuture, CountingApplier};
    use crate::bridge::{BackgroundWorker, Unsupported};
    use crate::mutation::MutationRecord;
    use crate::queue::MutationQueue;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    /// Applier that holds every call until the gate opens.
    struct GatedApplier {
        gate: watch::Receiver<bool>,
        calls: AtomicUsize,
    }

    impl ApplyMutation for GatedApplier {
        fn apply<'a>(&'a self, _record: &'a MutationRecord) -> ApplyFuture<'a> {
            Box::pin(async move {
                let mut gate = self.gate.clone();
                let opened = gate.wait_for(|open| *open).await.is_ok();
                if !opened {
                    anyhow::bail!("gate dropped");
                }
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok::<bool, anyhow::Error>(true)
            })
        }
    }

    struct Harness {
        queue: MutationQueue,
        applier: Arc<CountingApplier>,
        online: Arc<watch::Sender<bool>>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    }

    impl Harness {
        fn new(online: bool) -> Self {
            let (tx, _rx) = watch::channel(online);
            Self {
                queue: MutationQueue::new(MutationStore::open_in_memory().unwrap()),
                applier: CountingApplier::succeeding(),
                online: Arc::new(tx),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }
        }

        fn coordinator(&self) -> SyncCoordinator {
            SyncCoordinator::new(
                self.queue.store().clone(),
                self.applier.clone(),
                Arc::clone(&self.online),
            )
        }

        async fn enqueue(&self, ids: &[&str]) {
            for id in ids {
                self.queue
                    .enqueue_mutation(MutationRecord::sales_transaction_insert(*id, json!({})))
                    .await
                    .unwrap();
            }
        }

        async fn shutdown(self) {
            self.cancel.cancel();
            self.tracker.close();
            self.tracker.wait().await;
        }
    }

    async fn wait_until(
        status: &mut watch::Receiver<SyncStatus>,
        pred: impl FnMut(&SyncStatus) -> bool,
    ) -> SyncStatus {
        timeout(Duration::from_secs(5), status.wait_for(pred))
            .await
            .expect("status within timeout")
            .expect("coordinator alive")
            .clone()
    }

    #[tokio::test]
    async fn test_offline_to_online_drains_pending_records() {
        let h = Harness::new(true);
        let handle = h.coordinator().spawn(h.cancel.clone(), &h.tracker);
        let mut status = handle.status();

        handle.set_online(false);
        h.enqueue(&["t1", "t2"]).await;
        handle.set_online(true);

        let settled = wait_until(&mut status, |s| s.last_sync.is_some() && !s.syncing).await;
        assert_eq!(settled.pending, 0);
        assert!(settled.online);
        assert_eq!(h.applier.calls(), 2);
        assert_eq!(h.queue.get_pending_count().await.unwrap(), 0);

        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_while_offline_without_registrar_is_deferred() {
        let h = Harness::new(false);
        h.enqueue(&["t1"]).await;
        let handle = h.coordinator().spawn(h.cancel.clone(), &h.tracker);
        let mut status = handle.status();

        handle.request_sync("user tapped sync");
        let counted = wait_until(&mut status, |s| s.pending == 1).await;
        assert!(counted.last_sync.is_none());
        assert_eq!(h.applier.calls(), 0);

        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_refused_registration_falls_back_to_direct_drain() {
        let h = Harness::new(true);
        h.enqueue(&["t1"]).await;
        let handle = h
            .coordinator()
            .with_registrar(Arc::new(Unsupported), None)
            .spawn(h.cancel.clone(), &h.tracker);

        let mut status = handle.status();
        handle.request_sync("settings saved");
        let settled = wait_until(&mut status, |s| s.last_sync.is_some()).await;
        assert_eq!(settled.pending, 0);
        assert_eq!(h.applier.calls(), 1);

        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_registration_routes_through_background_worker() {
        let h = Harness::new(true);
        let worker_applier = CountingApplier::succeeding();
        let worker = BackgroundWorker::spawn(
            h.queue.store().clone(),
            worker_applier.clone(),
            h.online.subscribe(),
            h.cancel.clone(),
            &h.tracker,
        );
        let handle = h
            .coordinator()
            .with_registrar(Arc::new(worker.clone()), Some(worker.subscribe()))
            .spawn(h.cancel.clone(), &h.tracker);
        let mut status = handle.status();

        handle.set_online(false);
        h.enqueue(&["t1", "t2"]).await;
        handle.set_online(true);

        let settled = wait_until(&mut status, |s| s.last_sync.is_some() && s.pending == 0).await;
        assert!(!settled.syncing);
        assert_eq!(worker_applier.calls(), 2, "the worker performed the drain");
        assert_eq!(h.applier.calls(), 0, "no direct drain in the foreground");

        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_count_refresh_never_applies() {
        let h = Harness::new(true);
        let handle = h
            .coordinator()
            .with_count_refresh(Duration::from_millis(20))
            .spawn(h.cancel.clone(), &h.tracker);
        let mut status = handle.status();

        h.enqueue(&["t1", "t2", "t3"]).await;
        let counted = wait_until(&mut status, |s| s.pending == 3).await;
        assert!(counted.last_sync.is_none());
        assert_eq!(handle.pending_count(), 3);
        assert_eq!(h.applier.calls(), 0);

        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_force_sync_returns_report() {
        let h = Harness::new(true);
        h.enqueue(&["t1", "t2"]).await;
        let handle = h.coordinator().spawn(h.cancel.clone(), &h.tracker);

        let report = handle.force_sync().await.unwrap();
        assert_eq!(report.synced, 2);
        assert!(report.completed());

        let again = handle.force_sync().await.unwrap();
        assert_eq!(again.attempted, 0);
        assert_eq!(h.applier.calls(), 2);

        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_mutations_message_triggers_direct_drain() {
        let h = Harness::new(true);
        h.enqueue(&["t1"]).await;
        let handle = h.coordinator().spawn(h.cancel.clone(), &h.tracker);
        let mut status = handle.status();

        handle.deliver(BridgeMessage::SyncMutations);
        let settled = wait_until(&mut status, |s| s.last_sync.is_some()).await;
        assert_eq!(settled.pending, 0);

        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_connectivity_survives_saturated_command_queue() {
        let h = Harness::new(true);
        h.enqueue(&["t1"]).await;
        let (gate_tx, gate_rx) = watch::channel(false);
        let applier = Arc::new(GatedApplier {
            gate: gate_rx,
            calls: AtomicUsize::new(0),
        });
        let handle = SyncCoordinator::new(
            h.queue.store().clone(),
            applier.clone(),
            Arc::clone(&h.online),
        )
        .spawn(h.cancel.clone(), &h.tracker);
        let mut status = handle.status();

        let blocked = tokio::spawn({
            let handle = handle.clone();
            async move { handle.force_sync().await }
        });
        wait_until(&mut status, |s| s.syncing).await;

        // The drain is stuck, so these pile up behind it.
        handle.set_online(false);
        for _ in 0..(COMMAND_QUEUE_BOUND + 6) {
            handle.request_sync("burst");
        }
        handle.set_online(true);
        gate_tx.send_replace(true);
        blocked.await.unwrap().unwrap();

        h.enqueue(&["t2"]).await;
        handle.request_sync("after reconnect");
        timeout(Duration::from_secs(5), async {
            while h.queue.get_pending_count().await.unwrap() != 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("record enqueued after reconnect is drained");
        assert!(handle.is_online());
        assert_eq!(applier.calls.load(Ordering::SeqCst), 2);

        h.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_drain_does_not_stamp_last_sync() {
        let h = Harness::new(true);
        let handle = h.coordinator().spawn(h.cancel.clone(), &h.tracker);
        h.queue
            .store()
            .with_conn(|conn| {
                conn.execute_batch("DROP TABLE mutations")?;
                Ok(())
            })
            .await
            .unwrap();

        let err = handle.force_sync().await.unwrap_err();
        assert!(matches!(err, QueueError::Storage(_)));

        let status = handle.status().borrow().clone();
        assert!(status.last_sync.is_none());
        assert!(!status.syncing);

        h.shutdown().await;
    }
}
