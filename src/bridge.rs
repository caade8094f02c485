//! Background registration bridge.
//!
//! The background worker is a second execution context: a task with its own
//! store connection that can drain the queue without the foreground. The two
//! sides only exchange messages. The foreground asks for a sync either by
//! registering a deferred sync (the worker runs it once connectivity allows)
//! or by posting `SYNC_MUTATIONS`; the worker reports `SYNC_STARTED` and
//! `SYNC_COMPLETE` on a broadcast channel. Notifications are best effort:
//! with no subscriber they are simply dropped.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::apply::ApplyMutation;
use crate::drain;
use crate::error::BridgeError;
use crate::store::MutationStore;

const COMMAND_QUEUE_BOUND: usize = 32;
const EVENT_BUFFER: usize = 16;

/// Tag used for syncs requested by message rather than registration.
const MESSAGE_SYNC_TAG: &str = "message";

/// Cross-context message. Serialized as `{"type": "SYNC_MUTATIONS"}` etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeMessage {
    /// Request: please drain the queue.
    SyncMutations,
    /// Notification: a drain started in the background context.
    SyncStarted,
    /// Notification: that drain finished (successfully or not).
    SyncComplete,
}

/// Platform capability to schedule a deferred sync that runs even if the
/// requesting context goes away. Optional: callers hold
/// `Option<Arc<dyn BackgroundRegistrar>>` and fall back to a direct drain.
pub trait BackgroundRegistrar: Send + Sync {
    fn register_sync(&self, tag: &str) -> Result<(), BridgeError>;
}

/// Registrar for contexts without background support; always refuses.
pub struct Unsupported;

impl BackgroundRegistrar for Unsupported {
    fn register_sync(&self, _tag: &str) -> Result<(), BridgeError> {
        Err(BridgeError::Unsupported)
    }
}

enum WorkerCommand {
    Register { tag: String },
    Message(BridgeMessage),
}

/// Foreground-side handle to a running [`BackgroundWorker`].
#[derive(Clone)]
pub struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    events: broadcast::Sender<BridgeMessage>,
}

impl WorkerHandle {
    /// Deliver a message to the worker. A full queue means a request is
    /// already waiting, which covers this one too.
    pub fn post_message(&self, message: BridgeMessage) -> Result<(), BridgeError> {
        self.enqueue(WorkerCommand::Message(message))
    }

    /// Receive `SYNC_STARTED` / `SYNC_COMPLETE` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeMessage> {
        self.events.subscribe()
    }

    fn enqueue(&self, command: WorkerCommand) -> Result<(), BridgeError> {
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("worker command queue full; request coalesced");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(BridgeError::WorkerGone),
        }
    }
}

impl BackgroundRegistrar for WorkerHandle {
    fn register_sync(&self, tag: &str) -> Result<(), BridgeError> {
        self.enqueue(WorkerCommand::Register {
            tag: tag.to_string(),
        })
    }
}

/// The background execution context.
pub struct BackgroundWorker {
    store: MutationStore,
    applier: Arc<dyn ApplyMutation>,
    online: watch::Receiver<bool>,
    commands: mpsc::Receiver<WorkerCommand>,
    events: broadcast::Sender<BridgeMessage>,
    cancel: CancellationToken,
    pending: BTreeSet<String>,
}

impl BackgroundWorker {
    /// Start the worker on `tracker` and return its handle.
    ///
    /// `store` should be the worker's own connection to the queue database.
    pub fn spawn(
        store: MutationStore,
        applier: Arc<dyn ApplyMutation>,
        online: watch::Receiver<bool>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> WorkerHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_BOUND);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);

        let worker = Self {
            store,
            applier,
            online,
            commands: cmd_rx,
            events: events_tx.clone(),
            cancel,
            pending: BTreeSet::new(),
        };
        tracker.spawn(worker.run());

        WorkerHandle {
            commands: cmd_tx,
            events: events_tx,
        }
    }

    async fn run(mut self) {
        info!("Background sync worker started");
        let mut online_closed = false;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.accept(command),
                    None => break,
                },
                changed = self.online.changed(), if !online_closed => {
                    if changed.is_err() {
                        online_closed = true;
                    }
                }
            }

            // Coalesce everything already queued into this wake-up.
            while let Ok(command) = self.commands.try_recv() {
                self.accept(command);
            }

            if self.pending.is_empty() {
                continue;
            }
            if !*self.online.borrow() {
                debug!(pending = self.pending.len(), "offline; background sync deferred");
                continue;
            }
            self.run_sync().await;
        }

        info!("Background sync worker stopped");
    }

    fn accept(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Register { tag } => {
                debug!(tag = %tag, "background sync registered");
                self.pending.insert(tag);
            }
            WorkerCommand::Message(BridgeMessage::SyncMutations) => {
                self.pending.insert(MESSAGE_SYNC_TAG.to_string());
            }
            WorkerCommand::Message(other) => {
                debug!(?other, "worker ignoring status message");
            }
        }
    }

    async fn run_sync(&mut self) {
        let tags: Vec<String> = self.pending.iter().cloned().collect();
        let _ = self.events.send(BridgeMessage::SyncStarted);

        match drain::drain_with(&self.store, &*self.applier).await {
            Ok(report) if report.completed() => {
                info!(tags = ?tags, synced = report.synced, "Background sync complete");
                self.pending.clear();
            }
            Ok(report) => {
                // Keep the registration so the next wake-up retries it.
                warn!(
                    tags = ?tags,
                    synced = report.synced,
                    stopped_at = ?report.stopped_at,
                    "Background sync stopped early; registration kept"
                );
            }
            Err(e) => {
                warn!(tags = ?tags, "Background sync failed: {e}");
            }
        }

        let _ = self.events.send(BridgeMessage::SyncComplete);
    }
}
