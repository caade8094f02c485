//! Engine wiring: one object that owns the store, the background worker, the
//! coordinator, and their shutdown.
//!
//! Connectivity starts as offline. The host feeds `set_online` from its
//! platform signal; the first `true` counts as a came-online transition, so a
//! backlog left from a previous run drains at startup.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::apply::{ApplyDispatch, ApplyMutation};
use crate::bridge::{BackgroundWorker, WorkerHandle};
use crate::config::SyncConfig;
use crate::coordinator::{CoordinatorHandle, SyncCoordinator, SyncStatus};
use crate::drain::DrainReport;
use crate::error::QueueError;
use crate::identity::MutationIdGenerator;
use crate::mutation::MutationRecord;
use crate::queue::MutationQueue;
use crate::remote::{self, RemoteClient};
use crate::save::{self, SaveOutcome};
use crate::store::MutationStore;

pub struct SyncEngine {
    config: SyncConfig,
    queue: MutationQueue,
    ids: MutationIdGenerator,
    applier: Arc<dyn ApplyMutation>,
    coordinator: CoordinatorHandle,
    worker: Option<WorkerHandle>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl SyncEngine {
    /// Start with the remote routes built from `config` (or hydrated from
    /// `local_settings`). Without remote credentials every apply declines and
    /// records simply wait in the queue.
    pub async fn start(config: SyncConfig) -> Result<Self, QueueError> {
        let store = MutationStore::open(&config.data_dir)?;
        let config = hydrate(&store, config).await?;
        let applier = default_applier(&config);
        Self::start_inner(store, config, applier).await
    }

    /// Start with a caller-supplied apply implementation.
    pub async fn start_with_applier(
        config: SyncConfig,
        applier: Arc<dyn ApplyMutation>,
    ) -> Result<Self, QueueError> {
        let store = MutationStore::open(&config.data_dir)?;
        let config = hydrate(&store, config).await?;
        Self::start_inner(store, config, applier).await
    }

    async fn start_inner(
        store: MutationStore,
        config: SyncConfig,
        applier: Arc<dyn ApplyMutation>,
    ) -> Result<Self, QueueError> {
        let install_id = store.install_id().await?;
        let ids = MutationIdGenerator::new(install_id.clone());

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (online_tx, _) = watch::channel(false);
        let online = Arc::new(online_tx);

        let mut coordinator = SyncCoordinator::new(store.clone(), Arc::clone(&applier), Arc::clone(&online))
            .with_tag(config.background_sync_tag.clone())
            .with_count_refresh(config.count_refresh_interval());

        let worker = if config.enable_background_worker {
            // The worker gets its own connection, like a separate process would.
            let worker_store = MutationStore::open_path(&store.db_path())?;
            let handle = BackgroundWorker::spawn(
                worker_store,
                Arc::clone(&applier),
                online.subscribe(),
                cancel.clone(),
                &tracker,
            );
            coordinator = coordinator.with_registrar(Arc::new(handle.clone()), Some(handle.subscribe()));
            Some(handle)
        } else {
            None
        };

        let coordinator = coordinator.spawn(cancel.clone(), &tracker);

        info!(
            install_id = %install_id,
            db = %store.db_path().display(),
            background = worker.is_some(),
            remote = config.is_remote_configured(),
            "Sync engine started"
        );

        Ok(Self {
            config,
            queue: MutationQueue::new(store),
            ids,
            applier,
            coordinator,
            worker,
            cancel,
            tracker,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    pub fn worker(&self) -> Option<&WorkerHandle> {
        self.worker.as_ref()
    }

    pub fn install_id(&self) -> &str {
        self.ids.install_id()
    }

    /// A fresh record id: `{install_id}-{unix_ms}-{seq}`.
    pub fn next_id(&self) -> String {
        self.ids.next_id()
    }

    pub fn set_online(&self, online: bool) {
        self.coordinator.set_online(online);
    }

    pub fn request_sync(&self, reason: &str) {
        self.coordinator.request_sync(reason);
    }

    pub async fn force_sync(&self) -> Result<DrainReport, QueueError> {
        self.coordinator.force_sync().await
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.coordinator.status()
    }

    /// Apply now if online, otherwise (or on failure) queue.
    pub async fn save(&self, record: MutationRecord) -> SaveOutcome {
        let online = self.coordinator.is_online();
        save::save_with_fallback(&self.queue, &*self.applier, online, record).await
    }

    pub async fn save_settings(&self, settings: Value) -> SaveOutcome {
        let record = MutationRecord::settings_upsert(self.next_id(), self.install_id(), settings);
        self.save(record).await
    }

    pub async fn save_sales_transaction(&self, transaction: Value) -> SaveOutcome {
        let record = MutationRecord::sales_transaction_insert(self.next_id(), transaction);
        self.save(record).await
    }

    pub async fn save_quotation(&self, quotation: Value) -> SaveOutcome {
        let record = MutationRecord::quotation_insert(self.next_id(), quotation);
        self.save(record).await
    }

    /// Stop the worker and coordinator and wait for them to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("Sync engine stopped");
    }
}

async fn hydrate(store: &MutationStore, mut config: SyncConfig) -> Result<SyncConfig, QueueError> {
    store
        .with_conn(move |conn| {
            config.apply_local_settings(conn);
            Ok(config)
        })
        .await
}

fn default_applier(config: &SyncConfig) -> Arc<dyn ApplyMutation> {
    match RemoteClient::from_config(config) {
        Ok(client) => Arc::new(remote::remote_dispatch(Arc::new(client))),
        Err(e) => {
            warn!("Remote sync unavailable ({e}); mutations will stay queued");
            Arc::new(ApplyDispatch::new())
        }
    }
}
