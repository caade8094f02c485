//! The Small POS - offline mutation queue and sync engine
//!
//! Writes made while the terminal is offline (or while the remote store is
//! failing) are persisted as mutation records in a local SQLite queue and
//! replayed in insertion order once connectivity returns. Replays go through
//! a background worker when one is running, and through a direct in-process
//! drain otherwise.
//!
//! Typical host wiring:
//!
//! ```no_run
//! # async fn host() -> Result<(), pos_offline_sync::QueueError> {
//! use pos_offline_sync::{diagnostics, SyncConfig, SyncEngine};
//!
//! let config = SyncConfig::from_env();
//! let _log_guard = diagnostics::init_logging(&diagnostics::get_log_dir(&config.data_dir)).ok();
//!
//! let engine = SyncEngine::start(config).await?;
//! engine.set_online(true);
//! engine
//!     .save_sales_transaction(serde_json::json!({ "trans_id": "T-1", "total_amount": 116.0 }))
//!     .await;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod diagnostics;
pub mod drain;
pub mod engine;
pub mod error;
pub mod identity;
pub mod mutation;
pub mod queue;
pub mod remote;
pub mod save;
pub mod store;

pub use apply::{ApplyDispatch, ApplyMutation};
pub use bridge::{BackgroundRegistrar, BackgroundWorker, BridgeMessage, WorkerHandle};
pub use config::SyncConfig;
pub use coordinator::{CoordinatorHandle, SyncCoordinator, SyncStatus};
pub use drain::{drain_queue, drain_with, DrainReport};
pub use engine::SyncEngine;
pub use error::{BridgeError, QueueError, RemoteError};
pub use mutation::{MutationAction, MutationRecord};
pub use queue::MutationQueue;
pub use remote::RemoteClient;
pub use save::{save_with_fallback, SaveOutcome};
pub use store::MutationStore;
