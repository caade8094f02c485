//! Error types for the offline queue.
//!
//! Storage faults surface to callers as [`QueueError`]; apply faults never do
//! (they are logged and leave the record pending). Bridge faults are recovered
//! locally by falling back to a direct drain.

use thiserror::Error;

/// Errors raised by the durable store and the queue API.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("sqlite: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("payload serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid mutation record: {0}")]
    InvalidRecord(String),

    #[error("{0}")]
    Migration(String),

    #[error("database worker task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("database connection lock poisoned")]
    LockPoisoned,

    #[error("channel closed")]
    ChannelClosed,
}

/// Errors from the background registration capability.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("background sync is not supported in this context")]
    Unsupported,

    #[error("background worker is not running")]
    WorkerGone,
}

/// Errors from the remote REST client.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote store is not configured")]
    NotConfigured,

    #[error("cannot reach remote store at {0}")]
    Unreachable(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("payload for {table} is missing conflict key `{key}`")]
    MissingKey { table: String, key: String },

    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
