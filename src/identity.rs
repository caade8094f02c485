//! Install identity and mutation id generation.
//!
//! The install id is a long-lived random identifier for this device
//! installation, persisted in `local_settings` the first time it is needed.
//! Mutation ids combine it with a millisecond timestamp and a per-process
//! sequence so two records created in the same millisecond still differ.

use chrono::Utc;
use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;
use uuid::Uuid;

use crate::db;
use crate::error::QueueError;

const INSTALL_CATEGORY: &str = "device";
const INSTALL_KEY: &str = "install_id";
const INSTALL_PREFIX: &str = "inst-";

/// Fresh candidate id: `inst-` followed by 8 lowercase hex characters.
fn generate_install_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("{INSTALL_PREFIX}{}", &raw[..8])
}

/// Return the persisted install id, creating it on first use.
pub fn get_or_create_install_id(conn: &Connection) -> Result<String, QueueError> {
    if let Some(existing) = db::get_setting(conn, INSTALL_CATEGORY, INSTALL_KEY)
        .filter(|v| !v.trim().is_empty())
    {
        return Ok(existing);
    }

    let candidate = generate_install_id();
    let stored = db::get_or_insert_setting(conn, INSTALL_CATEGORY, INSTALL_KEY, &candidate)?;
    if stored == candidate {
        info!(install_id = %stored, "Created install identity");
    }
    Ok(stored)
}

/// Produces collision-free mutation ids scoped to one install.
#[derive(Debug)]
pub struct MutationIdGenerator {
    install_id: String,
    seq: AtomicU64,
}

impl MutationIdGenerator {
    pub fn new(install_id: impl Into<String>) -> Self {
        Self {
            install_id: install_id.into(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn install_id(&self) -> &str {
        &self.install_id
    }

    /// `{install_id}-{unix_ms}-{seq}`
    pub fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{seq}",
            self.install_id,
            Utc::now().timestamp_millis()
        )
    }
}
