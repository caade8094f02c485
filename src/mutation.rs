//! Mutation records: the unit of durable, replayable work.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::QueueError;

pub const TABLE_APP_SETTINGS: &str = "app_settings";
pub const TABLE_SALES_TRANSACTIONS: &str = "sales_transactions";
pub const TABLE_QUOTATIONS: &str = "quotations";

/// Semantic operation replayed against the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Insert,
    Upsert,
    Delete,
}

impl MutationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationAction::Insert => "insert",
            MutationAction::Upsert => "upsert",
            MutationAction::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationAction {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(MutationAction::Insert),
            "upsert" => Ok(MutationAction::Upsert),
            "delete" => Ok(MutationAction::Delete),
            other => Err(QueueError::InvalidRecord(format!(
                "unknown mutation action: {other}"
            ))),
        }
    }
}

/// One pending write, persisted locally until the remote store confirms it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: String,
    pub table: String,
    pub action: MutationAction,
    pub payload: Value,
    pub timestamp: String,
    #[serde(default)]
    pub synced: bool,
}

impl MutationRecord {
    /// Build an unsynced record stamped with the current time.
    pub fn new(
        id: impl Into<String>,
        table: impl Into<String>,
        action: MutationAction,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            action,
            payload,
            timestamp: now_timestamp(),
            synced: false,
        }
    }

    /// Settings snapshot keyed by install id; replayed as an upsert.
    pub fn settings_upsert(id: impl Into<String>, install_id: &str, settings: Value) -> Self {
        Self::new(
            id,
            TABLE_APP_SETTINGS,
            MutationAction::Upsert,
            serde_json::json!({ "install_id": install_id, "settings": settings }),
        )
    }

    pub fn sales_transaction_insert(id: impl Into<String>, transaction: Value) -> Self {
        Self::new(id, TABLE_SALES_TRANSACTIONS, MutationAction::Insert, transaction)
    }

    pub fn quotation_insert(id: impl Into<String>, quotation: Value) -> Self {
        Self::new(id, TABLE_QUOTATIONS, MutationAction::Insert, quotation)
    }

    /// Remove the rows of `table` where `key = value`.
    pub fn delete_where(
        id: impl Into<String>,
        table: impl Into<String>,
        key: &str,
        value: &str,
    ) -> Self {
        Self::new(
            id,
            table,
            MutationAction::Delete,
            serde_json::json!({ "key": key, "value": value }),
        )
    }

    /// Reject records the drain could never route: blank id or table.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.id.trim().is_empty() {
            return Err(QueueError::InvalidRecord("id must not be empty".into()));
        }
        if self.table.trim().is_empty() {
            return Err(QueueError::InvalidRecord(format!(
                "table must not be empty (id {})",
                self.id
            )));
        }
        Ok(())
    }
}

/// ISO-8601 UTC timestamp with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
