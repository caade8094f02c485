//! Remote data store client.
//!
//! Talks to a PostgREST-style REST endpoint (`{base}/rest/v1/{table}`) and
//! provides the default apply routes for the POS tables. Upserts name their
//! conflict key so replaying them is idempotent; a duplicate-key rejection of
//! an insert counts as already applied.

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::apply::ApplyDispatch;
use crate::config::SyncConfig;
use crate::error::RemoteError;
use crate::mutation::{MutationAction, TABLE_APP_SETTINGS, TABLE_QUOTATIONS, TABLE_SALES_TRANSACTIONS};

/// Conflict target for settings upserts.
pub const SETTINGS_CONFLICT_KEY: &str = "install_id";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: reqwest::Error) -> RemoteError {
    if err.is_connect() {
        return RemoteError::Unreachable(url.to_string());
    }
    if err.is_timeout() {
        return RemoteError::Timeout(url.to_string());
    }
    RemoteError::Http(err)
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Not authorized for this table".to_string(),
        404 => "Remote table not found".to_string(),
        409 => "Duplicate key".to_string(),
        s if s >= 500 => format!("Remote store server error (HTTP {s})"),
        s => format!("Unexpected response from remote store (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct RemoteClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RemoteClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let base_url = normalize_base_url(base_url);
        let api_key = api_key.trim().to_string();
        if base_url.is_empty() || api_key.is_empty() {
            return Err(RemoteError::NotConfigured);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, RemoteError> {
        match (config.remote_url.as_deref(), config.remote_key.as_deref()) {
            (Some(url), Some(key)) => Self::new(url, key, config.request_timeout()),
            _ => Err(RemoteError::NotConfigured),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    pub async fn insert(&self, table: &str, row: &Value) -> Result<(), RemoteError> {
        let url = self.table_url(table);
        let req = self
            .authed(self.client.post(&url))
            .header("Prefer", "return=minimal")
            .json(row);
        match self.send(&url, req).await {
            Err(RemoteError::Status { status: 409, .. }) => {
                debug!(table, "insert already applied remotely (duplicate key)");
                Ok(())
            }
            other => other,
        }
    }

    /// Upsert with `on_conflict` so a replay overwrites instead of failing.
    pub async fn upsert(&self, table: &str, on_conflict: &str, row: &Value) -> Result<(), RemoteError> {
        if row.get(on_conflict).map_or(true, Value::is_null) {
            return Err(RemoteError::MissingKey {
                table: table.to_string(),
                key: on_conflict.to_string(),
            });
        }
        let url = self.table_url(table);
        let req = self
            .authed(self.client.post(&url))
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(row);
        self.send(&url, req).await
    }

    /// Delete rows where `key = value`. Deleting nothing still succeeds.
    pub async fn delete(&self, table: &str, key: &str, value: &str) -> Result<(), RemoteError> {
        let url = self.table_url(table);
        let req = self
            .authed(self.client.delete(&url))
            .query(&[(key, format!("eq.{value}"))]);
        self.send(&url, req).await
    }

    async fn send(&self, url: &str, req: RequestBuilder) -> Result<(), RemoteError> {
        let resp = req.send().await.map_err(|e| friendly_error(url, e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body_text = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body_text)
            .ok()
            .and_then(|json| {
                json.get("message")
                    .or_else(|| json.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| status_message(status));
        Err(RemoteError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

/// Row written to `app_settings`: `{install_id, data}`.
///
/// The settings blob is taken from `settings`, then `data`, then the payload
/// itself, so records written by older builds still replay.
pub fn settings_row(payload: &Value) -> Value {
    let install_id = payload.get("install_id").cloned().unwrap_or(Value::Null);
    let data = payload
        .get("settings")
        .filter(|v| !v.is_null())
        .or_else(|| payload.get("data").filter(|v| !v.is_null()))
        .cloned()
        .unwrap_or_else(|| payload.clone());
    serde_json::json!({ "install_id": install_id, "data": data })
}

/// Filter carried by a delete record (`{"key": column, "value": v}`).
/// Non-string values are rendered as JSON text.
pub fn delete_filter(payload: &Value) -> Option<(String, String)> {
    let key = payload.get("key")?.as_str()?.trim();
    if key.is_empty() {
        return None;
    }
    let value = match payload.get("value")? {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Some((key.to_string(), value))
}

/// Default routes: settings upsert, sales transaction insert, quotation
/// insert and quotation delete (see [`MutationRecord::delete_where`]).
///
/// [`MutationRecord::delete_where`]: crate::mutation::MutationRecord::delete_where
pub fn remote_dispatch(client: Arc<RemoteClient>) -> ApplyDispatch {
    let settings_client = Arc::clone(&client);
    let sales_client = Arc::clone(&client);
    let quote_client = Arc::clone(&client);
    let delete_client = client;

    info!("Remote apply routes registered");

    ApplyDispatch::new()
        .route(TABLE_APP_SETTINGS, MutationAction::Upsert, move |payload| {
            let client = Arc::clone(&settings_client);
            async move {
                let row = settings_row(&payload);
                client
                    .upsert(TABLE_APP_SETTINGS, SETTINGS_CONFLICT_KEY, &row)
                    .await
                    .inspect_err(|e| warn!("remote settings upsert failed: {e}"))?;
                Ok::<bool, anyhow::Error>(true)
            }
        })
        .route(TABLE_SALES_TRANSACTIONS, MutationAction::Insert, move |payload| {
            let client = Arc::clone(&sales_client);
            async move {
                client
                    .insert(TABLE_SALES_TRANSACTIONS, &payload)
                    .await
                    .inspect_err(|e| warn!("remote transaction insert failed: {e}"))?;
                Ok::<bool, anyhow::Error>(true)
            }
        })
        .route(TABLE_QUOTATIONS, MutationAction::Insert, move |payload| {
            let client = Arc::clone(&quote_client);
            async move {
                client
                    .insert(TABLE_QUOTATIONS, &payload)
                    .await
                    .inspect_err(|e| warn!("remote quotation insert failed: {e}"))?;
                Ok::<bool, anyhow::Error>(true)
            }
        })
        .route(TABLE_QUOTATIONS, MutationAction::Delete, move |payload| {
            let client = Arc::clone(&delete_client);
            async move {
                let Some((key, value)) = delete_filter(&payload) else {
                    warn!("quotation delete has no key/value filter; declining");
                    return Ok(false);
                };
                client
                    .delete(TABLE_QUOTATIONS, &key, &value)
                    .await
                    .inspect_err(|e| warn!("remote quotation delete failed: {e}"))?;
                Ok::<bool, anyhow::Error>(true)
            }
        })
}
