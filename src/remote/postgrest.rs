//! PostgREST client (Supabase-style REST backend).
//!
//! Thin reqwest wrapper over the per-table REST endpoints:
//! - upsert: `POST /rest/v1/{table}` with `Prefer: resolution=merge-duplicates`
//! - incremental select: `GET /rest/v1/{table}?updated_at_iso=gte.{wm}`
//! - tombstone: `PATCH /rest/v1/{table}?id=eq.{id}`
//!
//! PostgREST surfaces Postgres errors as a JSON body with a SQLSTATE
//! `code`; `23503` is a foreign-key violation and its `details` field
//! names the referenced table, which the push engine needs for parent
//! recovery.

use crate::document::Document;
use crate::remote::{RemoteError, RemoteTable};
use async_trait::async_trait;
use serde_json::Value;

/// SQLSTATE for foreign-key violations.
const SQLSTATE_FOREIGN_KEY: &str = "23503";

pub struct PostgrestClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl PostgrestClient {
    pub fn new(base_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }

    /// Build the PostgREST URL for a table.
    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Base headers for authenticated requests.
    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("apikey", self.api_key.clone()),
            ("Authorization", format!("Bearer {}", self.api_key)),
        ]
    }

    fn with_auth(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in self.auth_headers() {
            request = request.header(key, value);
        }
        request
    }
}

#[async_trait]
impl RemoteTable for PostgrestClient {
    async fn upsert(&self, table: &str, row: &Document) -> Result<(), RemoteError> {
        let url = format!("{}?on_conflict=id", self.table_url(table));
        let request = self
            .http
            .post(&url)
            .header("Prefer", "resolution=merge-duplicates")
            .json(row);

        let resp = self
            .with_auth(request)
            .send()
            .await
            .map_err(|e| RemoteError::Other(e.to_string()))?;

        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }

    async fn select_since(
        &self,
        table: &str,
        watermark: &str,
    ) -> Result<Vec<Document>, RemoteError> {
        let url = format!(
            "{}?select=*&updated_at_iso=gte.{}&order=updated_at_iso.asc",
            self.table_url(table),
            watermark
        );

        let resp = self
            .with_auth(self.http.get(&url))
            .send()
            .await
            .map_err(|e| RemoteError::Other(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        resp.json::<Vec<Document>>()
            .await
            .map_err(|e| RemoteError::Other(format!("malformed select response: {e}")))
    }

    async fn update_tombstone(
        &self,
        table: &str,
        id: &str,
        deleted_at: &str,
    ) -> Result<(), RemoteError> {
        let url = format!("{}?id=eq.{}", self.table_url(table), id);
        let body = serde_json::json!({
            "deleted_at": deleted_at,
            "updated_at_iso": deleted_at,
        });

        let resp = self
            .with_auth(self.http.patch(&url).json(&body))
            .send()
            .await
            .map_err(|e| RemoteError::Other(e.to_string()))?;

        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/rest/v1/", self.base_url);
        matches!(
            self.with_auth(self.http.get(&url)).send().await,
            Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 401
        )
    }
}

/// Classify a non-2xx PostgREST response.
///
/// 401/403 are credential failures. Otherwise the body is a JSON error
/// document; SQLSTATE 23503 marks a foreign-key violation whose `details`
/// reads like `Key (category_id)=(c9) is not present in table "categories".`
fn classify_failure(status: u16, body: &str) -> RemoteError {
    if status == 401 || status == 403 {
        return RemoteError::Unauthorized;
    }

    if let Ok(err) = serde_json::from_str::<Value>(body) {
        if err.get("code").and_then(Value::as_str) == Some(SQLSTATE_FOREIGN_KEY) {
            let detail = err
                .get("details")
                .and_then(Value::as_str)
                .or_else(|| err.get("message").and_then(Value::as_str))
                .unwrap_or_default();
            return RemoteError::ForeignKey {
                referenced_table: referenced_table_from_detail(detail),
            };
        }
        if let Some(message) = err.get("message").and_then(Value::as_str) {
            return RemoteError::Other(format!("{status}: {message}"));
        }
    }

    RemoteError::Other(format!("{status}: {body}"))
}

/// Pull the table name out of `... is not present in table "categories".`
fn referenced_table_from_detail(detail: &str) -> String {
    detail
        .split("in table \"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap_or_default()
        .to_string()
}

// ── Tests ───────────────────────────────────────────────────────
