//! Push engine: drains the outbox against the remote.
//!
//! Entries are sent in foreign-key dependency order (stable sort over the
//! table catalog rank). A remote FK violation against a known parent
//! table is recovered transparently: the missing parent row is fetched
//! locally, sanitized and pushed first, then the original write is
//! retried exactly once. One failing row never blocks the rest of the
//! batch; a credentials rejection aborts the whole push.

use crate::document::Document;
use crate::engine::sanitize::sanitize;
use crate::engine::tables;
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteError, RemoteTable};
use crate::store::outbox::{OutboxEntry, OutboxOp, OutboxStore};
use crate::store::LocalStore;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;

/// Progress callback: (current, total, table).
pub type ProgressFn = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Outcome of one push pass.
#[derive(Debug, Default)]
pub struct PushReport {
    pub pushed: usize,
    /// Per-entry errors (row-level only; fatal errors abort the pass).
    pub errors: Vec<String>,
}

pub struct PushEngine {
    local: Arc<LocalStore>,
    outbox: Arc<OutboxStore>,
    remote: Arc<dyn RemoteTable>,
    progress: Option<ProgressFn>,
}

impl PushEngine {
    pub fn new(
        local: Arc<LocalStore>,
        outbox: Arc<OutboxStore>,
        remote: Arc<dyn RemoteTable>,
    ) -> Self {
        Self {
            local,
            outbox,
            remote,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Drain the outbox. Returns `Err` only for fatal failures
    /// (credentials, store-level I/O); row errors land in the report.
    pub async fn push(&self) -> SyncResult<PushReport> {
        let mut entries = self.outbox.list_pending()?;
        if entries.is_empty() {
            return Ok(PushReport::default());
        }

        // Parents before children; entries for unknown tables keep their
        // relative order after the catalog (sort_by_key is stable).
        entries.sort_by_key(|e| tables::rank(&e.table_name));

        let total = entries.len();
        let mut report = PushReport::default();

        for (i, entry) in entries.iter().enumerate() {
            if let Some(progress) = &self.progress {
                progress(i + 1, total, &entry.table_name);
            }

            match self.push_entry(entry).await {
                Ok(()) => {
                    self.outbox.delete(entry.id)?;
                    report.pushed += 1;
                }
                Err(err) if err.is_fatal() => {
                    tracing::error!(
                        table = %entry.table_name,
                        row = %entry.row_id,
                        %err,
                        "Push aborted by fatal error"
                    );
                    return Err(err);
                }
                Err(err) => {
                    let message =
                        format!("{}/{}: {err}", entry.table_name, entry.row_id);
                    tracing::warn!(
                        table = %entry.table_name,
                        row = %entry.row_id,
                        attempts = entry.attempts + 1,
                        %err,
                        "Push entry failed; will retry next cycle"
                    );
                    self.outbox.increment_attempts(entry.id, &err.to_string())?;
                    report.errors.push(message);
                }
            }
        }

        tracing::info!(
            pushed = report.pushed,
            failed = report.errors.len(),
            "Push pass complete"
        );
        Ok(report)
    }

    async fn push_entry(&self, entry: &OutboxEntry) -> SyncResult<()> {
        let now = Utc::now();
        let now_iso = now.to_rfc3339_opts(SecondsFormat::Millis, true);

        match entry.op {
            OutboxOp::Delete => {
                // Deletes propagate as tombstones, never as hard deletes.
                self.remote
                    .update_tombstone(&entry.table_name, &entry.row_id, &now_iso)
                    .await?;
                Ok(())
            }
            OutboxOp::Upsert => {
                let mut payload = entry.payload.clone();

                if tables::requires_timestamp_pair(&entry.table_name)
                    && self.backfill_timestamps(&mut payload, now.timestamp_millis(), &now_iso)
                {
                    // Persist the backfill so the local row and the remote
                    // row never disagree on the stamp.
                    self.local.upsert(&entry.table_name, &payload)?;
                }

                let outbound = sanitize(&entry.table_name, &payload);
                match self.remote.upsert(&entry.table_name, &outbound).await {
                    Ok(()) => Ok(()),
                    Err(RemoteError::ForeignKey { referenced_table }) => {
                        self.recover_missing_parent(entry, &outbound, &referenced_table)
                            .await
                    }
                    Err(other) => Err(other.into()),
                }
            }
        }
    }

    /// Backfill missing epoch + ISO stamps; returns true if anything changed.
    fn backfill_timestamps(&self, doc: &mut Document, epoch_ms: i64, iso: &str) -> bool {
        let mut changed = false;
        for (epoch_col, iso_col) in [
            ("created_at", "created_at_iso"),
            ("updated_at", "updated_at_iso"),
        ] {
            if doc.is_missing_or_null(epoch_col) {
                doc.set(epoch_col, Value::from(epoch_ms));
                changed = true;
            }
            if doc.is_missing_or_null(iso_col) {
                doc.set(iso_col, Value::String(iso.to_string()));
                changed = true;
            }
        }
        changed
    }

    /// The remote rejected a child because its parent is missing: push
    /// the parent from the local store, then retry the child exactly once.
    async fn recover_missing_parent(
        &self,
        entry: &OutboxEntry,
        outbound: &Document,
        parent_table: &str,
    ) -> SyncResult<()> {
        let fk_column = tables::fk_column_for(&entry.table_name, parent_table)
            .ok_or_else(|| SyncError::ForeignKey {
                table: parent_table.to_string(),
            })?;
        let parent_id = outbound
            .get_str(fk_column)
            .ok_or_else(|| SyncError::ForeignKey {
                table: parent_table.to_string(),
            })?
            .to_string();

        let parent_row = self
            .local
            .fetch_row(parent_table, &parent_id)?
            .ok_or_else(|| SyncError::ForeignKey {
                table: parent_table.to_string(),
            })?;

        tracing::info!(
            child = %entry.table_name,
            parent = %parent_table,
            parent_id = %parent_id,
            "Remote missing parent row; pushing parent first"
        );

        self.remote
            .upsert(parent_table, &sanitize(parent_table, &parent_row))
            .await?;

        // Retry the original write once; a second failure surfaces as-is.
        self.remote
            .upsert(&entry.table_name, outbound)
            .await
            .map_err(SyncError::from)
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unauthorized => SyncError::Unauthorized,
            RemoteError::ForeignKey { referenced_table } => SyncError::ForeignKey {
                table: referenced_table,
            },
            RemoteError::Other(msg) => SyncError::Remote(msg),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
