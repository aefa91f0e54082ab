//! Pull engine: applies remote changes locally, table by table.
//!
//! Tables are processed in the catalog's dependency order, oldest rows
//! first. Three rules keep a flaky batch from corrupting state:
//!
//! - **Local-pending-wins**: a row with an un-pushed outbox entry is
//!   never overwritten by an incoming remote snapshot.
//! - **Deferral**: a row whose local write hits a foreign-key constraint
//!   is parked in a [`DeferredSet`] and retried after sibling tables have
//!   had a chance to supply the missing parent.
//! - **Watermark withholding**: a table's watermark advances only once
//!   every row of its batch was durably applied; anything less and the
//!   next cycle re-fetches the same window.
//!
//! The deferred retry is a bounded state machine: the set is passed by
//! value between passes, never mutated behind a shared reference.

use crate::document::Document;
use crate::engine::normalize::normalize;
use crate::engine::tables::SYNC_TABLES;
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteError, RemoteTable};
use crate::store::outbox::OutboxStore;
use crate::store::watermark::{WatermarkStore, EPOCH_ISO};
use crate::store::LocalStore;
use std::collections::HashMap;
use std::sync::Arc;

/// Additional application passes over deferred rows within one cycle.
/// Three passes cover the deepest declared chain
/// (`cart_items → carts → users`).
pub const MAX_DEFERRED_PASSES: usize = 3;

/// Progress callback: (current table index, table count, table).
pub type ProgressFn = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Outcome of the initial pull pass.
#[derive(Debug, Default)]
pub struct PullReport {
    /// Rows durably applied, per table.
    pub applied: HashMap<String, usize>,
    /// Rows parked for the retry loop, per table.
    pub deferred: HashMap<String, usize>,
}

impl PullReport {
    pub fn total_applied(&self) -> usize {
        self.applied.values().sum()
    }
}

/// Rows of one table that could not be applied yet, plus the watermark
/// the table may advance to once they all land.
#[derive(Debug)]
struct TableDeferred {
    rows: Vec<Document>,
    candidate_watermark: Option<String>,
    /// First-pass rows that failed outright. Non-zero withholds the
    /// watermark even when every deferred row later resolves, so the
    /// failed rows are re-fetched next cycle.
    failed: usize,
}

/// Deferred rows accumulated during a cycle. Never persisted; abandoned
/// rows are re-fetched next cycle because their watermark stayed put.
#[derive(Debug, Default)]
pub struct DeferredSet {
    tables: HashMap<String, TableDeferred>,
}

impl DeferredSet {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn total_rows(&self) -> usize {
        self.tables.values().map(|t| t.rows.len()).sum()
    }

    pub fn count_for(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, |t| t.rows.len())
    }
}

/// How a single row application ended.
enum RowApply {
    Applied { updated_at: Option<String> },
    /// Skipped by local-pending-wins; still counts toward the watermark.
    Skipped { updated_at: Option<String> },
    Deferred,
    Failed(String),
}

pub struct PullEngine {
    local: Arc<LocalStore>,
    outbox: Arc<OutboxStore>,
    watermarks: Arc<WatermarkStore>,
    remote: Arc<dyn RemoteTable>,
    tables: &'static [&'static str],
    progress: Option<ProgressFn>,
}

impl PullEngine {
    pub fn new(
        local: Arc<LocalStore>,
        outbox: Arc<OutboxStore>,
        watermarks: Arc<WatermarkStore>,
        remote: Arc<dyn RemoteTable>,
    ) -> Self {
        Self {
            local,
            outbox,
            watermarks,
            remote,
            tables: SYNC_TABLES,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Override the table order. Exists for tests that need to provoke
    /// out-of-order arrival; production always uses the catalog.
    pub fn with_tables(mut self, tables: &'static [&'static str]) -> Self {
        self.tables = tables;
        self
    }

    /// One incremental pull over every synced table. Returns the report
    /// and the deferred rows for [`PullEngine::retry_deferred`].
    pub async fn pull(&self) -> SyncResult<(PullReport, DeferredSet)> {
        let mut report = PullReport::default();
        let mut deferred_set = DeferredSet::default();

        for (i, table) in self.tables.iter().enumerate() {
            if let Some(progress) = &self.progress {
                progress(i + 1, self.tables.len(), table);
            }

            let watermark = self.watermarks.get(table)?;
            let rows = match self.remote.select_since(table, &watermark).await {
                Ok(rows) => rows,
                Err(RemoteError::Unauthorized) => return Err(SyncError::Unauthorized),
                Err(err) => {
                    // Table-level fetch failure: watermark untouched, the
                    // next cycle retries this window.
                    tracing::warn!(table, %err, "Pull fetch failed; skipping table");
                    continue;
                }
            };

            let mut applied = 0usize;
            let mut failed = 0usize;
            let mut deferred: Vec<Document> = Vec::new();
            let mut max_applied: Option<String> = None;

            for row in rows {
                // The remote query is inclusive (`>=`) so equal-timestamp
                // rows are never missed; anything at or below the stored
                // watermark was already applied in a previous cycle.
                if watermark != EPOCH_ISO {
                    if let Some(ts) = row.updated_at_iso() {
                        if ts <= watermark.as_str() {
                            continue;
                        }
                    }
                }

                match self.apply_row(table, &row) {
                    RowApply::Applied { updated_at } => {
                        applied += 1;
                        bump_max(&mut max_applied, updated_at);
                    }
                    RowApply::Skipped { updated_at } => {
                        bump_max(&mut max_applied, updated_at);
                    }
                    RowApply::Deferred => deferred.push(row),
                    RowApply::Failed(err) => {
                        failed += 1;
                        tracing::warn!(table, %err, "Row application failed");
                    }
                }
            }

            tracing::debug!(
                table,
                applied,
                deferred = deferred.len(),
                failed,
                "Pull table pass complete"
            );
            report.applied.insert((*table).to_string(), applied);

            if deferred.is_empty() && failed == 0 {
                if let Some(max) = max_applied {
                    self.watermarks.set(table, &max)?;
                }
            } else if !deferred.is_empty() {
                report
                    .deferred
                    .insert((*table).to_string(), deferred.len());
                deferred_set.tables.insert(
                    (*table).to_string(),
                    TableDeferred {
                        rows: deferred,
                        candidate_watermark: max_applied,
                        failed,
                    },
                );
            }
            // failed > 0 with nothing deferred: watermark simply withheld.
        }

        Ok((report, deferred_set))
    }

    /// Bounded retry over deferred rows, in catalog order. A table whose
    /// rows all land gets its watermark advanced (including the retried
    /// rows) unless its first pass also had outright failures, in which
    /// case the watermark stays put and the failed window is re-fetched
    /// next cycle. Returns the surviving rows and the number applied
    /// during retries.
    pub fn retry_deferred(&self, mut set: DeferredSet) -> SyncResult<(DeferredSet, usize)> {
        let mut retried = 0usize;

        for pass in 1..=MAX_DEFERRED_PASSES {
            if set.is_empty() {
                break;
            }

            let mut next = DeferredSet::default();
            let mut progressed = false;

            for table in self.tables {
                let Some(entry) = set.tables.remove(*table) else {
                    continue;
                };
                let TableDeferred {
                    rows,
                    mut candidate_watermark,
                    failed,
                } = entry;

                let mut still_deferred = Vec::new();
                for row in rows {
                    match self.apply_row(table, &row) {
                        RowApply::Applied { updated_at } => {
                            progressed = true;
                            retried += 1;
                            bump_max(&mut candidate_watermark, updated_at);
                        }
                        RowApply::Skipped { updated_at } => {
                            progressed = true;
                            bump_max(&mut candidate_watermark, updated_at);
                        }
                        RowApply::Deferred => still_deferred.push(row),
                        RowApply::Failed(err) => {
                            tracing::warn!(table, pass, %err, "Deferred row failed");
                            still_deferred.push(row);
                        }
                    }
                }

                if still_deferred.is_empty() {
                    if failed == 0 {
                        if let Some(max) = candidate_watermark {
                            self.watermarks.set(table, &max)?;
                        }
                        tracing::debug!(table, pass, "Deferred rows resolved");
                    } else {
                        tracing::warn!(
                            table,
                            pass,
                            failed,
                            "Deferred rows resolved; earlier row failures withhold the watermark"
                        );
                    }
                } else {
                    next.tables.insert(
                        (*table).to_string(),
                        TableDeferred {
                            rows: still_deferred,
                            candidate_watermark,
                            failed,
                        },
                    );
                }
            }

            set = next;
            // A pass that resolved nothing will not start resolving later.
            if !progressed {
                break;
            }
        }

        for (table, entry) in &set.tables {
            tracing::warn!(
                table,
                remaining = entry.rows.len(),
                "Deferred rows exhausted retries; watermark withheld"
            );
        }
        Ok((set, retried))
    }

    /// Apply one remote row locally. Shared by the initial pass and the
    /// retry loop.
    fn apply_row(&self, table: &str, row: &Document) -> RowApply {
        let Some(id) = row.id() else {
            return RowApply::Failed(format!("row without id in '{table}'"));
        };
        let updated_at = row.updated_at_iso().map(str::to_string);

        // Local-pending-wins: an un-pushed local edit beats any incoming
        // remote snapshot, unconditionally.
        match self.outbox.has_pending_for_row(table, id) {
            Ok(true) => {
                tracing::debug!(table, id, "Skipping remote row; local edit pending");
                return RowApply::Skipped { updated_at };
            }
            Ok(false) => {}
            Err(err) => return RowApply::Failed(err.to_string()),
        }

        // Tombstones write the full row too, so they get the same
        // normalization as live rows (a dangling reference would
        // otherwise defer the delete forever).
        let mut doc = row.clone();
        let result = match normalize(table, &mut doc, &self.local) {
            Ok(()) if doc.is_tombstone() => {
                let deleted_at = doc
                    .get_str("deleted_at")
                    .map(str::to_string)
                    .unwrap_or_else(|| updated_at.clone().unwrap_or_default());
                self.local.apply_tombstone(table, &doc, &deleted_at)
            }
            Ok(()) => self.local.upsert(table, &doc),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => RowApply::Applied { updated_at },
            Err(SyncError::ForeignKey { .. }) => RowApply::Deferred,
            Err(err) => RowApply::Failed(err.to_string()),
        }
    }
}

fn bump_max(max: &mut Option<String>, candidate: Option<String>) {
    if let Some(ts) = candidate {
        if max.as_deref().is_none_or(|m| ts.as_str() > m) {
            *max = Some(ts);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
