//! Sync engine: orchestration of one Push → Pull → Deferred-Retry cycle.
//!
//! A single [`SyncEngine`] instance owns all mutable sync state (the
//! single-flight latch, the status snapshot, the subscriber lists), so
//! nothing lives in module-level globals. Cycles never overlap: a
//! trigger while a cycle runs is a no-op that reports "already in
//! progress" instead of queuing. `run_cycle` never panics out and never
//! returns `Err`; every failure lands in the [`CycleOutcome`] and in the
//! status snapshot, and the engine is back at idle afterwards.

pub mod normalize;
pub mod pull;
pub mod push;
pub mod sanitize;
pub mod status;
pub mod tables;

pub use pull::{DeferredSet, PullEngine, PullReport, MAX_DEFERRED_PASSES};
pub use push::{PushEngine, PushReport};
pub use status::{CycleOutcome, StatusHub, SyncProgress, SyncStatus, SyncStep};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::remote::{PostgrestClient, RemoteTable};
use crate::store::outbox::OutboxStore;
use crate::store::watermark::WatermarkStore;
use crate::store::LocalStore;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct SyncEngine {
    local: Arc<LocalStore>,
    outbox: Arc<OutboxStore>,
    watermarks: Arc<WatermarkStore>,
    /// `None` when no remote credentials are configured; cycles then
    /// abort with the configuration error instead of panicking.
    remote: Option<Arc<dyn RemoteTable>>,
    hub: Arc<StatusHub>,
    running: AtomicBool,
}

impl SyncEngine {
    /// Build an engine over an already-open local store.
    pub fn new(
        local: Arc<LocalStore>,
        remote: Option<Arc<dyn RemoteTable>>,
    ) -> anyhow::Result<Self> {
        let outbox = Arc::new(OutboxStore::new(local.clone())?);
        let watermarks = Arc::new(WatermarkStore::new(local.clone())?);
        Ok(Self {
            local,
            outbox,
            watermarks,
            remote,
            hub: Arc::new(StatusHub::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Build an engine from configuration (the binary's entry point).
    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let local = Arc::new(LocalStore::open(&config.database_path())?);
        let remote: Option<Arc<dyn RemoteTable>> = if config.is_configured() {
            let url = config.remote_url.as_deref().unwrap_or_default();
            let key = config.api_key.as_deref().unwrap_or_default();
            Some(Arc::new(PostgrestClient::new(url, key)?))
        } else {
            None
        };
        Self::new(local, remote)
    }

    /// Outbox handle for repository write paths.
    pub fn outbox(&self) -> &Arc<OutboxStore> {
        &self.outbox
    }

    pub fn status(&self) -> SyncStatus {
        self.hub.snapshot()
    }

    /// Register a status listener; pair with [`SyncEngine::unsubscribe`].
    pub fn subscribe(&self, listener: Box<dyn Fn(&SyncStatus) + Send + Sync>) -> u64 {
        self.hub.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.hub.unsubscribe(id)
    }

    /// Fires once per successful cycle; consumers refresh cached views.
    pub fn on_cycle_complete(&self, callback: Box<dyn Fn() + Send + Sync>) -> u64 {
        self.hub.on_cycle_complete(callback)
    }

    pub fn remove_cycle_complete(&self, id: u64) {
        self.hub.remove_cycle_complete(id)
    }

    /// Run one full sync cycle. `reason` is observability-only.
    pub async fn run_cycle(&self, reason: &str) -> CycleOutcome {
        // Single-flight: only one transition into "running" may succeed.
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(reason, "Sync already in progress; trigger ignored");
            return CycleOutcome::failed(SyncError::AlreadyRunning.to_string());
        }
        let _guard = RunningGuard { engine: self };

        tracing::info!(reason, "Sync cycle starting");
        let pending = self.outbox.count().unwrap_or(0);
        self.hub.update(|s| {
            s.is_running = true;
            s.current_step = SyncStep::CheckingConnectivity;
            s.last_error = None;
            s.pending_count = pending;
        });

        let outcome = self.run_sequence().await;

        match &outcome {
            CycleOutcome {
                success: true,
                did_work,
                ..
            } => {
                let pending = self.outbox.count().unwrap_or(0);
                self.hub.update(|s| {
                    s.last_sync_at = Some(Utc::now());
                    s.pending_count = pending;
                });
                self.hub.emit_cycle_complete();
                tracing::info!(reason, did_work, "Sync cycle complete");
            }
            CycleOutcome { error, .. } => {
                let message = error.clone();
                self.hub.update(|s| s.last_error = message);
                tracing::warn!(reason, error = ?outcome.error, "Sync cycle failed");
            }
        }

        outcome
    }

    /// The fallible part of a cycle, isolated so `run_cycle` can fold any
    /// error into the outcome and still release the latch via the guard.
    async fn run_sequence(&self) -> CycleOutcome {
        let Some(remote) = self.remote.clone() else {
            return CycleOutcome::failed(SyncError::NotConfigured.to_string());
        };

        if !remote.health_check().await {
            return CycleOutcome::failed(SyncError::Offline.to_string());
        }

        // Push local mutations first so the pull below sees our edits as
        // already-remote instead of skipping them forever.
        let hub = self.hub.clone();
        self.hub
            .update(|s| s.current_step = SyncStep::Pushing);
        let push_engine = PushEngine::new(
            self.local.clone(),
            self.outbox.clone(),
            remote.clone(),
        )
        .with_progress(Arc::new(move |current, total, table| {
            hub.update(|s| {
                s.progress = SyncProgress {
                    total,
                    current,
                    table: Some(table.to_string()),
                };
            });
        }));

        let push_report = match push_engine.push().await {
            Ok(report) => report,
            Err(err) => return CycleOutcome::failed(err.to_string()),
        };

        let hub = self.hub.clone();
        self.hub.update(|s| {
            s.current_step = SyncStep::Pulling;
            s.progress = SyncProgress::default();
        });
        let pull_engine = PullEngine::new(
            self.local.clone(),
            self.outbox.clone(),
            self.watermarks.clone(),
            remote,
        )
        .with_progress(Arc::new(move |current, total, table| {
            hub.update(|s| {
                s.progress = SyncProgress {
                    total,
                    current,
                    table: Some(table.to_string()),
                };
            });
        }));

        let (pull_report, deferred) = match pull_engine.pull().await {
            Ok(result) => result,
            Err(err) => return CycleOutcome::failed(err.to_string()),
        };

        let (remaining, retried) = if deferred.is_empty() {
            (deferred, 0)
        } else {
            self.hub
                .update(|s| s.current_step = SyncStep::RetryingDeferred);
            match pull_engine.retry_deferred(deferred) {
                Ok(result) => result,
                Err(err) => return CycleOutcome::failed(err.to_string()),
            }
        };

        if !remaining.is_empty() {
            // Not a cycle failure: the withheld watermarks make the next
            // cycle re-fetch these rows.
            tracing::warn!(
                remaining = remaining.total_rows(),
                "Cycle finished with unresolved deferred rows"
            );
        }

        CycleOutcome {
            success: true,
            did_work: push_report.pushed > 0 || pull_report.total_applied() > 0 || retried > 0,
            error: None,
        }
    }
}

/// Releases the single-flight latch and restores the idle status on every
/// exit path, including early returns.
struct RunningGuard<'a> {
    engine: &'a SyncEngine,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.engine.hub.update(|s| {
            s.is_running = false;
            s.current_step = SyncStep::Idle;
            s.progress = SyncProgress::default();
        });
        self.engine.running.store(false, Ordering::SeqCst);
    }
}

// ── Tests ───────────────────────────────────────────────────────
