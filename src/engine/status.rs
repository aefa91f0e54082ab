//! Sync status snapshots and the subscriber hub.
//!
//! The engine owns one [`StatusHub`]; consumers subscribe for status
//! snapshots and cycle-completion signals. Subscribers are read-only
//! observers: they receive clones and can never mutate engine state.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Step the engine is currently executing (for progress display).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    Idle,
    CheckingConnectivity,
    Pushing,
    Pulling,
    RetryingDeferred,
}

/// Fine-grained progress inside a step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncProgress {
    pub total: usize,
    pub current: usize,
    /// Table being processed, when meaningful for the step.
    pub table: Option<String>,
}

/// Snapshot of the engine state, cloned out to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub is_running: bool,
    pub current_step: SyncStep,
    pub progress: SyncProgress,
    pub last_error: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Outbox entries still awaiting upload.
    pub pending_count: i64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            is_running: false,
            current_step: SyncStep::Idle,
            progress: SyncProgress::default(),
            last_error: None,
            last_sync_at: None,
            pending_count: 0,
        }
    }
}

/// Result of one `run_cycle` invocation. The engine never panics or
/// returns `Err` out of a cycle; failures land here.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub success: bool,
    /// Whether anything was pushed or applied.
    pub did_work: bool,
    pub error: Option<String>,
}

impl CycleOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            did_work: false,
            error: Some(error.into()),
        }
    }
}

type StatusListener = Box<dyn Fn(&SyncStatus) + Send + Sync>;
type CompletionListener = Box<dyn Fn() + Send + Sync>;

/// Owns the status snapshot and the subscriber registries.
///
/// Updates clone the new snapshot out before notifying, so listeners run
/// without holding the status lock.
pub struct StatusHub {
    status: Mutex<SyncStatus>,
    listeners: Mutex<Vec<(u64, StatusListener)>>,
    completions: Mutex<Vec<(u64, CompletionListener)>>,
    next_id: AtomicU64,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHub {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(SyncStatus::default()),
            listeners: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.status.lock().clone()
    }

    /// Mutate the status and broadcast the new snapshot.
    pub fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        let snapshot = {
            let mut status = self.status.lock();
            f(&mut status);
            status.clone()
        };
        for (_, listener) in self.listeners.lock().iter() {
            listener(&snapshot);
        }
    }

    /// Register a status listener; returns a token for unsubscribing.
    pub fn subscribe(&self, listener: StatusListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    /// Register a callback fired once per successful cycle (consumers use
    /// this to refresh cached views).
    pub fn on_cycle_complete(&self, callback: CompletionListener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.completions.lock().push((id, callback));
        id
    }

    pub fn remove_cycle_complete(&self, id: u64) {
        self.completions.lock().retain(|(cid, _)| *cid != id);
    }

    pub fn emit_cycle_complete(&self) {
        for (_, callback) in self.completions.lock().iter() {
            callback();
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
