//! Sync error taxonomy.
//!
//! The engine distinguishes five classes of failure with very different
//! recovery policies:
//!
//! - **Offline**: the remote is unreachable. Abort the cycle before any
//!   state changes, report "offline".
//! - **NotConfigured**: no remote credentials. Sync stays disabled until
//!   the operator reconfigures.
//! - **Unauthorized**: the remote rejected our credentials. Abort the
//!   remaining push immediately; outbox entries are kept, not failed.
//! - **ForeignKey**: an ordering problem, not a true failure. Recovered
//!   via the push retry-once and the pull deferred-retry loop.
//! - Everything else is a row-level data error: logged, attempt count
//!   incremented, the rest of the batch continues.

use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Remote backend unreachable. The cycle aborts with no state change.
    #[error("remote unreachable (offline)")]
    Offline,

    /// No remote URL / API key configured. Sync is disabled until fixed.
    #[error("sync is not configured (missing remote URL or API key)")]
    NotConfigured,

    /// Remote rejected our credentials. Fatal for the current cycle.
    #[error("remote rejected credentials")]
    Unauthorized,

    /// A foreign-key constraint failed, locally or remotely.
    #[error("foreign key violation referencing table '{table}'")]
    ForeignKey { table: String },

    /// A sync cycle is already running (single-flight guard).
    #[error("a sync cycle is already in progress")]
    AlreadyRunning,

    /// A payload without a usable primary key cannot be applied anywhere.
    #[error("row for table '{table}' has no primary key")]
    MissingId { table: String },

    #[error("local store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Generic remote-side failure (non-auth, non-FK).
    #[error("remote error: {0}")]
    Remote(String),
}

impl SyncError {
    /// Whether this error must abort the whole cycle rather than just the
    /// row that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Offline | SyncError::NotConfigured | SyncError::Unauthorized
        )
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(SyncError::Offline.is_fatal());
        assert!(SyncError::NotConfigured.is_fatal());
        assert!(SyncError::Unauthorized.is_fatal());
        assert!(!SyncError::ForeignKey {
            table: "users".into()
        }
        .is_fatal());
        assert!(!SyncError::Remote("boom".into()).is_fatal());
    }

    #[test]
    fn display_names_referenced_table() {
        let err = SyncError::ForeignKey {
            table: "categories".into(),
        };
        assert!(err.to_string().contains("categories"));
    }
}
