//! Remote table client.
//!
//! The engine only needs four operations against the backend, all scoped
//! to one named table, so the seam is a small async trait. Production
//! uses [`postgrest::PostgrestClient`]; tests substitute an in-memory
//! fake. Errors carry enough structure for the engine to tell a
//! foreign-key ordering problem from a credentials problem from plain
//! bad luck.

pub mod postgrest;

use crate::document::Document;
use async_trait::async_trait;
use thiserror::Error;

pub use postgrest::PostgrestClient;

/// Structured remote failure, classified for the engine's recovery rules.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The write was rejected because a referenced parent row is missing.
    /// `referenced_table` names the parent table when the backend reports
    /// it; the push engine uses it to recover transparently.
    #[error("remote foreign key violation referencing '{referenced_table}'")]
    ForeignKey { referenced_table: String },

    /// Credentials rejected. Fatal for the rest of the cycle.
    #[error("remote rejected credentials")]
    Unauthorized,

    /// Anything else: transport failures, 5xx, malformed responses.
    #[error("remote failure: {0}")]
    Other(String),
}

/// Generic capability to read and write one named remote table.
#[async_trait]
pub trait RemoteTable: Send + Sync {
    /// Upsert a row keyed by `id` (merge on conflict).
    async fn upsert(&self, table: &str, row: &Document) -> Result<(), RemoteError>;

    /// All rows with `updated_at_iso >= watermark`, ascending.
    async fn select_since(
        &self,
        table: &str,
        watermark: &str,
    ) -> Result<Vec<Document>, RemoteError>;

    /// Soft-delete: set `deleted_at` / `updated_at_iso` on the remote row.
    async fn update_tombstone(
        &self,
        table: &str,
        id: &str,
        deleted_at: &str,
    ) -> Result<(), RemoteError>;

    /// Cheap reachability probe. `false` means "treat as offline".
    async fn health_check(&self) -> bool;
}
