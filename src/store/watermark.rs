//! Per-table pull watermarks.
//!
//! One row per synced table: the `updated_at_iso` of the newest remote
//! row that was durably applied locally. Only the pull engine writes
//! here, and only after a table's batch finished with zero deferred
//! rows; that rule is what keeps a dependency gap from being skipped
//! silently.

use crate::error::SyncResult;
use crate::store::LocalStore;
use std::sync::Arc;

/// ISO-8601 epoch; the default watermark for a table never synced.
pub const EPOCH_ISO: &str = "1970-01-01T00:00:00.000Z";

/// SQLite-backed watermark store, sharing the device database.
pub struct WatermarkStore {
    store: Arc<LocalStore>,
}

impl WatermarkStore {
    pub fn new(store: Arc<LocalStore>) -> SyncResult<Self> {
        store.connection().execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_state (
                table_name   TEXT PRIMARY KEY,
                last_sync_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { store })
    }

    /// Stored watermark, or the epoch when the table was never synced.
    pub fn get(&self, table: &str) -> SyncResult<String> {
        let conn = self.store.connection();
        let result: Result<String, _> = conn.query_row(
            "SELECT last_sync_at FROM sync_state WHERE table_name = ?1",
            [table],
            |row| row.get(0),
        );
        match result {
            Ok(wm) => Ok(wm),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(EPOCH_ISO.to_string()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set(&self, table: &str, last_sync_at: &str) -> SyncResult<()> {
        self.store.connection().execute(
            "INSERT INTO sync_state (table_name, last_sync_at) VALUES (?1, ?2)
             ON CONFLICT(table_name) DO UPDATE SET last_sync_at = excluded.last_sync_at",
            rusqlite::params![table, last_sync_at],
        )?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────
