//! Durable outbox of local mutations awaiting upload.
//!
//! Every local write path appends here; only the push engine consumes.
//! Entries are deleted only after the remote confirms the write, so
//! delivery is at-least-once. Failures increment `attempts` and record
//! `last_error`, leaving the entry in place for the next cycle.

use crate::document::Document;
use crate::error::SyncResult;
use crate::store::LocalStore;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Mutation kind carried by an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxOp {
    Upsert,
    Delete,
}

impl OutboxOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "delete" => Self::Delete,
            _ => Self::Upsert,
        }
    }
}

/// One pending local mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub table_name: String,
    pub row_id: String,
    pub op: OutboxOp,
    /// Full row snapshot at mutation time (opaque column → value).
    pub payload: Document,
    pub created_at: String,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// SQLite-backed outbox, sharing the device database.
pub struct OutboxStore {
    store: Arc<LocalStore>,
}

impl OutboxStore {
    pub fn new(store: Arc<LocalStore>) -> SyncResult<Self> {
        store.connection().execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_outbox (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                table_name  TEXT NOT NULL,
                row_id      TEXT NOT NULL,
                op          TEXT NOT NULL,
                payload     TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                attempts    INTEGER NOT NULL DEFAULT 0,
                last_error  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_row
                ON sync_outbox(table_name, row_id);",
        )?;
        Ok(Self { store })
    }

    /// Append a mutation. Called by repository write paths.
    pub fn enqueue(
        &self,
        table: &str,
        row_id: &str,
        op: OutboxOp,
        payload: &Document,
    ) -> SyncResult<i64> {
        let payload_json = serde_json::to_string(payload)?;
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.store.connection();
        conn.execute(
            "INSERT INTO sync_outbox (table_name, row_id, op, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![table, row_id, op.as_str(), payload_json, created_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All pending entries, oldest first. Entries for the same row keep
    /// their creation order; id breaks same-millisecond ties.
    pub fn list_pending(&self) -> SyncResult<Vec<OutboxEntry>> {
        let conn = self.store.connection();
        let mut stmt = conn.prepare(
            "SELECT id, table_name, row_id, op, payload, created_at, attempts, last_error
             FROM sync_outbox ORDER BY created_at ASC, id ASC",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut out = Vec::with_capacity(entries.len());
        for (id, table_name, row_id, op, payload, created_at, attempts, last_error) in entries {
            out.push(OutboxEntry {
                id,
                table_name,
                row_id,
                op: OutboxOp::from_str_lossy(&op),
                payload: serde_json::from_str(&payload)?,
                created_at,
                attempts,
                last_error,
            });
        }
        Ok(out)
    }

    /// Remove an entry after its remote application was confirmed.
    pub fn delete(&self, entry_id: i64) -> SyncResult<()> {
        self.store
            .connection()
            .execute("DELETE FROM sync_outbox WHERE id = ?1", [entry_id])?;
        Ok(())
    }

    /// Record a failed attempt; the entry stays for the next cycle.
    pub fn increment_attempts(&self, entry_id: i64, error: &str) -> SyncResult<()> {
        self.store.connection().execute(
            "UPDATE sync_outbox SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
            rusqlite::params![entry_id, error],
        )?;
        Ok(())
    }

    pub fn count(&self) -> SyncResult<i64> {
        let count = self
            .store
            .connection()
            .query_row("SELECT COUNT(*) FROM sync_outbox", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Whether this exact row has an un-pushed local mutation. The pull
    /// engine uses this for the local-pending-wins skip.
    pub fn has_pending_for_row(&self, table: &str, row_id: &str) -> SyncResult<bool> {
        let count: i64 = self.store.connection().query_row(
            "SELECT COUNT(*) FROM sync_outbox WHERE table_name = ?1 AND row_id = ?2",
            rusqlite::params![table, row_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{doc, store_with_schema};
    use serde_json::json;

    fn outbox() -> OutboxStore {
        OutboxStore::new(Arc::new(store_with_schema())).unwrap()
    }

    #[test]
    fn enqueue_and_list_in_order() {
        let outbox = outbox();
        outbox
            .enqueue("users", "u1", OutboxOp::Upsert, &doc(json!({"id": "u1"})))
            .unwrap();
        outbox
            .enqueue("products", "p1", OutboxOp::Delete, &doc(json!({"id": "p1"})))
            .unwrap();

        let pending = outbox.list_pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].row_id, "u1");
        assert_eq!(pending[0].op, OutboxOp::Upsert);
        assert_eq!(pending[1].op, OutboxOp::Delete);
    }

    #[test]
    fn same_row_entries_keep_creation_order() {
        let outbox = outbox();
        outbox
            .enqueue("users", "u1", OutboxOp::Upsert, &doc(json!({"id": "u1", "v": 1})))
            .unwrap();
        outbox
            .enqueue("users", "u1", OutboxOp::Upsert, &doc(json!({"id": "u1", "v": 2})))
            .unwrap();

        let pending = outbox.list_pending().unwrap();
        assert_eq!(pending[0].payload.get_i64("v"), Some(1));
        assert_eq!(pending[1].payload.get_i64("v"), Some(2));
    }

    #[test]
    fn delete_removes_entry() {
        let outbox = outbox();
        let id = outbox
            .enqueue("users", "u1", OutboxOp::Upsert, &doc(json!({"id": "u1"})))
            .unwrap();
        assert_eq!(outbox.count().unwrap(), 1);

        outbox.delete(id).unwrap();
        assert_eq!(outbox.count().unwrap(), 0);
    }

    #[test]
    fn increment_attempts_records_error() {
        let outbox = outbox();
        let id = outbox
            .enqueue("users", "u1", OutboxOp::Upsert, &doc(json!({"id": "u1"})))
            .unwrap();

        outbox.increment_attempts(id, "409 conflict").unwrap();
        outbox.increment_attempts(id, "timeout").unwrap();

        let pending = outbox.list_pending().unwrap();
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[0].last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn pending_for_row_is_exact() {
        let outbox = outbox();
        outbox
            .enqueue("users", "u1", OutboxOp::Upsert, &doc(json!({"id": "u1"})))
            .unwrap();

        assert!(outbox.has_pending_for_row("users", "u1").unwrap());
        assert!(!outbox.has_pending_for_row("users", "u2").unwrap());
        assert!(!outbox.has_pending_for_row("products", "u1").unwrap());
    }
}
