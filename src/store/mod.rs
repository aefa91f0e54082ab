//! Local persistence layer.
//!
//! - [`LocalStore`]: table-agnostic adapter over the device SQLite
//!   database. The engine never knows per-table column sets at compile
//!   time; incoming rows are filtered against `PRAGMA table_info` so a
//!   remote schema that is ahead of the device never breaks a write.
//! - [`outbox`]: durable, ordered log of local mutations awaiting upload.
//! - [`watermark`]: per-table high-water marks for incremental pull.
//!
//! The outbox and watermark tables live in the same database file as the
//! business tables so a crash mid-cycle cannot split their state.

pub mod outbox;
pub mod watermark;

use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use anyhow::Context;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Table-agnostic adapter over the local SQLite database.
pub struct LocalStore {
    conn: Mutex<Connection>,
    /// `PRAGMA table_info` results, cached per table for the process
    /// lifetime. The device schema only changes across app restarts.
    columns: Mutex<HashMap<String, Vec<String>>>,
}

impl LocalStore {
    /// Open (or create) the database at `path` with the usual pragmas.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open local DB: {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            columns: Mutex::new(HashMap::new()),
        })
    }

    /// In-memory store for tests and tooling.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory DB")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            columns: Mutex::new(HashMap::new()),
        })
    }

    /// Shared connection handle for the sibling stores in this module.
    pub(crate) fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Column names of a local table, cached. Unknown tables yield an
    /// empty list rather than an error.
    pub fn list_columns(&self, table: &str) -> SyncResult<Vec<String>> {
        if let Some(cols) = self.columns.lock().get(table) {
            return Ok(cols.clone());
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
        let cols: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        drop(conn);

        self.columns
            .lock()
            .insert(table.to_string(), cols.clone());
        Ok(cols)
    }

    /// Upsert a row by primary key, restricted to locally-known columns.
    ///
    /// Columns in the document that the local schema does not have are
    /// silently dropped (the remote schema may be ahead of this device).
    pub fn upsert(&self, table: &str, doc: &Document) -> SyncResult<()> {
        let id = doc.id().ok_or_else(|| SyncError::MissingId {
            table: table.to_string(),
        })?;
        let known = self.list_columns(table)?;
        if known.is_empty() {
            return Err(SyncError::Remote(format!(
                "local schema has no table '{table}'"
            )));
        }

        let mut cols: Vec<&str> = Vec::new();
        let mut vals: Vec<rusqlite::types::Value> = Vec::new();
        for (key, value) in doc.iter() {
            if known.iter().any(|c| c == key) {
                cols.push(key.as_str());
                vals.push(json_to_sql(value));
            }
        }
        if !cols.iter().any(|c| *c == "id") {
            cols.push("id");
            vals.push(rusqlite::types::Value::Text(id.to_string()));
        }

        let col_list = cols
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=cols.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let set_list = cols
            .iter()
            .filter(|c| **c != "id")
            .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");

        let sql = if set_list.is_empty() {
            format!("INSERT INTO \"{table}\" ({col_list}) VALUES ({placeholders}) ON CONFLICT(id) DO NOTHING")
        } else {
            format!(
                "INSERT INTO \"{table}\" ({col_list}) VALUES ({placeholders}) \
                 ON CONFLICT(id) DO UPDATE SET {set_list}"
            )
        };

        let conn = self.conn.lock();
        conn.execute(&sql, rusqlite::params_from_iter(vals))
            .map_err(|e| classify_sqlite(e, table))?;
        Ok(())
    }

    /// Apply a remote tombstone locally as a soft delete.
    ///
    /// The full remote row is written through the regular upsert path with
    /// the most specific delete marker the local table exposes:
    /// `deleted_at`, else `is_deleted`, else `is_active = 0`. Writing the
    /// whole row (not just the marker) keeps FK-ordering semantics
    /// identical to live rows, so a tombstone for a not-yet-present child
    /// defers like any other row.
    pub fn apply_tombstone(
        &self,
        table: &str,
        row: &Document,
        deleted_at: &str,
    ) -> SyncResult<()> {
        let known = self.list_columns(table)?;
        let mut doc = row.clone();

        if known.iter().any(|c| c == "deleted_at") {
            doc.set("deleted_at", Value::String(deleted_at.to_string()));
        } else if known.iter().any(|c| c == "is_deleted") {
            doc.set("is_deleted", Value::from(1));
        } else if known.iter().any(|c| c == "is_active") {
            doc.set("is_active", Value::from(0));
        } else {
            tracing::warn!(table, "No delete marker column; tombstone stored as-is");
        }
        if known.iter().any(|c| c == "updated_at_iso") && row.updated_at_iso().is_none() {
            doc.set("updated_at_iso", Value::String(deleted_at.to_string()));
        }

        self.upsert(table, &doc)
    }

    /// Whether a row with this primary key exists (tombstoned or not).
    pub fn row_exists(&self, table: &str, id: &str) -> SyncResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{table}\" WHERE id = ?1"),
            [id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Fetch a full local row as a document. Used by the push engine to
    /// recover a missing remote parent.
    pub fn fetch_row(&self, table: &str, id: &str) -> SyncResult<Option<Document>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT * FROM \"{table}\" WHERE id = ?1"))?;
        let names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut rows = stmt.query([id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let mut doc = Document::new();
        for (i, name) in names.iter().enumerate() {
            doc.set(name, sql_to_json(row.get_ref(i)?));
        }
        Ok(Some(doc))
    }
}

/// Map a SQLite error to the engine taxonomy: foreign-key constraint
/// failures become [`SyncError::ForeignKey`] so the pull engine can defer
/// the row instead of failing the batch.
fn classify_sqlite(err: rusqlite::Error, table: &str) -> SyncError {
    if is_fk_violation(&err) {
        return SyncError::ForeignKey {
            table: table.to_string(),
        };
    }
    SyncError::Store(err)
}

/// SQLite reports FK failures as a constraint violation whose message
/// names the FOREIGN KEY clause.
pub fn is_fk_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, msg) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && msg
                    .as_deref()
                    .is_some_and(|m| m.contains("FOREIGN KEY"))
        }
        _ => false,
    }
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sql::Integer(i)
            } else {
                Sql::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Sql::Text(s.clone()),
        // Nested structures are stored as JSON text.
        other => Sql::Text(other.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{doc, store_with_schema};
    use serde_json::json;

    #[test]
    fn upsert_inserts_then_updates() {
        let store = store_with_schema();
        store
            .upsert("users", &doc(json!({"id": "u1", "name": "Asha", "pin": "1234"})))
            .unwrap();
        store
            .upsert("users", &doc(json!({"id": "u1", "name": "Asha K."})))
            .unwrap();

        let row = store.fetch_row("users", "u1").unwrap().unwrap();
        assert_eq!(row.get_str("name"), Some("Asha K."));
        // Untouched column survives the partial update.
        assert_eq!(row.get_str("pin"), Some("1234"));
    }

    #[test]
    fn upsert_drops_unknown_columns() {
        let store = store_with_schema();
        store
            .upsert(
                "users",
                &doc(json!({"id": "u1", "name": "Asha", "server_only_col": "x"})),
            )
            .unwrap();
        let row = store.fetch_row("users", "u1").unwrap().unwrap();
        assert!(!row.contains_key("server_only_col"));
    }

    #[test]
    fn upsert_missing_id_is_an_error() {
        let store = store_with_schema();
        let err = store
            .upsert("users", &doc(json!({"name": "nobody"})))
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingId { .. }));
    }

    #[test]
    fn fk_violation_is_classified() {
        let store = store_with_schema();
        let err = store
            .upsert(
                "products",
                &doc(json!({"id": "p1", "name": "Tea", "category_id": "missing"})),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::ForeignKey { ref table } if table == "products"));
    }

    #[test]
    fn tombstone_prefers_deleted_at() {
        let store = store_with_schema();
        store
            .upsert("categories", &doc(json!({"id": "c1", "name": "Drinks"})))
            .unwrap();
        store
            .apply_tombstone(
                "categories",
                &doc(json!({"id": "c1", "name": "Drinks"})),
                "2026-02-01T00:00:00Z",
            )
            .unwrap();

        let row = store.fetch_row("categories", "c1").unwrap().unwrap();
        assert_eq!(row.get_str("deleted_at"), Some("2026-02-01T00:00:00Z"));
    }

    #[test]
    fn tombstone_falls_back_to_is_active() {
        let store = store_with_schema();
        store
            .upsert("users", &doc(json!({"id": "u1", "name": "Asha"})))
            .unwrap();
        store
            .apply_tombstone(
                "users",
                &doc(json!({"id": "u1", "name": "Asha"})),
                "2026-02-01T00:00:00Z",
            )
            .unwrap();

        // The users fixture has no deleted_at column; is_active is the marker.
        let row = store.fetch_row("users", "u1").unwrap().unwrap();
        assert_eq!(row.get_i64("is_active"), Some(0));
    }

    #[test]
    fn list_columns_unknown_table_is_empty() {
        let store = store_with_schema();
        assert!(store.list_columns("no_such_table").unwrap().is_empty());
    }

    #[test]
    fn fetch_row_round_trips_types() {
        let store = store_with_schema();
        store
            .upsert(
                "products",
                &doc(json!({"id": "p1", "name": "Tea", "price_cents": 250})),
            )
            .unwrap();
        let row = store.fetch_row("products", "p1").unwrap().unwrap();
        assert_eq!(row.get_i64("price_cents"), Some(250));
        assert_eq!(row.get_str("name"), Some("Tea"));
        assert!(store.fetch_row("products", "nope").unwrap().is_none());
    }
}
