//! Shared test fixtures: the local schema and an in-memory remote.

use crate::document::Document;
use crate::remote::{RemoteError, RemoteTable};
use crate::store::LocalStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Build a document from a JSON literal.
pub fn doc(value: Value) -> Document {
    Document::from_value(value).expect("fixture row must be a JSON object")
}

/// In-memory local store with the POS schema the engine syncs.
///
/// Mirrors the production table catalog: `users` has no `deleted_at`
/// column on purpose (its delete marker is `is_active`), `cart_items`
/// carries a NOT NULL FK to exercise deferral.
pub fn store_with_schema() -> LocalStore {
    let store = LocalStore::open_in_memory().unwrap();
    store
        .connection()
        .execute_batch(
            "CREATE TABLE users (
                id              TEXT PRIMARY KEY,
                name            TEXT,
                pin             TEXT,
                role            TEXT,
                is_active       INTEGER NOT NULL DEFAULT 1,
                cached_pin_hash TEXT,
                updated_at      INTEGER,
                updated_at_iso  TEXT
            );
            CREATE TABLE categories (
                id             TEXT PRIMARY KEY,
                name           TEXT,
                deleted_at     TEXT,
                updated_at     INTEGER,
                updated_at_iso TEXT
            );
            CREATE TABLE products (
                id                TEXT PRIMARY KEY,
                name              TEXT,
                price_cents       INTEGER,
                category_id       TEXT REFERENCES categories(id),
                local_image_path  TEXT,
                needs_label_print INTEGER,
                deleted_at        TEXT,
                updated_at        INTEGER,
                updated_at_iso    TEXT
            );
            CREATE TABLE expenses (
                id             TEXT PRIMARY KEY,
                user_id        TEXT REFERENCES users(id),
                category       TEXT,
                amount_cents   INTEGER,
                deleted_at     TEXT,
                updated_at     INTEGER,
                updated_at_iso TEXT
            );
            CREATE TABLE settlements (
                id             TEXT PRIMARY KEY,
                user_id        TEXT REFERENCES users(id),
                total_cents    INTEGER,
                created_at     INTEGER,
                created_at_iso TEXT,
                deleted_at     TEXT,
                updated_at     INTEGER,
                updated_at_iso TEXT
            );
            CREATE TABLE carts (
                id              TEXT PRIMARY KEY,
                user_id         TEXT REFERENCES users(id),
                total_cents     INTEGER,
                is_open_locally INTEGER,
                created_at      INTEGER,
                created_at_iso  TEXT,
                deleted_at      TEXT,
                updated_at      INTEGER,
                updated_at_iso  TEXT
            );
            CREATE TABLE cart_items (
                id             TEXT PRIMARY KEY,
                cart_id        TEXT NOT NULL REFERENCES carts(id),
                product_id     TEXT REFERENCES products(id),
                qty            INTEGER,
                deleted_at     TEXT,
                updated_at     INTEGER,
                updated_at_iso TEXT
            );",
        )
        .unwrap();
    store
}

/// Pauses `health_check` until the test releases it, so single-flight
/// behavior can be observed deterministically.
pub struct HealthGate {
    entered: Arc<Semaphore>,
    release: Arc<Semaphore>,
}

impl HealthGate {
    /// Wait until a health check is blocked inside the gate.
    pub async fn entered(&self) {
        self.entered.acquire().await.unwrap().forget();
    }

    /// Let the blocked health check proceed.
    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

/// In-memory `RemoteTable` with switchable failure modes.
pub struct MockRemote {
    tables: Mutex<HashMap<String, BTreeMap<String, Document>>>,
    /// (child table, fk column, parent table) rules enforced on upsert.
    fk_rules: Mutex<Vec<(String, String, String)>>,
    /// Rows whose upsert always fails with the given message.
    row_failures: Mutex<HashMap<(String, String), String>>,
    /// Tables whose select always fails with the given message.
    table_failures: Mutex<HashMap<String, String>>,
    op_log: Mutex<Vec<String>>,
    authorized: AtomicBool,
    reachable: AtomicBool,
    gate: Mutex<Option<(Arc<Semaphore>, Arc<Semaphore>)>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            fk_rules: Mutex::new(Vec::new()),
            row_failures: Mutex::new(HashMap::new()),
            table_failures: Mutex::new(HashMap::new()),
            op_log: Mutex::new(Vec::new()),
            authorized: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            gate: Mutex::new(None),
        }
    }

    /// Place a row directly into remote storage (no checks, no log).
    pub fn seed(&self, table: &str, row: &Document) {
        let id = row.id().expect("seeded row needs an id").to_string();
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(id, row.clone());
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Document> {
        self.tables.lock().get(table)?.get(id).cloned()
    }

    /// Chronological log of write operations, e.g. `upsert users/u1`.
    pub fn op_log(&self) -> Vec<String> {
        self.op_log.lock().clone()
    }

    /// Enforce a foreign key on upserts into `child`.
    pub fn require_parent(&self, child: &str, fk_column: &str, parent: &str) {
        self.fk_rules.lock().push((
            child.to_string(),
            fk_column.to_string(),
            parent.to_string(),
        ));
    }

    pub fn fail_row(&self, table: &str, id: &str, message: &str) {
        self.row_failures
            .lock()
            .insert((table.to_string(), id.to_string()), message.to_string());
    }

    pub fn fail_table(&self, table: &str, message: &str) {
        self.table_failures
            .lock()
            .insert(table.to_string(), message.to_string());
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Install a gate that blocks the next health check.
    pub fn gate_health_check(&self) -> HealthGate {
        let entered = Arc::new(Semaphore::new(0));
        let release = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some((entered.clone(), release.clone()));
        HealthGate { entered, release }
    }

    fn check_auth(&self) -> Result<(), RemoteError> {
        if self.authorized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Unauthorized)
        }
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTable for MockRemote {
    async fn upsert(&self, table: &str, row: &Document) -> Result<(), RemoteError> {
        self.check_auth()?;
        let id = row
            .id()
            .ok_or_else(|| RemoteError::Other("row without id".into()))?
            .to_string();

        if let Some(message) = self.row_failures.lock().get(&(table.to_string(), id.clone())) {
            return Err(RemoteError::Other(message.clone()));
        }

        // FK enforcement, mimicking Postgres: a non-null reference to a
        // missing parent row rejects the write.
        for (child, fk_column, parent) in self.fk_rules.lock().iter() {
            if child != table {
                continue;
            }
            if let Some(parent_id) = row.get_str(fk_column) {
                let tables = self.tables.lock();
                let parent_exists = tables
                    .get(parent)
                    .is_some_and(|rows| rows.contains_key(parent_id));
                if !parent_exists {
                    return Err(RemoteError::ForeignKey {
                        referenced_table: parent.clone(),
                    });
                }
            }
        }

        // Merge semantics, like PostgREST's resolution=merge-duplicates.
        let mut tables = self.tables.lock();
        let slot = tables
            .entry(table.to_string())
            .or_default()
            .entry(id.clone())
            .or_insert_with(Document::new);
        for (key, value) in row.iter() {
            slot.set(key, value.clone());
        }
        drop(tables);

        self.op_log.lock().push(format!("upsert {table}/{id}"));
        Ok(())
    }

    async fn select_since(
        &self,
        table: &str,
        watermark: &str,
    ) -> Result<Vec<Document>, RemoteError> {
        self.check_auth()?;
        if let Some(message) = self.table_failures.lock().get(table) {
            return Err(RemoteError::Other(message.clone()));
        }

        let mut rows: Vec<Document> = self
            .tables
            .lock()
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| row.updated_at_iso().is_none_or(|ts| ts >= watermark))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.updated_at_iso().cmp(&b.updated_at_iso()));
        Ok(rows)
    }

    async fn update_tombstone(
        &self,
        table: &str,
        id: &str,
        deleted_at: &str,
    ) -> Result<(), RemoteError> {
        self.check_auth()?;
        let mut tables = self.tables.lock();
        let slot = tables
            .entry(table.to_string())
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| doc(serde_json::json!({ "id": id })));
        slot.set("deleted_at", Value::String(deleted_at.to_string()));
        slot.set("updated_at_iso", Value::String(deleted_at.to_string()));
        drop(tables);

        self.op_log.lock().push(format!("tombstone {table}/{id}"));
        Ok(())
    }

    async fn health_check(&self) -> bool {
        let gate = self.gate.lock().take();
        if let Some((entered, release)) = gate {
            entered.add_permits(1);
            release.acquire().await.unwrap().forget();
        }
        self.reachable.load(Ordering::SeqCst)
    }
}
