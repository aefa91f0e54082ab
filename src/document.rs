//! Loosely-typed row documents.
//!
//! The engine treats every synced table polymorphically: a row is a JSON
//! object keyed by column name. Typed accessors exist only where a
//! table-specific normalization hook needs them; the generic push/pull
//! paths never deserialize into per-table structs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single row as an opaque column → value document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(pub Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Parse from a JSON object value. Non-object values are rejected.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String accessor; `null` and missing both read as `None`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    /// The row's primary key. Every synced table keys on `id`.
    pub fn id(&self) -> Option<&str> {
        self.get_str("id")
    }

    /// The incremental-pull cursor column.
    pub fn updated_at_iso(&self) -> Option<&str> {
        self.get_str("updated_at_iso")
    }

    /// A row with `deleted_at` present (and non-null) is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        matches!(self.0.get("deleted_at"), Some(v) if !v.is_null())
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Whether `key` is absent or explicitly `null`.
    pub fn is_missing_or_null(&self, key: &str) -> bool {
        match self.0.get(key) {
            None => true,
            Some(v) => v.is_null(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ── Tests ───────────────────────────────────────────────────────
