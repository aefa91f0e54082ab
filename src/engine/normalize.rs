//! Table-specific normalization of pulled rows.
//!
//! The generic pull path stays schema-less; the few places where a table
//! needs real semantics before a local write are gathered here, keyed by
//! table name:
//!
//! - `products`: a `category_id` pointing at a category this device has
//!   never seen (deleted remotely before we ever pulled it) is nulled so
//!   the optional FK does not reject the row.
//! - `expenses`: legacy category vocabulary from older app builds is
//!   remapped to the current one.
//! - `users`: the incoming `pin` is merged only when it passes the 4–6
//!   digit format check; otherwise the locally stored value is kept.

use crate::document::Document;
use crate::error::SyncResult;
use crate::store::LocalStore;
use serde_json::Value;

/// Legacy → current expense category names.
const LEGACY_EXPENSE_CATEGORIES: &[(&str, &str)] = &[
    ("misc", "other"),
    ("sundry", "other"),
    ("wage", "payroll"),
    ("stock", "inventory"),
];

/// Normalize a pulled live row in place before the local upsert.
pub fn normalize(table: &str, doc: &mut Document, local: &LocalStore) -> SyncResult<()> {
    match table {
        "products" => null_dangling_category(doc, local),
        "expenses" => {
            remap_legacy_category(doc);
            Ok(())
        }
        "users" => merge_pin(doc, local),
        _ => Ok(()),
    }
}

fn null_dangling_category(doc: &mut Document, local: &LocalStore) -> SyncResult<()> {
    let Some(category_id) = doc.get_str("category_id").map(str::to_string) else {
        return Ok(());
    };
    if !local.row_exists("categories", &category_id)? {
        tracing::debug!(
            product = doc.id().unwrap_or("?"),
            category_id,
            "Nulling dangling category reference"
        );
        doc.set("category_id", Value::Null);
    }
    Ok(())
}

fn remap_legacy_category(doc: &mut Document) {
    let Some(category) = doc.get_str("category") else {
        return;
    };
    if let Some((_, current)) = LEGACY_EXPENSE_CATEGORIES
        .iter()
        .find(|(legacy, _)| *legacy == category)
    {
        doc.set("category", Value::String((*current).to_string()));
    }
}

/// A PIN is 4–6 ASCII digits. Anything else coming from the remote is
/// treated as corrupt and the local value wins.
fn is_valid_pin(pin: &str) -> bool {
    (4..=6).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit())
}

fn merge_pin(doc: &mut Document, local: &LocalStore) -> SyncResult<()> {
    let incoming_ok = doc.get_str("pin").is_some_and(is_valid_pin);
    if incoming_ok {
        return Ok(());
    }

    let local_pin = match doc.id() {
        Some(id) => local
            .fetch_row("users", id)?
            .and_then(|row| row.get_str("pin").map(str::to_string)),
        None => None,
    };
    match local_pin {
        Some(pin) => doc.set("pin", Value::String(pin)),
        None => {
            doc.remove("pin");
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{doc, store_with_schema};
    use serde_json::json;

    #[test]
    fn dangling_category_is_nulled() {
        let store = store_with_schema();
        let mut row = doc(json!({"id": "p1", "name": "Tea", "category_id": "gone"}));
        normalize("products", &mut row, &store).unwrap();
        assert!(row.is_missing_or_null("category_id"));
    }

    #[test]
    fn present_category_is_kept() {
        let store = store_with_schema();
        store
            .upsert("categories", &doc(json!({"id": "c1", "name": "Drinks"})))
            .unwrap();

        let mut row = doc(json!({"id": "p1", "name": "Tea", "category_id": "c1"}));
        normalize("products", &mut row, &store).unwrap();
        assert_eq!(row.get_str("category_id"), Some("c1"));
    }

    #[test]
    fn legacy_expense_categories_remapped() {
        let store = store_with_schema();
        let mut row = doc(json!({"id": "e1", "category": "sundry"}));
        normalize("expenses", &mut row, &store).unwrap();
        assert_eq!(row.get_str("category"), Some("other"));

        let mut current = doc(json!({"id": "e2", "category": "rent"}));
        normalize("expenses", &mut current, &store).unwrap();
        assert_eq!(current.get_str("category"), Some("rent"));
    }

    #[test]
    fn valid_incoming_pin_is_accepted() {
        let store = store_with_schema();
        store
            .upsert("users", &doc(json!({"id": "u1", "name": "Asha", "pin": "1234"})))
            .unwrap();

        let mut row = doc(json!({"id": "u1", "name": "Asha", "pin": "567890"}));
        normalize("users", &mut row, &store).unwrap();
        assert_eq!(row.get_str("pin"), Some("567890"));
    }

    #[test]
    fn malformed_pin_preserves_local_value() {
        let store = store_with_schema();
        store
            .upsert("users", &doc(json!({"id": "u1", "name": "Asha", "pin": "1234"})))
            .unwrap();

        let mut row = doc(json!({"id": "u1", "name": "Asha", "pin": "abc!"}));
        normalize("users", &mut row, &store).unwrap();
        assert_eq!(row.get_str("pin"), Some("1234"));
    }

    #[test]
    fn malformed_pin_without_local_row_is_dropped() {
        let store = store_with_schema();
        let mut row = doc(json!({"id": "u9", "name": "New", "pin": "12"}));
        normalize("users", &mut row, &store).unwrap();
        assert!(!row.contains_key("pin"));
    }

    #[test]
    fn pin_format_check() {
        assert!(is_valid_pin("1234"));
        assert!(is_valid_pin("123456"));
        assert!(!is_valid_pin("123"));
        assert!(!is_valid_pin("1234567"));
        assert!(!is_valid_pin("12a4"));
    }
}
